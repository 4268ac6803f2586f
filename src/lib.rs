//! NodePulse - Node Status & Event Propagation Engine
//!
//! A collector service that receives periodic heartbeats from remote
//! monitoring agents, maintains an authoritative liveness status per
//! node, detects network environment drift (IP and ASN changes), and
//! propagates every observable change to connected observers in
//! realtime with a polling fallback.
//!
//! # Architecture
//!
//! Heartbeats flow through a single pipeline: the ingestor validates
//! and resolves the target node, the status state machine applies
//! liveness transitions, the drift detector compares network
//! attributes, and the event recorder commits the node update together
//! with its event log entries in one transaction before anything is
//! pushed to observers. A background sweep demotes nodes that stop
//! reporting.
//!
//! # Features
//!
//! - Per-node liveness state machine (online / unknown / offline /
//!   maintenance) with configurable timeout windows
//! - IP and ASN drift detection with best-effort, bounded lookups
//! - Immutable, append-only event log with cursor pagination
//! - Realtime WebSocket push with duplicate suppression
//! - Snapshot polling fallback for observers without a push channel
//! - Embedded SQLite storage, single-binary deployment

pub mod api;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod model;
pub mod poller;
pub mod store;

pub use config::NodePulseConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broadcast::{Delta, FullState, RealtimeBroadcaster};
    pub use crate::config::NodePulseConfig;
    pub use crate::engine::ingest::{HeartbeatPayload, Registration};
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::model::{EventLogEntry, EventType, Node, NodeStatus};
    pub use crate::store::{PersistenceGateway, SqliteStore};
}
