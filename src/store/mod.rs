//! Persistence Gateway
//!
//! Durable storage for nodes, heartbeat records, and the event log.
//! The engine only talks to the [`PersistenceGateway`] trait; the
//! default implementation is SQLite-backed.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{EventLogEntry, HeartbeatRecord, Node};

/// Durable storage consumed by the engine.
///
/// Heartbeat records and event entries are append-only; nodes are the
/// only mutable rows. `commit_transition` must write the node and its
/// events atomically so a status mutation never lands without its
/// event log entry.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Insert or update a node row
    async fn upsert_node(&self, node: &Node) -> Result<()>;

    /// Read a single node
    async fn get_node(&self, agent_id: &str) -> Result<Option<Node>>;

    /// Read the full current node set
    async fn all_nodes(&self) -> Result<Vec<Node>>;

    /// Append one heartbeat record
    async fn append_heartbeat(&self, record: &HeartbeatRecord) -> Result<()>;

    /// Append one event entry, returning its assigned sequence number
    async fn append_event(&self, entry: &EventLogEntry) -> Result<i64>;

    /// Write a node update and its events in a single transaction,
    /// returning the assigned sequence numbers
    async fn commit_transition(
        &self,
        node: &Node,
        events: &[EventLogEntry],
    ) -> Result<Vec<i64>>;

    /// Read events for a node, newest first, optionally strictly
    /// before a seq cursor
    async fn events_by_node(
        &self,
        agent_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<EventLogEntry>>;

    /// Count stored heartbeat records for a node
    async fn heartbeat_count(&self, agent_id: &str) -> Result<u64>;
}
