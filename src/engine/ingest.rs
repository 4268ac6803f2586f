//! Heartbeat Ingestor
//!
//! Validates and normalizes incoming heartbeats, resolves the target
//! node, and drives the status state machine, drift detection, and
//! event recording. All work for one agent happens under that agent's
//! cell lock; the status delta is pushed after the lock is released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::broadcast::RealtimeBroadcaster;
use crate::error::{Error, Result};
use crate::model::{
    EventLogEntry, EventType, HeartbeatRecord, Location, NetworkInfo, Node, NodeStatus,
};
use crate::store::PersistenceGateway;

use super::drift::DriftDetector;
use super::events::EventRecorder;
use super::status::StatusStateMachine;

/// Validated heartbeat ingress payload
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    /// Status string as reported by the agent; stored verbatim
    pub status: String,
    #[serde(default)]
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub network: NetworkInfo,
    /// Opaque resource snapshot; presence-checked only
    #[serde(default)]
    pub system: serde_json::Value,
}

/// Registration payload; must precede heartbeats
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub provider: String,
}

/// Acknowledgment returned to the agent
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub agent_id: String,
    /// False when the heartbeat was acknowledged but not applied
    pub applied: bool,
    pub status: NodeStatus,
}

/// Ingests heartbeats and registrations
pub struct HeartbeatIngestor {
    store: Arc<dyn PersistenceGateway>,
    state: Arc<StatusStateMachine>,
    drift: DriftDetector,
    recorder: Arc<EventRecorder>,
    broadcaster: Arc<RealtimeBroadcaster>,
}

impl HeartbeatIngestor {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        state: Arc<StatusStateMachine>,
        drift: DriftDetector,
        recorder: Arc<EventRecorder>,
        broadcaster: Arc<RealtimeBroadcaster>,
    ) -> Self {
        Self {
            store,
            state,
            drift,
            recorder,
            broadcaster,
        }
    }

    /// Register a new agent.
    ///
    /// Creates the node in `online` status and records
    /// AGENT_REGISTERED. Re-registering a known agent_id updates
    /// display metadata only: status and last_seen belong to the
    /// heartbeat path.
    pub async fn register(&self, registration: Registration) -> Result<Node> {
        if registration.agent_id.is_empty() {
            return Err(Error::MalformedPayload("agent_id cannot be empty".into()));
        }
        if registration.name.is_empty() {
            return Err(Error::MalformedPayload("name cannot be empty".into()));
        }

        if let Some(cell) = self.state.cell(&registration.agent_id).await {
            let mut node = cell.lock().await;
            node.name = registration.name;
            node.location = registration.location;
            node.provider = registration.provider;
            self.store.upsert_node(&node).await?;
            tracing::info!("agent {} re-registered, metadata updated", node.agent_id);
            return Ok(node.clone());
        }

        let now = Utc::now();
        let node = Node::new(
            registration.agent_id,
            registration.name,
            registration.location,
            registration.provider,
            now,
        );

        // Reserve the agent_id before committing so a concurrent
        // registration cannot slip in between.
        self.state.insert(node.clone()).await?;

        let event = EventLogEntry::new(
            &node.agent_id,
            EventType::AgentRegistered,
            format!("agent {} registered", node.agent_id),
            json!({"name": node.name, "provider": node.provider}),
            now,
        );

        if let Err(e) = self.recorder.commit(&node, vec![event]).await {
            self.state.remove(&node.agent_id).await;
            return Err(e);
        }

        let stats = self.state.fleet_stats().await;
        self.broadcaster.publish_status(&node, stats).await;

        tracing::info!("agent {} registered", node.agent_id);
        Ok(node)
    }

    /// Ingest one heartbeat.
    ///
    /// Unknown agents and malformed payloads are rejected; a heartbeat
    /// no newer than the stored last_seen yields `StaleHeartbeat` and
    /// changes nothing.
    pub async fn ingest(&self, payload: HeartbeatPayload) -> Result<Ack> {
        if payload.agent_id.is_empty() {
            return Err(Error::MalformedPayload("agent_id cannot be empty".into()));
        }
        if payload.status.is_empty() {
            return Err(Error::MalformedPayload("status cannot be empty".into()));
        }

        let cell = self
            .state
            .cell(&payload.agent_id)
            .await
            .ok_or_else(|| Error::UnknownAgent(payload.agent_id.clone()))?;

        let (node_for_push, ack) = {
            let mut node = cell.lock().await;

            if payload.timestamp <= node.last_seen {
                return Err(Error::StaleHeartbeat {
                    agent_id: payload.agent_id,
                    reported: payload.timestamp,
                    stored: node.last_seen,
                });
            }

            // The heartbeat record is the liveness proof; persist it
            // even when nothing else changes.
            self.store
                .append_heartbeat(&HeartbeatRecord {
                    agent_id: payload.agent_id.clone(),
                    reported_status: payload.status.clone(),
                    uptime_seconds: payload.uptime_seconds,
                    system: payload.system.clone(),
                    network: payload.network.clone(),
                    timestamp: payload.timestamp,
                })
                .await?;

            let outcome = self
                .drift
                .check(&node, &payload.network, payload.timestamp)
                .await;

            // Stage the full update on a copy; memory is only touched
            // after the commit succeeds.
            let mut updated = node.clone();
            let transition = StatusStateMachine::apply_heartbeat(&mut updated, payload.timestamp);
            outcome.apply(&mut updated);

            let mut events = vec![EventLogEntry::new(
                &updated.agent_id,
                EventType::HeartbeatReceived,
                format!("heartbeat received from {}", updated.agent_id),
                json!({
                    "reported_status": payload.status,
                    "uptime_seconds": payload.uptime_seconds,
                }),
                payload.timestamp,
            )];
            if let Some(transition) = transition {
                events.push(EventLogEntry::new(
                    &updated.agent_id,
                    EventType::StatusChanged,
                    format!("status changed from {} to {}", transition.from, transition.to),
                    json!({"from": transition.from, "to": transition.to}),
                    payload.timestamp,
                ));
            }
            events.extend(outcome.events);

            self.recorder.commit(&updated, events).await?;
            *node = updated.clone();

            let ack = Ack {
                agent_id: updated.agent_id.clone(),
                applied: true,
                status: updated.status,
            };
            (updated, ack)
        };

        // Push outside the cell lock; the broadcaster suppresses
        // no-op deltas itself.
        let stats = self.state.fleet_stats().await;
        self.broadcaster.publish_status(&node_for_push, stats).await;

        Ok(ack)
    }
}
