//! Liveness Engine
//!
//! Wires the ingestor, status state machine, drift detector, event
//! recorder, and broadcaster into one facade, and runs the background
//! sweep that demotes silent nodes.

pub mod drift;
pub mod events;
pub mod ingest;
pub mod status;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::broadcast::{FullState, RealtimeBroadcaster};
use crate::config::NodePulseConfig;
use crate::error::{Error, Result};
use crate::lookup::AsnLookupProvider;
use crate::model::{EventLogEntry, EventType, FleetStats, Node};
use crate::store::PersistenceGateway;

use drift::DriftDetector;
use events::EventRecorder;
use ingest::{Ack, HeartbeatIngestor, HeartbeatPayload, Registration};
use status::StatusStateMachine;

/// Facade over the liveness pipeline
pub struct Engine {
    store: Arc<dyn PersistenceGateway>,
    state: Arc<StatusStateMachine>,
    recorder: Arc<EventRecorder>,
    broadcaster: Arc<RealtimeBroadcaster>,
    ingestor: HeartbeatIngestor,
    sweep_interval: std::time::Duration,
}

impl Engine {
    pub fn new(
        config: &NodePulseConfig,
        store: Arc<dyn PersistenceGateway>,
        lookup: Arc<dyn AsnLookupProvider>,
        broadcaster: Arc<RealtimeBroadcaster>,
    ) -> Self {
        let state = Arc::new(StatusStateMachine::new(
            config.grace_window(),
            config.offline_window(),
        ));
        let recorder = Arc::new(EventRecorder::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
        ));
        let ingestor = HeartbeatIngestor::new(
            Arc::clone(&store),
            Arc::clone(&state),
            DriftDetector::new(lookup),
            Arc::clone(&recorder),
            Arc::clone(&broadcaster),
        );
        Self {
            store,
            state,
            recorder,
            broadcaster,
            ingestor,
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Reload persisted nodes into the registry (cold start).
    ///
    /// Statuses resume from their stored values; the first sweep pass
    /// demotes anything that went silent while the process was down.
    pub async fn bootstrap(&self) -> Result<usize> {
        let nodes = self.store.all_nodes().await?;
        let count = nodes.len();
        self.state.load(nodes).await;
        tracing::info!("loaded {} node(s) from storage", count);
        Ok(count)
    }

    pub async fn register(&self, registration: Registration) -> Result<Node> {
        self.ingestor.register(registration).await
    }

    pub async fn ingest(&self, payload: HeartbeatPayload) -> Result<Ack> {
        self.ingestor.ingest(payload).await
    }

    /// One reconciliation pass over every node.
    ///
    /// Returns the number of nodes demoted. A commit failure for one
    /// node is logged and leaves that node untouched; the pass
    /// continues with the rest.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let mut demoted = Vec::new();

        for cell in self.state.cells().await {
            let mut node = cell.lock().await;

            let Some(transition) = self.state.evaluate_timeout(&mut node, now) else {
                continue;
            };

            let events = vec![
                EventLogEntry::new(
                    &node.agent_id,
                    EventType::HeartbeatTimeout,
                    format!(
                        "no heartbeat from {} for {}s",
                        node.agent_id,
                        node.since_last_seen(now).num_seconds()
                    ),
                    json!({
                        "last_seen": node.last_seen,
                        "elapsed_seconds": node.since_last_seen(now).num_seconds(),
                    }),
                    now,
                ),
                EventLogEntry::new(
                    &node.agent_id,
                    EventType::StatusChanged,
                    format!("status changed from {} to {}", transition.from, transition.to),
                    json!({"from": transition.from, "to": transition.to}),
                    now,
                ),
            ];

            if let Err(e) = self.recorder.commit(&node, events).await {
                // Roll the in-memory status back so memory and storage
                // stay consistent; the next pass retries.
                node.status = transition.from;
                tracing::error!("sweep commit failed for {}: {}", node.agent_id, e);
                continue;
            }

            tracing::info!(
                "node {} demoted: {} -> {}",
                node.agent_id,
                transition.from,
                transition.to
            );
            demoted.push(node.clone());
        }

        // Deltas go out after all cell locks are released
        let count = demoted.len();
        for node in demoted {
            let stats = self.state.fleet_stats().await;
            self.broadcaster.publish_status(&node, stats).await;
        }
        if count > 0 {
            self.broadcaster
                .publish_stats(self.state.fleet_stats().await)
                .await;
        }
        count
    }

    /// Run the reconciliation sweep forever at the configured interval
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let demoted = self.sweep_once(Utc::now()).await;
            if demoted > 0 {
                tracing::debug!("sweep pass demoted {} node(s)", demoted);
            }
        }
    }

    /// Operator toggle for maintenance mode
    pub async fn set_maintenance(&self, agent_id: &str, enabled: bool) -> Result<Node> {
        let cell = self
            .state
            .cell(agent_id)
            .await
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;

        let updated = {
            let mut node = cell.lock().await;
            let Some(transition) = StatusStateMachine::set_maintenance(&mut node, enabled) else {
                return Ok(node.clone());
            };

            let now = Utc::now();
            let event = EventLogEntry::new(
                &node.agent_id,
                EventType::StatusChanged,
                format!("status changed from {} to {}", transition.from, transition.to),
                json!({"from": transition.from, "to": transition.to, "operator": true}),
                now,
            );

            if let Err(e) = self.recorder.commit(&node, vec![event]).await {
                node.status = transition.from;
                return Err(e);
            }
            node.clone()
        };

        let stats = self.state.fleet_stats().await;
        self.broadcaster.publish_status(&updated, stats).await;
        Ok(updated)
    }

    /// Current view of one node
    pub async fn node(&self, agent_id: &str) -> Option<Node> {
        match self.state.cell(agent_id).await {
            Some(cell) => Some(cell.lock().await.clone()),
            None => None,
        }
    }

    /// Current view of the whole fleet, sorted by agent_id
    pub async fn nodes(&self) -> Vec<Node> {
        self.state.current_nodes().await
    }

    pub async fn fleet_stats(&self) -> FleetStats {
        self.state.fleet_stats().await
    }

    /// Full-state message for a newly connected observer
    pub async fn snapshot(&self) -> FullState {
        let nodes = self.state.current_nodes().await;
        let stats = FleetStats::compute(nodes.iter());
        FullState { nodes, stats }
    }

    pub async fn events(
        &self,
        agent_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<EventLogEntry>> {
        if !self.state.contains(agent_id).await {
            return Err(Error::UnknownAgent(agent_id.to_string()));
        }
        self.recorder.list_by_node(agent_id, limit, before).await
    }

    pub async fn heartbeat_count(&self, agent_id: &str) -> Result<u64> {
        self.store.heartbeat_count(agent_id).await
    }

    pub fn broadcaster(&self) -> &Arc<RealtimeBroadcaster> {
        &self.broadcaster
    }
}
