//! Status State Machine
//!
//! Owns the canonical status of every node and the transition rules.
//! Nodes live in per-agent cells behind their own mutex: heartbeat
//! processing and the background sweep serialize on the cell, while
//! updates to different nodes proceed fully in parallel. The outer map
//! lock guards only registry shape (lookup and insert).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::model::{FleetStats, Node, NodeStatus};

/// A status change produced by a transition rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: NodeStatus,
    pub to: NodeStatus,
}

/// Shared handle to one node's serialized state
pub type NodeCell = Arc<Mutex<Node>>;

/// Liveness authority for the fleet
pub struct StatusStateMachine {
    nodes: RwLock<HashMap<String, NodeCell>>,
    grace_window: chrono::Duration,
    offline_window: chrono::Duration,
}

impl StatusStateMachine {
    /// Create an empty state machine with the configured windows
    pub fn new(grace_window: std::time::Duration, offline_window: std::time::Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            grace_window: chrono::Duration::from_std(grace_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
            offline_window: chrono::Duration::from_std(offline_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(600)),
        }
    }

    /// Populate the registry from persisted nodes (cold start)
    pub async fn load(&self, nodes: Vec<Node>) {
        let mut map = self.nodes.write().await;
        for node in nodes {
            map.insert(node.agent_id.clone(), Arc::new(Mutex::new(node)));
        }
    }

    /// Insert a newly registered node; fails if the agent_id is taken
    pub async fn insert(&self, node: Node) -> Result<NodeCell> {
        let mut map = self.nodes.write().await;
        if map.contains_key(&node.agent_id) {
            return Err(Error::State(format!(
                "agent {} is already registered",
                node.agent_id
            )));
        }
        let cell = Arc::new(Mutex::new(node.clone()));
        map.insert(node.agent_id, Arc::clone(&cell));
        Ok(cell)
    }

    /// Drop a node from the registry.
    ///
    /// Used to roll back a reservation when the registration commit
    /// fails; there is no operator-facing removal.
    pub async fn remove(&self, agent_id: &str) {
        self.nodes.write().await.remove(agent_id);
    }

    /// Look up the cell for an agent
    pub async fn cell(&self, agent_id: &str) -> Option<NodeCell> {
        self.nodes.read().await.get(agent_id).cloned()
    }

    /// Whether an agent is registered
    pub async fn contains(&self, agent_id: &str) -> bool {
        self.nodes.read().await.contains_key(agent_id)
    }

    /// Snapshot of every cell handle, for the sweep
    pub async fn cells(&self) -> Vec<NodeCell> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Clone of the full current node set
    pub async fn current_nodes(&self) -> Vec<Node> {
        let cells = self.cells().await;
        let mut nodes = Vec::with_capacity(cells.len());
        for cell in cells {
            nodes.push(cell.lock().await.clone());
        }
        nodes.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        nodes
    }

    /// Aggregate stats over the current node set
    pub async fn fleet_stats(&self) -> FleetStats {
        FleetStats::compute(self.current_nodes().await.iter())
    }

    /// Apply an accepted heartbeat to a node.
    ///
    /// Advances `last_seen` and, unless the node is in maintenance,
    /// moves it to `online`. Returns the transition when the stored
    /// status actually changed. The caller must hold the cell lock and
    /// must have rejected stale timestamps already.
    pub fn apply_heartbeat(node: &mut Node, timestamp: DateTime<Utc>) -> Option<Transition> {
        node.last_seen = timestamp;

        // Maintenance is operator territory; heartbeats only refresh liveness
        if node.status == NodeStatus::Maintenance {
            return None;
        }

        let from = node.status;
        if from == NodeStatus::Online {
            return None;
        }
        node.status = NodeStatus::Online;
        Some(Transition {
            from,
            to: NodeStatus::Online,
        })
    }

    /// Evaluate timeout-driven transitions for one node.
    ///
    /// Idempotent: a node already moved for the current silence
    /// produces no further transition until the next window boundary.
    pub fn evaluate_timeout(&self, node: &mut Node, now: DateTime<Utc>) -> Option<Transition> {
        if node.status == NodeStatus::Maintenance {
            return None;
        }

        let silent_for = node.since_last_seen(now);

        match node.status {
            NodeStatus::Online if silent_for > self.grace_window => {
                node.status = NodeStatus::Unknown;
                Some(Transition {
                    from: NodeStatus::Online,
                    to: NodeStatus::Unknown,
                })
            }
            NodeStatus::Unknown if silent_for > self.offline_window => {
                node.status = NodeStatus::Offline;
                Some(Transition {
                    from: NodeStatus::Unknown,
                    to: NodeStatus::Offline,
                })
            }
            _ => None,
        }
    }

    /// Operator entry point: enter or leave maintenance.
    ///
    /// Leaving maintenance lands on `unknown`; the next heartbeat or
    /// sweep pass resolves the true state.
    pub fn set_maintenance(node: &mut Node, enabled: bool) -> Option<Transition> {
        let from = node.status;
        if enabled {
            if from == NodeStatus::Maintenance {
                return None;
            }
            node.status = NodeStatus::Maintenance;
            Some(Transition {
                from,
                to: NodeStatus::Maintenance,
            })
        } else {
            if from != NodeStatus::Maintenance {
                return None;
            }
            node.status = NodeStatus::Unknown;
            Some(Transition {
                from,
                to: NodeStatus::Unknown,
            })
        }
    }
}
