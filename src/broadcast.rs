//! Realtime Broadcaster
//!
//! Pushes status and event deltas to connected observers over a
//! broadcast channel, suppressing no-op notifications against the
//! last-broadcast snapshot. Observers that fall behind lag on their
//! own receiver; fan-out never blocks ingestion.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::model::{AsnInfo, EventLogEntry, FleetStats, Node, NodeStatus};

/// Capacity of the broadcast channel; slow observers beyond this lag out
const BROADCAST_CAPACITY: usize = 1024;

/// Delta message pushed to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    /// A node's status or key attributes changed
    StatusChanged {
        agent_id: String,
        status: NodeStatus,
        node: Node,
        stats: FleetStats,
    },
    /// A new event log entry was recorded
    Event { entry: EventLogEntry },
    /// Aggregate stats changed without a per-node delta
    StatsUpdate { stats: FleetStats },
}

/// Full state message sent to an observer on (re)connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullState {
    pub nodes: Vec<Node>,
    pub stats: FleetStats,
}

/// Last-broadcast view of one node, used for duplicate suppression
#[derive(Debug, Clone, PartialEq, Eq)]
struct BroadcastView {
    status: NodeStatus,
    ipv4: Option<String>,
    ipv6: Option<String>,
    asn: AsnInfo,
}

impl BroadcastView {
    fn of(node: &Node) -> Self {
        Self {
            status: node.status,
            ipv4: node.ipv4.clone(),
            ipv6: node.ipv6.clone(),
            asn: node.asn.clone(),
        }
    }
}

/// Broadcaster statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcasterStats {
    pub published: u64,
    pub suppressed: u64,
}

/// Fan-out hub for status/event deltas.
///
/// The in-memory snapshot starts empty at process start and is
/// discarded at shutdown; a cold start re-synchronizes observers via
/// the full-state message.
pub struct RealtimeBroadcaster {
    tx: broadcast::Sender<Delta>,
    snapshot: RwLock<HashMap<String, BroadcastView>>,
    stats: RwLock<BroadcasterStats>,
}

impl RealtimeBroadcaster {
    /// Create a broadcaster with an empty snapshot
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            snapshot: RwLock::new(HashMap::new()),
            stats: RwLock::new(BroadcasterStats::default()),
        }
    }

    /// Subscribe a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.tx.subscribe()
    }

    /// Number of currently connected observers
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast a status delta unless it matches the last-broadcast
    /// view for this node. Returns whether a delta was published.
    pub async fn publish_status(&self, node: &Node, stats: FleetStats) -> bool {
        let view = BroadcastView::of(node);

        {
            let snapshot = self.snapshot.read().await;
            if snapshot.get(&node.agent_id) == Some(&view) {
                self.stats.write().await.suppressed += 1;
                return false;
            }
        }

        self.snapshot
            .write()
            .await
            .insert(node.agent_id.clone(), view);
        self.stats.write().await.published += 1;

        // Send fails only when no observer is connected; that is fine
        let _ = self.tx.send(Delta::StatusChanged {
            agent_id: node.agent_id.clone(),
            status: node.status,
            node: node.clone(),
            stats,
        });
        true
    }

    /// Broadcast a new event log entry
    pub async fn publish_event(&self, entry: &EventLogEntry) {
        self.stats.write().await.published += 1;
        let _ = self.tx.send(Delta::Event {
            entry: entry.clone(),
        });
    }

    /// Broadcast updated aggregate stats
    pub async fn publish_stats(&self, stats: FleetStats) {
        let _ = self.tx.send(Delta::StatsUpdate { stats });
    }

    /// Current broadcaster counters
    pub async fn stats(&self) -> BroadcasterStats {
        *self.stats.read().await
    }
}

impl Default for RealtimeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use chrono::Utc;

    fn sample_node() -> Node {
        Node::new(
            "a1".into(),
            "alpha".into(),
            Location::default(),
            "ovh".into(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_status_suppressed() {
        let hub = RealtimeBroadcaster::new();
        let mut rx = hub.subscribe();
        let node = sample_node();

        assert!(hub.publish_status(&node, FleetStats::default()).await);
        // Identical view: suppressed
        assert!(!hub.publish_status(&node, FleetStats::default()).await);

        let stats = hub.stats().await;
        assert_eq!(stats.published, 1);
        assert_eq!(stats.suppressed, 1);

        // Exactly one delta on the wire
        assert!(matches!(
            rx.try_recv().unwrap(),
            Delta::StatusChanged { agent_id, .. } if agent_id == "a1"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attribute_change_publishes() {
        let hub = RealtimeBroadcaster::new();
        let mut node = sample_node();

        assert!(hub.publish_status(&node, FleetStats::default()).await);

        // Same status, changed IP: still a delta (key attribute)
        node.ipv4 = Some("5.6.7.8".into());
        assert!(hub.publish_status(&node, FleetStats::default()).await);

        node.status = NodeStatus::Unknown;
        assert!(hub.publish_status(&node, FleetStats::default()).await);
    }

    #[tokio::test]
    async fn test_event_broadcast_reaches_observer() {
        let hub = RealtimeBroadcaster::new();
        let mut rx = hub.subscribe();

        let entry = EventLogEntry::new(
            "a1",
            crate::model::EventType::AgentRegistered,
            "agent a1 registered".into(),
            serde_json::json!({}),
            Utc::now(),
        );
        hub.publish_event(&entry).await;

        match rx.try_recv().unwrap() {
            Delta::Event { entry } => assert_eq!(entry.agent_id, "a1"),
            other => panic!("unexpected delta: {:?}", other),
        }
    }

    #[test]
    fn test_delta_wire_format() {
        let delta = Delta::StatsUpdate {
            stats: FleetStats::default(),
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["type"], "stats_update");
    }
}
