//! Reconciliation Poller
//!
//! Fallback for observers without a push channel: fetches the full
//! snapshot on an interval, diffs it against the previous one, and
//! synthesizes the same per-node changes the push path would have
//! delivered. Polling is suspended while push is available.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::broadcast::FullState;
use crate::error::{Error, Result};
use crate::model::{AsnInfo, FleetStats, Node, NodeStatus};

/// Shared HTTP client for snapshot polling
static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create HTTP client")
});

/// Source of full-state snapshots to poll against
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<FullState>;
}

/// Polls the engine's HTTP snapshot endpoint
pub struct HttpSnapshotSource {
    base_url: String,
}

impl HttpSnapshotSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self) -> Result<FullState> {
        let url = format!("{}/api/snapshot", self.base_url);
        let response = HTTP_CLIENT
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "snapshot endpoint returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }
}

/// Observed attributes of one node, compared between polls.
///
/// Matches what the push path reports: liveness plus the drift-prone
/// network attributes. `last_seen` churn alone is not a change.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PolledView {
    status: NodeStatus,
    ipv4: Option<String>,
    ipv6: Option<String>,
    asn: AsnInfo,
}

impl PolledView {
    fn of(node: &Node) -> Self {
        Self {
            status: node.status,
            ipv4: node.ipv4.clone(),
            ipv6: node.ipv6.clone(),
            asn: node.asn.clone(),
        }
    }
}

/// Changes synthesized from one poll cycle
#[derive(Debug, Default)]
pub struct PollDiff {
    /// Nodes whose observed attributes changed, plus new nodes
    pub changed: Vec<Node>,
    /// Agent ids present last poll but missing now
    pub removed: Vec<String>,
    /// Current aggregate stats
    pub stats: FleetStats,
}

impl PollDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Interval-driven snapshot differ
pub struct ReconciliationPoller {
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    push_available: AtomicBool,
    last: Mutex<Option<HashMap<String, PolledView>>>,
}

impl ReconciliationPoller {
    pub fn new(source: Arc<dyn SnapshotSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            push_available: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Gate polling on push availability. While push is up the poller
    /// idles; when push drops it resumes, and the first poll after a
    /// gap reports every node as changed so the observer resyncs.
    pub fn set_push_available(&self, available: bool) {
        let was = self.push_available.swap(available, Ordering::SeqCst);
        if was != available {
            tracing::info!(
                "push channel {}; polling {}",
                if available { "available" } else { "unavailable" },
                if available { "suspended" } else { "active" }
            );
        }
    }

    pub fn push_available(&self) -> bool {
        self.push_available.load(Ordering::SeqCst)
    }

    /// Run one poll cycle.
    ///
    /// Returns `None` when polling is suspended. The first cycle (or
    /// the first after a fetch failure reset) treats the entire
    /// snapshot as changed.
    pub async fn tick(&self) -> Result<Option<PollDiff>> {
        if self.push_available() {
            // Drop the baseline so the next active poll resyncs fully
            *self.last.lock().await = None;
            return Ok(None);
        }

        let snapshot = self.source.fetch().await?;
        let current: HashMap<String, PolledView> = snapshot
            .nodes
            .iter()
            .map(|n| (n.agent_id.clone(), PolledView::of(n)))
            .collect();

        let mut last = self.last.lock().await;
        let mut diff = PollDiff {
            stats: snapshot.stats,
            ..PollDiff::default()
        };

        match last.as_ref() {
            None => {
                diff.changed = snapshot.nodes;
            }
            Some(previous) => {
                for node in snapshot.nodes {
                    if previous.get(&node.agent_id) != Some(&PolledView::of(&node)) {
                        diff.changed.push(node);
                    }
                }
                for agent_id in previous.keys() {
                    if !current.contains_key(agent_id) {
                        diff.removed.push(agent_id.clone());
                    }
                }
                diff.removed.sort();
            }
        }

        *last = Some(current);
        Ok(Some(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use chrono::Utc;
    use tokio::sync::RwLock;

    struct FixedSource {
        state: RwLock<FullState>,
    }

    impl FixedSource {
        fn new(nodes: Vec<Node>) -> Self {
            let stats = FleetStats::compute(nodes.iter());
            Self {
                state: RwLock::new(FullState { nodes, stats }),
            }
        }

        async fn set(&self, nodes: Vec<Node>) {
            let stats = FleetStats::compute(nodes.iter());
            *self.state.write().await = FullState { nodes, stats };
        }
    }

    #[async_trait]
    impl SnapshotSource for FixedSource {
        async fn fetch(&self) -> Result<FullState> {
            Ok(self.state.read().await.clone())
        }
    }

    fn node(agent_id: &str, status: NodeStatus) -> Node {
        let mut n = Node::new(
            agent_id.into(),
            format!("node {}", agent_id),
            Location::default(),
            "ovh".into(),
            Utc::now(),
        );
        n.status = status;
        n
    }

    #[tokio::test]
    async fn test_first_poll_reports_everything() {
        let source = Arc::new(FixedSource::new(vec![
            node("a1", NodeStatus::Online),
            node("b2", NodeStatus::Offline),
        ]));
        let poller = ReconciliationPoller::new(source, Duration::from_secs(5));

        let diff = poller.tick().await.unwrap().unwrap();
        assert_eq!(diff.changed.len(), 2);
        assert_eq!(diff.stats.total_nodes, 2);
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_quiet() {
        let source = Arc::new(FixedSource::new(vec![node("a1", NodeStatus::Online)]));
        let poller = ReconciliationPoller::new(source, Duration::from_secs(5));

        poller.tick().await.unwrap();
        let diff = poller.tick().await.unwrap().unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_status_change_detected() {
        let source = Arc::new(FixedSource::new(vec![node("a1", NodeStatus::Online)]));
        let poller = ReconciliationPoller::new(Arc::clone(&source) as _, Duration::from_secs(5));

        poller.tick().await.unwrap();
        source.set(vec![node("a1", NodeStatus::Unknown)]).await;

        let diff = poller.tick().await.unwrap().unwrap();
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].status, NodeStatus::Unknown);
    }

    #[tokio::test]
    async fn test_removed_node_reported() {
        let source = Arc::new(FixedSource::new(vec![
            node("a1", NodeStatus::Online),
            node("b2", NodeStatus::Online),
        ]));
        let poller = ReconciliationPoller::new(Arc::clone(&source) as _, Duration::from_secs(5));

        poller.tick().await.unwrap();
        source.set(vec![node("a1", NodeStatus::Online)]).await;

        let diff = poller.tick().await.unwrap().unwrap();
        assert!(diff.changed.is_empty());
        assert_eq!(diff.removed, vec!["b2".to_string()]);
    }

    #[tokio::test]
    async fn test_push_available_suspends_and_resyncs() {
        let source = Arc::new(FixedSource::new(vec![node("a1", NodeStatus::Online)]));
        let poller = ReconciliationPoller::new(source, Duration::from_secs(5));

        poller.tick().await.unwrap();

        poller.set_push_available(true);
        assert!(poller.tick().await.unwrap().is_none());

        // Push drops: the baseline was discarded, so everything is
        // reported again
        poller.set_push_available(false);
        let diff = poller.tick().await.unwrap().unwrap();
        assert_eq!(diff.changed.len(), 1);
    }
}
