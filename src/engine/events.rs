//! Event Recorder
//!
//! Durable append of event log entries with push delivery to
//! observers. Durability always precedes the broadcast: an entry is
//! visible on the push channel only after it is committed.

use std::sync::Arc;

use crate::broadcast::RealtimeBroadcaster;
use crate::error::Result;
use crate::model::{EventLogEntry, EventType, Node};
use crate::store::PersistenceGateway;

/// Records observable transitions into the immutable event log
pub struct EventRecorder {
    store: Arc<dyn PersistenceGateway>,
    broadcaster: Arc<RealtimeBroadcaster>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn PersistenceGateway>, broadcaster: Arc<RealtimeBroadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Append a standalone entry (no node mutation), then push it.
    ///
    /// HEARTBEAT_RECEIVED entries are recorded durably as the liveness
    /// audit trail but not pushed; observers read them on demand.
    pub async fn record(&self, mut entry: EventLogEntry) -> Result<EventLogEntry> {
        entry.seq = self.store.append_event(&entry).await?;
        self.push(&entry).await;
        Ok(entry)
    }

    /// Commit a node update together with its events in one
    /// transaction, then push the events. Nothing is pushed when the
    /// commit fails, so observers never see a phantom transition.
    pub async fn commit(
        &self,
        node: &Node,
        mut events: Vec<EventLogEntry>,
    ) -> Result<Vec<EventLogEntry>> {
        let seqs = self.store.commit_transition(node, &events).await?;
        for (entry, seq) in events.iter_mut().zip(seqs) {
            entry.seq = seq;
        }
        for entry in &events {
            self.push(entry).await;
        }
        Ok(events)
    }

    /// Read events for a node, newest first, optionally strictly
    /// before a seq cursor
    pub async fn list_by_node(
        &self,
        agent_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<EventLogEntry>> {
        self.store.events_by_node(agent_id, limit, before).await
    }

    async fn push(&self, entry: &EventLogEntry) {
        if entry.event_type != EventType::HeartbeatReceived {
            self.broadcaster.publish_event(entry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Delta;
    use crate::model::Location;
    use crate::store::SqliteStore;
    use chrono::Utc;
    use serde_json::json;

    fn recorder() -> (EventRecorder, Arc<RealtimeBroadcaster>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let broadcaster = Arc::new(RealtimeBroadcaster::new());
        (
            EventRecorder::new(store, Arc::clone(&broadcaster)),
            broadcaster,
        )
    }

    #[tokio::test]
    async fn test_record_assigns_seq_and_pushes() {
        let (recorder, broadcaster) = recorder();
        let mut rx = broadcaster.subscribe();

        let entry = recorder
            .record(EventLogEntry::new(
                "a1",
                EventType::AgentRegistered,
                "agent a1 registered".into(),
                json!({}),
                Utc::now(),
            ))
            .await
            .unwrap();

        assert!(entry.seq > 0);
        assert!(matches!(rx.try_recv().unwrap(), Delta::Event { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_events_not_pushed() {
        let (recorder, broadcaster) = recorder();
        let mut rx = broadcaster.subscribe();

        recorder
            .record(EventLogEntry::new(
                "a1",
                EventType::HeartbeatReceived,
                "heartbeat".into(),
                json!({}),
                Utc::now(),
            ))
            .await
            .unwrap();

        // Durably recorded but nothing on the push channel
        assert!(rx.try_recv().is_err());
        let events = recorder.list_by_node("a1", 10, None).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_writes_node_and_events_together() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let broadcaster = Arc::new(RealtimeBroadcaster::new());
        let recorder = EventRecorder::new(Arc::clone(&store) as _, broadcaster);

        let node = Node::new(
            "a1".into(),
            "alpha".into(),
            Location::default(),
            "ovh".into(),
            Utc::now(),
        );
        let events = vec![EventLogEntry::new(
            "a1",
            EventType::StatusChanged,
            "unknown -> online".into(),
            json!({"from": "unknown", "to": "online"}),
            Utc::now(),
        )];

        let committed = recorder.commit(&node, events).await.unwrap();
        assert_eq!(committed.len(), 1);
        assert!(committed[0].seq > 0);

        assert!(store.get_node("a1").await.unwrap().is_some());
        let stored = recorder.list_by_node("a1", 10, None).await.unwrap();
        assert_eq!(stored.len(), 1);
    }
}
