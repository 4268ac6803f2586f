//! SQLite Persistence
//!
//! Embedded storage for node state, heartbeat history, and the
//! immutable event log.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{AsnInfo, EventLogEntry, HeartbeatRecord, Location, Node};

use super::PersistenceGateway;

/// SQLite-backed persistence gateway.
///
/// The connection sits behind a `Mutex`, not an `RwLock`: rusqlite's
/// `Connection` is `Send` but not `Sync`, and the gateway futures must
/// be `Send` to cross task boundaries.
pub struct SqliteStore {
    /// Database connection
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the store database
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("nodepulse.db");
        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                agent_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                country TEXT,
                city TEXT,
                provider TEXT NOT NULL,
                ipv4 TEXT,
                ipv6 TEXT,
                asn INTEGER NOT NULL,
                asn_name TEXT NOT NULL,
                asn_org TEXT NOT NULL,
                asn_route TEXT NOT NULL,
                asn_type TEXT NOT NULL,
                status TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS heartbeats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                reported_status TEXT NOT NULL,
                uptime_seconds INTEGER NOT NULL,
                system TEXT NOT NULL,
                ipv4 TEXT,
                ipv6 TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_heartbeats_agent
                ON heartbeats(agent_id, timestamp);

            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                type TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_agent
                ON events(agent_id, timestamp DESC, seq DESC);
            "#,
        )?;
        Ok(())
    }

    fn upsert_node_tx(conn: &Connection, node: &Node) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO nodes (
                agent_id, name, country, city, provider, ipv4, ipv6,
                asn, asn_name, asn_org, asn_route, asn_type,
                status, last_seen, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(agent_id) DO UPDATE SET
                name = ?2, country = ?3, city = ?4, provider = ?5,
                ipv4 = ?6, ipv6 = ?7,
                asn = ?8, asn_name = ?9, asn_org = ?10, asn_route = ?11, asn_type = ?12,
                status = ?13, last_seen = ?14
            "#,
            params![
                node.agent_id,
                node.name,
                node.location.country,
                node.location.city,
                node.provider,
                node.ipv4,
                node.ipv6,
                node.asn.asn,
                node.asn.name,
                node.asn.org,
                node.asn.route,
                node.asn.kind,
                node.status.to_string(),
                node.last_seen.to_rfc3339(),
                node.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn append_event_tx(conn: &Connection, entry: &EventLogEntry) -> Result<i64> {
        conn.execute(
            r#"
            INSERT INTO events (id, agent_id, type, message, details, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.id.to_string(),
                entry.agent_id,
                entry.event_type.to_string(),
                entry.message,
                entry.details.to_string(),
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("bad timestamp '{}': {}", text, e)))
}

/// Node row with status and timestamps still in their stored text form
struct RawNode {
    agent_id: String,
    name: String,
    location: Location,
    provider: String,
    ipv4: Option<String>,
    ipv6: Option<String>,
    asn: AsnInfo,
    status: String,
    last_seen: String,
    created_at: String,
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<RawNode> {
    Ok(RawNode {
        agent_id: row.get(0)?,
        name: row.get(1)?,
        location: Location {
            country: row.get(2)?,
            city: row.get(3)?,
        },
        provider: row.get(4)?,
        ipv4: row.get(5)?,
        ipv6: row.get(6)?,
        asn: AsnInfo {
            asn: row.get::<_, i64>(7)? as u32,
            name: row.get(8)?,
            org: row.get(9)?,
            route: row.get(10)?,
            kind: row.get(11)?,
        },
        status: row.get(12)?,
        last_seen: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn finish_node(raw: RawNode) -> Result<Node> {
    let status = match raw.status.as_str() {
        "online" => crate::model::NodeStatus::Online,
        "offline" => crate::model::NodeStatus::Offline,
        "unknown" => crate::model::NodeStatus::Unknown,
        "maintenance" => crate::model::NodeStatus::Maintenance,
        other => {
            return Err(Error::Persistence(format!(
                "node {} has invalid status '{}'",
                raw.agent_id, other
            )))
        }
    };
    Ok(Node {
        agent_id: raw.agent_id,
        name: raw.name,
        location: raw.location,
        provider: raw.provider,
        ipv4: raw.ipv4,
        ipv6: raw.ipv6,
        asn: raw.asn,
        status,
        last_seen: parse_timestamp(&raw.last_seen)?,
        created_at: parse_timestamp(&raw.created_at)?,
    })
}

const NODE_COLUMNS: &str = "agent_id, name, country, city, provider, ipv4, ipv6, \
     asn, asn_name, asn_org, asn_route, asn_type, status, last_seen, created_at";

/// Event row with id, type, and timestamp still in text form
struct RawEvent {
    seq: i64,
    id: String,
    agent_id: String,
    event_type: String,
    message: String,
    details: String,
    timestamp: String,
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        seq: row.get(0)?,
        id: row.get(1)?,
        agent_id: row.get(2)?,
        event_type: row.get(3)?,
        message: row.get(4)?,
        details: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

fn finish_event(raw: RawEvent) -> Result<EventLogEntry> {
    Ok(EventLogEntry {
        id: Uuid::parse_str(&raw.id)
            .map_err(|e| Error::Persistence(format!("bad event id '{}': {}", raw.id, e)))?,
        seq: raw.seq,
        agent_id: raw.agent_id,
        event_type: raw.event_type.parse()?,
        message: raw.message,
        details: serde_json::from_str(&raw.details)?,
        timestamp: parse_timestamp(&raw.timestamp)?,
    })
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn upsert_node(&self, node: &Node) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::upsert_node_tx(&conn, node)
    }

    async fn get_node(&self, agent_id: &str) -> Result<Option<Node>> {
        let conn = self.conn.lock().await;
        let result = conn.query_row(
            &format!("SELECT {} FROM nodes WHERE agent_id = ?1", NODE_COLUMNS),
            params![agent_id],
            row_to_node,
        );

        match result {
            Ok(raw) => Ok(Some(finish_node(raw)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn all_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes ORDER BY agent_id",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_node)?;

        let mut nodes = Vec::new();
        for result in rows {
            nodes.push(finish_node(result?)?);
        }
        Ok(nodes)
    }

    async fn append_heartbeat(&self, record: &HeartbeatRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO heartbeats (
                agent_id, reported_status, uptime_seconds, system, ipv4, ipv6, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.agent_id,
                record.reported_status,
                record.uptime_seconds as i64,
                record.system.to_string(),
                record.network.ipv4,
                record.network.ipv6,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn append_event(&self, entry: &EventLogEntry) -> Result<i64> {
        let conn = self.conn.lock().await;
        Self::append_event_tx(&conn, entry)
    }

    async fn commit_transition(
        &self,
        node: &Node,
        events: &[EventLogEntry],
    ) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        Self::upsert_node_tx(&tx, node)?;
        let mut seqs = Vec::with_capacity(events.len());
        for event in events {
            seqs.push(Self::append_event_tx(&tx, event)?);
        }

        tx.commit()?;
        Ok(seqs)
    }

    async fn events_by_node(
        &self,
        agent_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<EventLogEntry>> {
        let conn = self.conn.lock().await;

        // The cursor is the seq, not the timestamp: per-node timestamps
        // are non-decreasing with insertion order, and a timestamp
        // cursor would drop entries tied at a page boundary.
        let mut entries = Vec::new();
        match before {
            Some(cursor) => {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT seq, id, agent_id, type, message, details, timestamp
                    FROM events
                    WHERE agent_id = ?1 AND seq < ?2
                    ORDER BY timestamp DESC, seq DESC
                    LIMIT ?3
                    "#,
                )?;
                let rows =
                    stmt.query_map(params![agent_id, cursor, limit as i64], row_to_event)?;
                for result in rows {
                    entries.push(finish_event(result?)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT seq, id, agent_id, type, message, details, timestamp
                    FROM events
                    WHERE agent_id = ?1
                    ORDER BY timestamp DESC, seq DESC
                    LIMIT ?2
                    "#,
                )?;
                let rows = stmt.query_map(params![agent_id, limit as i64], row_to_event)?;
                for result in rows {
                    entries.push(finish_event(result?)?);
                }
            }
        }

        Ok(entries)
    }

    async fn heartbeat_count(&self, agent_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM heartbeats WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, NetworkInfo, NodeStatus};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_node(agent_id: &str) -> Node {
        Node::new(
            agent_id.to_string(),
            format!("node {}", agent_id),
            Location {
                country: Some("NL".into()),
                city: Some("Amsterdam".into()),
            },
            "hetzner".to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_node_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().to_path_buf()).unwrap();

        assert!(store.get_node("a1").await.unwrap().is_none());

        let mut node = sample_node("a1");
        node.ipv4 = Some("1.2.3.4".into());
        store.upsert_node(&node).await.unwrap();

        let loaded = store.get_node("a1").await.unwrap().unwrap();
        assert_eq!(loaded.agent_id, "a1");
        assert_eq!(loaded.ipv4.as_deref(), Some("1.2.3.4"));
        assert_eq!(loaded.status, NodeStatus::Online);
        assert!(loaded.asn.is_unknown());

        // Update in place
        node.status = NodeStatus::Offline;
        store.upsert_node(&node).await.unwrap();
        let loaded = store.get_node("a1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::Offline);

        store.upsert_node(&sample_node("b2")).await.unwrap();
        assert_eq!(store.all_nodes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_event_ordering_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        let base = Utc::now();

        for i in 0..5 {
            let entry = EventLogEntry::new(
                "a1",
                EventType::HeartbeatReceived,
                format!("heartbeat {}", i),
                serde_json::json!({}),
                base + chrono::Duration::seconds(i),
            );
            store.append_event(&entry).await.unwrap();
        }

        let events = store.events_by_node("a1", 3, None).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "heartbeat 4");
        assert_eq!(events[2].message, "heartbeat 2");

        // Cursor pagination continues where the window ended
        let older = store
            .events_by_node("a1", 10, Some(events[2].seq))
            .await
            .unwrap();
        assert_eq!(older.len(), 2);
        assert_eq!(older[0].message, "heartbeat 1");
    }

    #[tokio::test]
    async fn test_pagination_across_tied_timestamps() {
        let store = SqliteStore::in_memory().unwrap();
        let base = Utc::now();

        // One older event, then three sharing a timestamp (the sweep
        // writes HEARTBEAT_TIMEOUT and STATUS_CHANGED at the same
        // instant)
        let timestamps = [
            base,
            base + chrono::Duration::seconds(10),
            base + chrono::Duration::seconds(10),
            base + chrono::Duration::seconds(10),
        ];
        for (i, ts) in timestamps.iter().enumerate() {
            let entry = EventLogEntry::new(
                "a1",
                EventType::HeartbeatReceived,
                format!("event {}", i),
                serde_json::json!({}),
                *ts,
            );
            store.append_event(&entry).await.unwrap();
        }

        // Page boundary lands inside the tied group
        let page1 = store.events_by_node("a1", 2, None).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].message, "event 3");
        assert_eq!(page1[1].message, "event 2");

        // The remaining tied entry is not lost
        let page2 = store
            .events_by_node("a1", 10, Some(page1[1].seq))
            .await
            .unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].message, "event 1");
        assert_eq!(page2[1].message, "event 0");
    }

    #[tokio::test]
    async fn test_event_tie_break_by_insertion_order() {
        let store = SqliteStore::in_memory().unwrap();
        let ts = Utc::now();

        for i in 0..3 {
            let entry = EventLogEntry::new(
                "a1",
                EventType::HeartbeatReceived,
                format!("tied {}", i),
                serde_json::json!({}),
                ts,
            );
            store.append_event(&entry).await.unwrap();
        }

        let events = store.events_by_node("a1", 10, None).await.unwrap();
        assert_eq!(events[0].message, "tied 2");
        assert_eq!(events[2].message, "tied 0");
    }

    #[tokio::test]
    async fn test_commit_transition_atomic() {
        let store = SqliteStore::in_memory().unwrap();
        let mut node = sample_node("a1");
        store.upsert_node(&node).await.unwrap();

        node.status = NodeStatus::Unknown;
        let event = EventLogEntry::new(
            "a1",
            EventType::StatusChanged,
            "online -> unknown".into(),
            serde_json::json!({"from": "online", "to": "unknown"}),
            Utc::now(),
        );

        let seqs = store
            .commit_transition(&node, std::slice::from_ref(&event))
            .await
            .unwrap();
        assert_eq!(seqs.len(), 1);

        let loaded = store.get_node("a1").await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::Unknown);

        let events = store.events_by_node("a1", 10, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StatusChanged);
        assert_eq!(events[0].seq, seqs[0]);
    }

    #[test]
    fn test_store_is_send_and_sync() {
        // The engine shares the store as Arc<dyn PersistenceGateway>
        // across spawned tasks
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SqliteStore>();
    }

    #[tokio::test]
    async fn test_shared_store_across_spawned_tasks() {
        let store: Arc<dyn PersistenceGateway> = Arc::new(SqliteStore::in_memory().unwrap());

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.upsert_node(&sample_node(&format!("a{}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.all_nodes().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_heartbeat_append() {
        let store = SqliteStore::in_memory().unwrap();
        let record = HeartbeatRecord {
            agent_id: "a1".into(),
            reported_status: "online".into(),
            uptime_seconds: 3600,
            system: serde_json::json!({"cpu": 12.5, "memory_mb": 2048}),
            network: NetworkInfo {
                ipv4: Some("1.2.3.4".into()),
                ipv6: None,
            },
            timestamp: Utc::now(),
        };

        store.append_heartbeat(&record).await.unwrap();
        store.append_heartbeat(&record).await.unwrap();
        assert_eq!(store.heartbeat_count("a1").await.unwrap(), 2);
        assert_eq!(store.heartbeat_count("b2").await.unwrap(), 0);
    }
}
