//! Core Data Model
//!
//! Node records, heartbeat records, and the immutable event log entries
//! shared by the engine, the store, and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node is reporting heartbeats within the grace window
    Online,
    /// Node has missed heartbeats past the offline window
    Offline,
    /// Node has missed heartbeats past the grace window but may recover
    Unknown,
    /// Operator-set state; heartbeats do not override it
    Maintenance,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Unknown => write!(f, "unknown"),
            NodeStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// ASN attributes resolved for a node's current IP.
///
/// Every field may legitimately hold the `unknown` sentinel when the
/// lookup provider failed or has not yet been consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnInfo {
    /// Autonomous system number (0 when unresolved)
    pub asn: u32,
    /// AS name
    pub name: String,
    /// Organization
    pub org: String,
    /// Announced route covering the IP
    pub route: String,
    /// Network type (isp, hosting, business, ...)
    #[serde(rename = "type")]
    pub kind: String,
}

impl AsnInfo {
    /// Sentinel value used when the lookup provider is unavailable
    pub fn unknown() -> Self {
        Self {
            asn: 0,
            name: "unknown".to_string(),
            org: "unknown".to_string(),
            route: "unknown".to_string(),
            kind: "unknown".to_string(),
        }
    }

    /// Whether this value is the unresolved sentinel
    pub fn is_unknown(&self) -> bool {
        *self == Self::unknown()
    }
}

impl Default for AsnInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Location metadata supplied at registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

/// One registered agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier; immutable and unique across the fleet
    pub agent_id: String,
    /// Display name
    pub name: String,
    /// Location metadata
    pub location: Location,
    /// Hosting provider label
    pub provider: String,
    /// Current IPv4 address as last reported
    pub ipv4: Option<String>,
    /// Current IPv6 address as last reported
    pub ipv6: Option<String>,
    /// ASN attributes for the current IP
    pub asn: AsnInfo,
    /// Current liveness status
    pub status: NodeStatus,
    /// Timestamp of the newest accepted heartbeat; monotonically non-decreasing
    pub last_seen: DateTime<Utc>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Create a freshly registered node in `online` status
    pub fn new(
        agent_id: String,
        name: String,
        location: Location,
        provider: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            name,
            location,
            provider,
            ipv4: None,
            ipv6: None,
            asn: AsnInfo::unknown(),
            status: NodeStatus::Online,
            last_seen: now,
            created_at: now,
        }
    }

    /// Time elapsed since the newest accepted heartbeat
    pub fn since_last_seen(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_seen
    }
}

/// Network attributes reported in a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
}

/// One received heartbeat; append-only, never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub agent_id: String,
    /// Status string as reported by the agent, stored verbatim
    pub reported_status: String,
    pub uptime_seconds: u64,
    /// Opaque resource snapshot (CPU/memory/disk/process counts)
    pub system: serde_json::Value,
    pub network: NetworkInfo,
    pub timestamp: DateTime<Utc>,
}

/// Kind of an event log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AgentRegistered,
    StatusChanged,
    IpChanged,
    AsnChanged,
    HeartbeatReceived,
    HeartbeatTimeout,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::AgentRegistered => write!(f, "AGENT_REGISTERED"),
            EventType::StatusChanged => write!(f, "STATUS_CHANGED"),
            EventType::IpChanged => write!(f, "IP_CHANGED"),
            EventType::AsnChanged => write!(f, "ASN_CHANGED"),
            EventType::HeartbeatReceived => write!(f, "HEARTBEAT_RECEIVED"),
            EventType::HeartbeatTimeout => write!(f, "HEARTBEAT_TIMEOUT"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "AGENT_REGISTERED" => Ok(EventType::AgentRegistered),
            "STATUS_CHANGED" => Ok(EventType::StatusChanged),
            "IP_CHANGED" => Ok(EventType::IpChanged),
            "ASN_CHANGED" => Ok(EventType::AsnChanged),
            "HEARTBEAT_RECEIVED" => Ok(EventType::HeartbeatReceived),
            "HEARTBEAT_TIMEOUT" => Ok(EventType::HeartbeatTimeout),
            other => Err(crate::error::Error::State(format!(
                "unknown event type: {}",
                other
            ))),
        }
    }
}

/// One observable transition; immutable once written.
///
/// Ordering within a node is by `timestamp`, ties broken by `seq`
/// (insertion order assigned by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Uuid,
    /// Store-assigned insertion order; 0 until persisted
    #[serde(default)]
    pub seq: i64,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    /// Type-specific payload, e.g. `{from, to}` for STATUS_CHANGED
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventLogEntry {
    /// Build a new entry with a fresh id
    pub fn new(
        agent_id: &str,
        event_type: EventType,
        message: String,
        details: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            agent_id: agent_id.to_string(),
            event_type,
            message,
            details,
            timestamp,
        }
    }
}

/// Aggregate fleet statistics served in snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStats {
    pub total_nodes: usize,
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
    pub maintenance: usize,
    /// Distinct countries across registered nodes
    pub countries: usize,
    /// Distinct providers across registered nodes
    pub providers: usize,
}

impl FleetStats {
    /// Compute stats over a node set
    pub fn compute<'a, I: IntoIterator<Item = &'a Node>>(nodes: I) -> Self {
        let mut stats = FleetStats::default();
        let mut countries = std::collections::HashSet::new();
        let mut providers = std::collections::HashSet::new();

        for node in nodes {
            stats.total_nodes += 1;
            match node.status {
                NodeStatus::Online => stats.online += 1,
                NodeStatus::Offline => stats.offline += 1,
                NodeStatus::Unknown => stats.unknown += 1,
                NodeStatus::Maintenance => stats.maintenance += 1,
            }
            if let Some(country) = &node.location.country {
                countries.insert(country.clone());
            }
            providers.insert(node.provider.clone());
        }

        stats.countries = countries.len();
        stats.providers = providers.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::Online).unwrap(),
            "\"online\""
        );
        let status: NodeStatus = serde_json::from_str("\"maintenance\"").unwrap();
        assert_eq!(status, NodeStatus::Maintenance);
    }

    #[test]
    fn test_asn_unknown_sentinel() {
        let asn = AsnInfo::unknown();
        assert!(asn.is_unknown());
        assert_eq!(asn.asn, 0);

        let resolved = AsnInfo {
            asn: 13335,
            name: "CLOUDFLARENET".into(),
            org: "Cloudflare, Inc.".into(),
            route: "1.1.1.0/24".into(),
            kind: "hosting".into(),
        };
        assert!(!resolved.is_unknown());
    }

    #[test]
    fn test_event_type_roundtrip() {
        for t in [
            EventType::AgentRegistered,
            EventType::StatusChanged,
            EventType::IpChanged,
            EventType::AsnChanged,
            EventType::HeartbeatReceived,
            EventType::HeartbeatTimeout,
        ] {
            let parsed: EventType = t.to_string().parse().unwrap();
            assert_eq!(parsed, t);
        }
        assert!("BOGUS".parse::<EventType>().is_err());
    }

    #[test]
    fn test_fleet_stats() {
        let now = Utc::now();
        let mut a = Node::new(
            "a1".into(),
            "alpha".into(),
            Location {
                country: Some("DE".into()),
                city: None,
            },
            "hetzner".into(),
            now,
        );
        a.status = NodeStatus::Online;
        let mut b = Node::new(
            "b2".into(),
            "beta".into(),
            Location {
                country: Some("US".into()),
                city: None,
            },
            "hetzner".into(),
            now,
        );
        b.status = NodeStatus::Offline;

        let stats = FleetStats::compute([&a, &b]);
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.countries, 2);
        assert_eq!(stats.providers, 1);
    }
}
