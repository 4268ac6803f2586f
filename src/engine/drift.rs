//! Drift Detector
//!
//! Compares newly reported network attributes against the stored
//! snapshot and emits IP_CHANGED / ASN_CHANGED events. ASN resolution
//! is best-effort behind a bounded lookup; failures degrade to the
//! unknown sentinel and are retried on the next heartbeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::lookup::AsnLookupProvider;
use crate::model::{AsnInfo, EventLogEntry, EventType, NetworkInfo, Node};

/// Attribute updates and events produced by one drift check
#[derive(Debug, Default)]
pub struct DriftOutcome {
    /// New IPv4 to store, when reported
    pub ipv4: Option<String>,
    /// New IPv6 to store, when reported
    pub ipv6: Option<String>,
    /// New ASN attributes to store, when a lookup ran
    pub asn: Option<AsnInfo>,
    /// Drift events to record
    pub events: Vec<EventLogEntry>,
}

impl DriftOutcome {
    /// Whether anything needs to be written back to the node
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none() && self.asn.is_none() && self.events.is_empty()
    }

    /// Apply the stored-attribute updates to a node
    pub fn apply(&self, node: &mut Node) {
        if let Some(ipv4) = &self.ipv4 {
            node.ipv4 = Some(ipv4.clone());
        }
        if let Some(ipv6) = &self.ipv6 {
            node.ipv6 = Some(ipv6.clone());
        }
        if let Some(asn) = &self.asn {
            node.asn = asn.clone();
        }
    }
}

/// Detects environment drift between heartbeats
pub struct DriftDetector {
    lookup: Arc<dyn AsnLookupProvider>,
}

impl DriftDetector {
    /// Create a detector backed by the given lookup provider
    pub fn new(lookup: Arc<dyn AsnLookupProvider>) -> Self {
        Self { lookup }
    }

    /// Compare reported attributes against the stored snapshot.
    ///
    /// Comparison is by value equality: re-reporting the same IP is a
    /// no-op. The first observation of an address family is baseline,
    /// not drift. A field omitted from the heartbeat leaves the stored
    /// value untouched.
    pub async fn check(
        &self,
        node: &Node,
        network: &NetworkInfo,
        now: DateTime<Utc>,
    ) -> DriftOutcome {
        let mut outcome = DriftOutcome::default();

        let ipv4_drift = Self::family_drift(&node.ipv4, &network.ipv4);
        let ipv6_drift = Self::family_drift(&node.ipv6, &network.ipv6);

        if let FamilyDrift::Changed(previous, current) = &ipv4_drift {
            outcome.events.push(EventLogEntry::new(
                &node.agent_id,
                EventType::IpChanged,
                format!("IPv4 changed from {} to {}", previous, current),
                json!({"family": "ipv4", "previous": previous, "current": current}),
                now,
            ));
        }
        if let FamilyDrift::Changed(previous, current) = &ipv6_drift {
            outcome.events.push(EventLogEntry::new(
                &node.agent_id,
                EventType::IpChanged,
                format!("IPv6 changed from {} to {}", previous, current),
                json!({"family": "ipv6", "previous": previous, "current": current}),
                now,
            ));
        }

        if let Some(ip) = ipv4_drift.new_value() {
            outcome.ipv4 = Some(ip.to_string());
        }
        if let Some(ip) = ipv6_drift.new_value() {
            outcome.ipv6 = Some(ip.to_string());
        }

        // Resolve ASN when an address moved, or when a previous lookup
        // failed and left the sentinel behind.
        let lookup_target = outcome
            .ipv4
            .as_deref()
            .or(outcome.ipv6.as_deref())
            .or_else(|| {
                if node.asn.is_unknown() {
                    node.ipv4.as_deref().or(node.ipv6.as_deref())
                } else {
                    None
                }
            });

        if let Some(ip) = lookup_target {
            let resolved = match self.lookup.lookup(ip).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::debug!("ASN lookup for {} degraded to unknown: {}", ip, e);
                    AsnInfo::unknown()
                }
            };

            // unknown -> resolved is baseline; resolved -> resolved' is drift
            if !node.asn.is_unknown() && !resolved.is_unknown() && resolved != node.asn {
                outcome.events.push(EventLogEntry::new(
                    &node.agent_id,
                    EventType::AsnChanged,
                    format!(
                        "ASN changed from AS{} ({}) to AS{} ({})",
                        node.asn.asn, node.asn.org, resolved.asn, resolved.org
                    ),
                    json!({"previous": node.asn, "current": resolved}),
                    now,
                ));
            }

            if resolved != node.asn {
                outcome.asn = Some(resolved);
            }
        }

        outcome
    }

    fn family_drift(stored: &Option<String>, reported: &Option<String>) -> FamilyDrift {
        match (stored, reported) {
            // Not reported: stored value stands
            (_, None) => FamilyDrift::None,
            // First observation is baseline
            (None, Some(current)) => FamilyDrift::Baseline(current.clone()),
            (Some(previous), Some(current)) => {
                if previous == current {
                    FamilyDrift::None
                } else {
                    FamilyDrift::Changed(previous.clone(), current.clone())
                }
            }
        }
    }
}

enum FamilyDrift {
    None,
    Baseline(String),
    Changed(String, String),
}

impl FamilyDrift {
    fn new_value(&self) -> Option<&str> {
        match self {
            FamilyDrift::None => None,
            FamilyDrift::Baseline(ip) => Some(ip),
            FamilyDrift::Changed(_, ip) => Some(ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::model::Location;
    use async_trait::async_trait;

    struct FixedLookup(AsnInfo);

    #[async_trait]
    impl AsnLookupProvider for FixedLookup {
        async fn lookup(&self, _ip: &str) -> Result<AsnInfo> {
            Ok(self.0.clone())
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl AsnLookupProvider for FailingLookup {
        async fn lookup(&self, _ip: &str) -> Result<AsnInfo> {
            Err(Error::LookupUnavailable("timed out".into()))
        }
    }

    fn resolved_asn() -> AsnInfo {
        AsnInfo {
            asn: 24940,
            name: "HETZNER-AS".into(),
            org: "Hetzner Online GmbH".into(),
            route: "5.6.7.0/24".into(),
            kind: "hosting".into(),
        }
    }

    fn node_with_ip(ipv4: Option<&str>) -> Node {
        let mut node = Node::new(
            "a1".into(),
            "alpha".into(),
            Location::default(),
            "hetzner".into(),
            Utc::now(),
        );
        node.ipv4 = ipv4.map(String::from);
        node
    }

    fn report(ipv4: Option<&str>) -> NetworkInfo {
        NetworkInfo {
            ipv4: ipv4.map(String::from),
            ipv6: None,
        }
    }

    #[tokio::test]
    async fn test_first_observation_is_baseline() {
        let detector = DriftDetector::new(Arc::new(FixedLookup(resolved_asn())));
        let node = node_with_ip(None);

        let outcome = detector
            .check(&node, &report(Some("1.2.3.4")), Utc::now())
            .await;

        // IP stored and ASN resolved, but no drift events
        assert_eq!(outcome.ipv4.as_deref(), Some("1.2.3.4"));
        assert_eq!(outcome.asn, Some(resolved_asn()));
        assert!(outcome.events.is_empty());
    }

    #[tokio::test]
    async fn test_same_ip_is_noop() {
        let detector = DriftDetector::new(Arc::new(FixedLookup(resolved_asn())));
        let mut node = node_with_ip(Some("1.2.3.4"));
        node.asn = resolved_asn();

        let outcome = detector
            .check(&node, &report(Some("1.2.3.4")), Utc::now())
            .await;
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn test_ip_change_emits_event() {
        let detector = DriftDetector::new(Arc::new(FixedLookup(resolved_asn())));
        let mut node = node_with_ip(Some("1.2.3.4"));
        node.asn = resolved_asn();

        let outcome = detector
            .check(&node, &report(Some("5.6.7.8")), Utc::now())
            .await;

        assert_eq!(outcome.ipv4.as_deref(), Some("5.6.7.8"));
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event_type, EventType::IpChanged);
        assert_eq!(outcome.events[0].details["previous"], "1.2.3.4");
        assert_eq!(outcome.events[0].details["current"], "5.6.7.8");
    }

    #[tokio::test]
    async fn test_asn_change_emits_event() {
        let new_asn = AsnInfo {
            asn: 16509,
            name: "AMAZON-02".into(),
            org: "Amazon.com, Inc.".into(),
            route: "5.6.7.0/24".into(),
            kind: "hosting".into(),
        };
        let detector = DriftDetector::new(Arc::new(FixedLookup(new_asn.clone())));
        let mut node = node_with_ip(Some("1.2.3.4"));
        node.asn = resolved_asn();

        let outcome = detector
            .check(&node, &report(Some("5.6.7.8")), Utc::now())
            .await;

        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.events[0].event_type, EventType::IpChanged);
        assert_eq!(outcome.events[1].event_type, EventType::AsnChanged);
        assert_eq!(outcome.asn, Some(new_asn));
    }

    #[tokio::test]
    async fn test_lookup_failure_degrades_to_unknown() {
        let detector = DriftDetector::new(Arc::new(FailingLookup));
        let mut node = node_with_ip(Some("1.2.3.4"));
        node.asn = resolved_asn();

        let outcome = detector
            .check(&node, &report(Some("5.6.7.8")), Utc::now())
            .await;

        // IP drift still recorded; ASN degrades silently to unknown
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event_type, EventType::IpChanged);
        assert_eq!(outcome.asn, Some(AsnInfo::unknown()));
    }

    #[tokio::test]
    async fn test_unknown_asn_retried_without_ip_change() {
        let detector = DriftDetector::new(Arc::new(FixedLookup(resolved_asn())));
        let mut node = node_with_ip(Some("1.2.3.4"));
        node.asn = AsnInfo::unknown();

        // Same IP again, but the sentinel triggers a retry
        let outcome = detector
            .check(&node, &report(Some("1.2.3.4")), Utc::now())
            .await;

        assert_eq!(outcome.asn, Some(resolved_asn()));
        // Baseline resolution, not drift
        assert!(outcome.events.is_empty());
    }

    #[tokio::test]
    async fn test_omitted_field_keeps_stored_value() {
        let detector = DriftDetector::new(Arc::new(FixedLookup(resolved_asn())));
        let mut node = node_with_ip(Some("1.2.3.4"));
        node.asn = resolved_asn();

        let outcome = detector.check(&node, &report(None), Utc::now()).await;
        assert!(outcome.is_empty());
    }
}
