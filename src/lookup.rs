//! ASN Lookup Provider
//!
//! Resolves IP addresses to ASN attributes (number, name, org, route,
//! type). Lookups are best-effort: any failure or timeout degrades to
//! the `unknown` sentinel so the heartbeat path is never blocked.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::LookupConfig;
use crate::error::{Error, Result};
use crate::model::AsnInfo;

/// Shared HTTP client for lookup calls
static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create HTTP client")
});

/// IP-to-ASN resolution consumed by the drift detector
#[async_trait]
pub trait AsnLookupProvider: Send + Sync {
    /// Resolve ASN attributes for an IP.
    ///
    /// Implementations may fail or time out; callers treat any error
    /// as `LookupUnavailable` and fall back to [`AsnInfo::unknown`].
    async fn lookup(&self, ip: &str) -> Result<AsnInfo>;
}

/// Wire format of the lookup endpoint
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    asn: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    route: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// HTTP JSON lookup provider
pub struct HttpAsnProvider {
    base_url: String,
    timeout: Duration,
}

impl HttpAsnProvider {
    /// Create a provider from the lookup config section
    pub fn new(config: &LookupConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn fetch(&self, ip: &str) -> Result<AsnInfo> {
        let url = format!("{}/{}", self.base_url, ip);

        let response = HTTP_CLIENT
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::LookupUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::LookupUnavailable(format!(
                "lookup endpoint returned {}",
                response.status()
            )));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| Error::LookupUnavailable(e.to_string()))?;

        let unknown = || "unknown".to_string();
        Ok(AsnInfo {
            asn: body.asn,
            name: body.name.unwrap_or_else(unknown),
            org: body.org.unwrap_or_else(unknown),
            route: body.route.unwrap_or_else(unknown),
            kind: body.kind.unwrap_or_else(unknown),
        })
    }
}

#[async_trait]
impl AsnLookupProvider for HttpAsnProvider {
    async fn lookup(&self, ip: &str) -> Result<AsnInfo> {
        match tokio::time::timeout(self.timeout, self.fetch(ip)).await {
            Ok(result) => result,
            Err(_) => Err(Error::LookupUnavailable(format!(
                "lookup for {} timed out after {:?}",
                ip, self.timeout
            ))),
        }
    }
}

/// Provider used when lookup is disabled in config; always unknown
pub struct DisabledAsnProvider;

#[async_trait]
impl AsnLookupProvider for DisabledAsnProvider {
    async fn lookup(&self, _ip: &str) -> Result<AsnInfo> {
        Ok(AsnInfo::unknown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_provider_returns_unknown() {
        let provider = DisabledAsnProvider;
        let info = provider.lookup("1.2.3.4").await.unwrap();
        assert!(info.is_unknown());
    }

    #[tokio::test]
    async fn test_http_provider_unreachable_is_lookup_unavailable() {
        let provider = HttpAsnProvider::new(&LookupConfig {
            enabled: true,
            // Reserved TEST-NET address; nothing listens here
            base_url: "http://192.0.2.1:1/v1/lookup".to_string(),
            timeout_secs: 1,
        });

        let err = provider.lookup("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, Error::LookupUnavailable(_)));
    }

    #[test]
    fn test_response_fills_missing_fields() {
        let body: LookupResponse =
            serde_json::from_str(r#"{"asn": 64500, "org": "Example Net"}"#).unwrap();
        assert_eq!(body.asn, 64500);
        assert_eq!(body.org.as_deref(), Some("Example Net"));
        assert!(body.route.is_none());
    }
}
