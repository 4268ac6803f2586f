//! NodePulse Configuration
//!
//! This module provides configuration structures for the NodePulse
//! node status engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main NodePulse configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePulseConfig {
    /// Engine identity and storage
    pub engine: EngineConfig,

    /// Liveness timeout windows
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// ASN lookup provider
    #[serde(default)]
    pub lookup: LookupConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine identity and storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identifier for this collector instance
    pub id: String,

    /// Data directory for the embedded store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Liveness timeout windows.
///
/// Defaults assume agents report every ~30s: grace is 3x the expected
/// interval, offline is 20x.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds without a heartbeat before an online node becomes unknown
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,

    /// Seconds without a heartbeat before an unknown node becomes offline
    #[serde(default = "default_offline_window_secs")]
    pub offline_window_secs: u64,

    /// Interval between background sweep passes
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// ASN lookup provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    /// Enable ASN resolution on IP drift
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the lookup endpoint; the IP is appended as a path segment
    #[serde(default = "default_lookup_url")]
    pub base_url: String,

    /// Hard bound on a single lookup call
    #[serde(default = "default_lookup_timeout_secs")]
    pub timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS for dashboard consumption
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/nodepulse")
}

fn default_grace_window_secs() -> u64 {
    90
}

fn default_offline_window_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_lookup_url() -> String {
    "https://asn.internal/v1/lookup".to_string()
}

fn default_lookup_timeout_secs() -> u64 {
    3
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            id: "nodepulse".to_string(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for NodePulseConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timeouts: TimeoutConfig::default(),
            lookup: LookupConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: default_grace_window_secs(),
            offline_window_secs: default_offline_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_lookup_url(),
            timeout_secs: default_lookup_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NodePulseConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: NodePulseConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.id.is_empty() {
            return Err(crate::Error::Config("engine.id cannot be empty".into()));
        }

        if self.api.bind_address.is_empty() {
            return Err(crate::Error::Config(
                "api.bind_address cannot be empty".into(),
            ));
        }

        if self.timeouts.grace_window_secs == 0 {
            return Err(crate::Error::Config(
                "timeouts.grace_window_secs must be greater than zero".into(),
            ));
        }

        if self.timeouts.offline_window_secs <= self.timeouts.grace_window_secs {
            return Err(crate::Error::Config(
                "timeouts.offline_window_secs must exceed timeouts.grace_window_secs".into(),
            ));
        }

        if self.lookup.enabled && self.lookup.base_url.is_empty() {
            return Err(crate::Error::Config(
                "lookup.base_url cannot be empty when lookup is enabled".into(),
            ));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.engine.data_dir
    }

    /// Grace window as Duration
    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.timeouts.grace_window_secs)
    }

    /// Offline window as Duration
    pub fn offline_window(&self) -> Duration {
        Duration::from_secs(self.timeouts.offline_window_secs)
    }

    /// Sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts.sweep_interval_secs)
    }

    /// Lookup timeout as Duration
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[engine]
id = "collector-1"
data_dir = "/var/lib/nodepulse"

[timeouts]
grace_window_secs = 60
offline_window_secs = 300
sweep_interval_secs = 10

[lookup]
enabled = true
base_url = "https://asn.example.net/v1/lookup"
timeout_secs = 2

[api]
bind_address = "0.0.0.0:8090"
cors_enabled = true
"#;

        let config = NodePulseConfig::from_str(toml).unwrap();
        assert_eq!(config.engine.id, "collector-1");
        assert_eq!(config.grace_window(), Duration::from_secs(60));
        assert_eq!(config.offline_window(), Duration::from_secs(300));
        assert!(config.api.cors_enabled);
    }

    #[test]
    fn test_defaults_applied() {
        let toml = r#"
[engine]
id = "collector-1"
"#;
        let config = NodePulseConfig::from_str(toml).unwrap();
        assert_eq!(config.timeouts.grace_window_secs, 90);
        assert_eq!(config.timeouts.offline_window_secs, 600);
        assert_eq!(config.lookup.timeout_secs, 3);
        assert_eq!(config.api.bind_address, "0.0.0.0:8090");
    }

    #[test]
    fn test_rejects_inverted_windows() {
        let toml = r#"
[engine]
id = "collector-1"

[timeouts]
grace_window_secs = 600
offline_window_secs = 600
"#;
        assert!(NodePulseConfig::from_str(toml).is_err());
    }
}
