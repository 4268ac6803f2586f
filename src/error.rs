//! NodePulse Error Types

use thiserror::Error;

/// Result type alias for NodePulse operations
pub type Result<T> = std::result::Result<T, Error>;

/// NodePulse error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Ingestion errors
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Stale heartbeat for {agent_id}: reported {reported}, stored last_seen {stored}")]
    StaleHeartbeat {
        agent_id: String,
        reported: chrono::DateTime<chrono::Utc>,
        stored: chrono::DateTime<chrono::Utc>,
    },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    // Lookup errors (internal, never surfaced to agents)
    #[error("ASN lookup unavailable: {0}")]
    LookupUnavailable(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is the caller's fault (bad request, unknown agent)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownAgent(_) | Error::MalformedPayload(_) | Error::StaleHeartbeat { .. }
        )
    }

    /// Check if this error should degrade gracefully instead of failing the request
    pub fn is_degradable(&self) -> bool {
        matches!(self, Error::LookupUnavailable(_))
    }

    /// Stable machine-readable code for the API error envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::UnknownAgent(_) => "UNKNOWN_AGENT",
            Error::StaleHeartbeat { .. } => "STALE_HEARTBEAT",
            Error::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Error::LookupUnavailable(_) => "LOOKUP_UNAVAILABLE",
            Error::Persistence(_) => "PERSISTENCE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Network(_) => "NETWORK_ERROR",
            Error::State(_) => "STATE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(format!("SQLite error: {}", e))
    }
}
