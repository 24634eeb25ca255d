//! Error types for the runner

use thiserror::Error;

/// Result type alias using the runner [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Runner error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing variable `{name}`")]
    MissingVariable { name: String },

    #[error("Malformed rule: {0}")]
    MalformedRule(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Scenario `{0}` is disabled")]
    Disabled(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRule(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidDefinition(message.into())
    }
}

/// Network-level failures of a single HTTP call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to read response: {0}")]
    Read(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Stable upper-case code used in persisted records.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Timeout { .. } => "TIMEOUT",
            TransportError::Dns(_) => "DNS_ERROR",
            TransportError::Connect(_) => "CONNECT_ERROR",
            TransportError::Tls(_) => "TLS_ERROR",
            TransportError::Read(_) => "READ_ERROR",
            TransportError::InvalidRequest(_) => "INVALID_REQUEST",
            TransportError::Cancelled => "CANCELED",
        }
    }

    /// Whether a batch retry may re-attempt the call.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::InvalidRequest(_) | TransportError::Cancelled
        )
    }
}
