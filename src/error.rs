//! Top-level error types for deferbot.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Message ledger failures. The ledger never half-applies a write.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open message ledger: {0}")]
    Open(#[source] sqlx::Error),

    #[error("ledger {operation} failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("corrupt ledger row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

impl StorageError {
    pub(crate) fn query(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| StorageError::Query { operation, source }
    }
}

/// Reply generator failures. Never surfaced past the scheduler, which
/// substitutes the fallback reply.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("missing API key for generator")]
    MissingApiKey,

    #[error("generator request failed: {0}")]
    Request(String),

    #[error("generator returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected generator response: {0}")]
    UnexpectedResponse(String),

    #[error("prompt rendering failed: {0}")]
    Prompt(String),
}

/// Classified outbound send failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The transport could not encrypt or route the message because the
    /// session material is damaged. Retrying on this session is pointless.
    #[error("session corrupted: {message}")]
    SessionCorruption { message: String },

    /// Anything else: timeouts, closed sockets, rate limits.
    #[error("transient send failure: {message}")]
    Transient { message: String },
}

impl SendError {
    pub fn corruption(message: impl Into<String>) -> Self {
        SendError::SessionCorruption {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SendError::Transient {
            message: message.into(),
        }
    }
}

/// Transport connection and session repair errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect transport: {0}")]
    Connect(String),

    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("session repair failed: {0}")]
    Repair(String),
}
