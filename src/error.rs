//! Error types for the cStor backup operator

use thiserror::Error;

use crate::validation::ValidationReport;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more named predicates failed
    #[error(transparent)]
    Validation(#[from] ValidationReport),

    /// Record expected to exist was not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Record with the same name already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed
    #[error("Resource version conflict: {0}")]
    Conflict(String),

    /// Queue key could not be split into namespace/name
    #[error("Invalid resource key: {0}")]
    InvalidKey(String),

    /// Node or pod health could not be determined
    #[error("Pool health could not be determined: {0}")]
    HealthIndeterminate(String),

    /// Snapshot transfer failed
    #[error("Transfer of {name} failed: {reason}")]
    Transfer { name: String, reason: String },

    /// External command ran and failed
    #[error("Command '{command}' failed (status {status:?}): {output}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP server error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a transfer error for the named job
    pub fn transfer(name: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transfer {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that must not be retried by the work queue.
    ///
    /// A failed transfer is final for its Sync attempt; a bad key or request
    /// will never become valid by waiting.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::InvalidKey(_) | Error::Transfer { .. } | Error::Validation(_)
        )
    }

    /// Whether this error means the record does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}
