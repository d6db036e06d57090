//! Error types for the maintenance coordinator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    /// The requested object does not exist (HTTP 404)
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Optimistic concurrency check failed (HTTP 409)
    #[error("conflicting update on {kind} {name}")]
    Conflict { kind: &'static str, name: String },

    /// Release of a lock held by another identity
    #[error("unable to release lock not held, owned by {owner}")]
    LockNotHeld { owner: String },

    /// Node disappeared from the cluster while an operation was running
    #[error("node {0} no longer available, can't continue")]
    NodeUnavailable(String),

    /// The caller cancelled a polling operation
    #[error("operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
