use thiserror::Error;

use crate::collaborators::StoreError;

/// Errors surfaced to callers of the executor.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Pipeline overloaded: job queue is full (capacity {capacity})")]
    Overloaded { capacity: usize },

    #[error("Pipeline executor is shut down")]
    ShutDown,

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classifies a pipeline failure for retry decisions and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed, oversized or non-PDF input. Never retried.
    InvalidDocument,
    /// Collaborator output did not conform to the expected schema.
    SchemaViolation,
    /// Transport or API failure talking to a model provider.
    ProviderError,
    /// The job queue was full at submission time.
    Overloaded,
    /// The persistence write could not be attempted.
    StorageError,
    /// A worker crashed while running the job.
    WorkerFault,
    /// The job sat unfinished past the stale-entry TTL and was evicted.
    Abandoned,
}

impl FailureKind {
    /// Transient kinds are retried in place, up to the stage's bound.
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::SchemaViolation | FailureKind::ProviderError)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::InvalidDocument => "InvalidDocument",
            FailureKind::SchemaViolation => "SchemaViolation",
            FailureKind::ProviderError => "ProviderError",
            FailureKind::Overloaded => "Overloaded",
            FailureKind::StorageError => "StorageError",
            FailureKind::WorkerFault => "WorkerFault",
            FailureKind::Abandoned => "Abandoned",
        };
        write!(f, "{name}")
    }
}
