//! Crate error model.

use thiserror::Error;

use crate::store::StoreError;

/// Result type used across the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine and its components.
///
/// Execution-outcome errors (`Timeout`, `Cancelled`, `Panic`) are recorded on
/// the failing attempt and never escape a runner; the remaining variants are
/// returned from the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload rejected before any persistence (bad serialization, reserved
    /// names, use-after-start).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Job store read/write failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A worker is already registered for this kind.
    #[error("worker already registered for kind: {0}")]
    DuplicateKind(String),

    /// No worker registered for this kind; the job is cancelled, not retried.
    #[error("worker not found for kind: {0}")]
    WorkerNotFound(String),

    /// Payload deserialization failed at job-load time.
    #[error("unmarshaling job args: {0}")]
    Unmarshal(#[from] serde_json::Error),

    /// The attempt exceeded its effective timeout.
    #[error("timeout")]
    Timeout,

    /// The attempt was cut short by process shutdown.
    #[error("cancelled")]
    Cancelled,

    /// The worker panicked; the payload message is preserved.
    #[error("panic: {0}")]
    Panic(String),

    /// A cron expression failed to parse.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn panic(msg: impl Into<String>) -> Self {
        Self::Panic(msg.into())
    }
}
