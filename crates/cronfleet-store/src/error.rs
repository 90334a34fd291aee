use thiserror::Error;

/// Errors raised by lock store backends.
///
/// Lease contention is not an error at this layer: a busy lease is reported
/// through [`crate::AcquireOutcome::Busy`] and a lost one through `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Underlying PostgreSQL / sqlx error.
    #[error("database error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// The store could not be reached (network share gone, injected fault, ...).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The blocking worker running a database call panicked or was cancelled.
    #[error("store task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
