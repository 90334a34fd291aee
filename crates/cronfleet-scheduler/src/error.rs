use chrono::{DateTime, Utc};
use cronfleet_core::{JobId, RunnerId};
use thiserror::Error;

/// Outcomes of lease operations that are not a success.
///
/// None of these are alertable: `Busy` is the losing side of a normal race,
/// `LeaseLost` is a cancellation signal for the executor, and
/// `StoreUnavailable` degrades to "nothing ran this tick".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock busy for {job_id}: held by {holder_id} until {expires_at}")]
    Busy {
        job_id: JobId,
        holder_id: RunnerId,
        expires_at: DateTime<Utc>,
    },

    #[error("lease lost for {job_id} (token {token})")]
    LeaseLost { job_id: JobId, token: u64 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LockError {
    /// Whether an operator should be paged for this. Always false; failures
    /// worth alerting on surface through execution records instead.
    pub fn is_alertable(&self) -> bool {
        false
    }
}

/// Errors that can occur while building or driving the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule expression could not be parsed.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job with the given id is configured, or it has no runnable body.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// A run of this job is still going on this runner.
    #[error("{0} is already running on this runner")]
    InFlight(JobId),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] cronfleet_store::StoreError),

    #[error(transparent)]
    Core(#[from] cronfleet_core::FleetError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
