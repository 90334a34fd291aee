use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronfleet_core::{JobId, RunnerId};

use crate::error::Result;
use crate::types::{AcquireOutcome, ExecutionRecord, Heartbeat, Lease, NewExecutionRecord};

/// Access to the shared coordination state.
///
/// Every mutating call is a single conditional write, and expiry is decided
/// inside that write by the backend's clock; callers never compare their
/// local wall clock against a lease. Backends shared by several hosts must
/// take that clock from the database server. All calls may block on I/O and
/// callers are expected to bound them with a timeout.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// The backend's notion of the current time, as close to the clock that
    /// judges expiry as this runner can observe.
    fn now(&self) -> DateTime<Utc>;

    /// Claim `job_id` for `holder` if no row exists, the row is free, or the
    /// row's lease has expired. Success bumps the fencing token by one.
    async fn try_acquire(
        &self,
        job_id: &JobId,
        holder: &RunnerId,
        ttl: Duration,
    ) -> Result<AcquireOutcome>;

    /// Extend a held lease. Returns `Ok(None)` when `lease` is no longer the
    /// current, unexpired, held lease for its job.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>>;

    /// Move a held lease to `releasing`. Returns `false` if the token is stale.
    async fn mark_releasing(&self, lease: &Lease) -> Result<bool>;

    /// Free the lease if `lease` still carries the current token.
    async fn release(&self, lease: &Lease) -> Result<bool>;

    async fn get_lease(&self, job_id: &JobId) -> Result<Option<Lease>>;

    async fn list_leases(&self) -> Result<Vec<Lease>>;

    /// Whether `token` is the current, unexpired token for `job_id`.
    async fn validate_fence(&self, job_id: &JobId, token: u64) -> Result<bool>;

    /// Idempotent liveness upsert; `last_seen_at` is set by the backend's clock.
    async fn upsert_heartbeat(&self, runner_id: &RunnerId, status_note: &str)
        -> Result<Heartbeat>;

    async fn list_heartbeats(&self) -> Result<Vec<Heartbeat>>;

    /// Heartbeats whose `last_seen_at` is older than `now - threshold`, oldest first.
    async fn list_stale_heartbeats(&self, threshold: Duration) -> Result<Vec<Heartbeat>>;

    async fn append_execution(&self, record: NewExecutionRecord) -> Result<ExecutionRecord>;

    /// Most recent records for `job_id`, newest first.
    async fn list_recent_execution_records(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>>;
}

/// `now + ttl`, saturating far in the future rather than overflowing.
pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - threshold`, clamped to the earliest representable time.
pub(crate) fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Expiry for a renewal: never earlier than one millisecond past the old one.
pub(crate) fn renewed_expiry(
    now: DateTime<Utc>,
    ttl: Duration,
    previous: DateTime<Utc>,
) -> DateTime<Utc> {
    let floor = previous
        .checked_add_signed(chrono::Duration::milliseconds(1))
        .unwrap_or(previous);
    expiry_from(now, ttl).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_thresholds_clamp_instead_of_wrapping() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(
            stale_cutoff(now, Duration::from_secs(90)).timestamp(),
            -90
        );
        assert_eq!(stale_cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            stale_cutoff(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MIN_UTC
        );
        assert_eq!(expiry_from(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
