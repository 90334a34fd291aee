//! Lease operations as seen by one runner.
//!
//! Wraps a [`LockStore`] with the runner's identity and a per-call timeout.
//! Store errors and timeouts both become [`LockError::StoreUnavailable`], so
//! the scheduler loop only has three non-success cases to handle. The
//! post-flight execution record goes through here too, under the same bound.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronfleet_core::{JobId, RunnerId};
use cronfleet_store::{
    AcquireOutcome, ExecutionRecord, Lease, LockStore, NewExecutionRecord, StoreError,
};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::LockError;

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    runner_id: RunnerId,
    op_timeout: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, runner_id: RunnerId, op_timeout: Duration) -> Self {
        Self {
            store,
            runner_id,
            op_timeout,
        }
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Current time according to the store.
    pub fn now(&self) -> DateTime<Utc> {
        self.store.now()
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, LockError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                debug!(op, error = %e, "store call failed");
                Err(LockError::StoreUnavailable(e.to_string()))
            }
            Err(_) => Err(LockError::StoreUnavailable(format!(
                "{op} timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }

    /// Race for `job_id`. Losing the race is [`LockError::Busy`].
    ///
    /// On timeout the store write keeps going in the background and may still
    /// commit. A lease won that late is released straight away, so
    /// `StoreUnavailable` always means nothing is held on our behalf.
    #[instrument(skip_all, fields(job_id = %job_id, runner_id = %self.runner_id))]
    pub async fn try_acquire(&self, job_id: &JobId, ttl: Duration) -> Result<Lease, LockError> {
        let store = Arc::clone(&self.store);
        let (job, holder) = (job_id.clone(), self.runner_id.clone());
        let mut attempt =
            tokio::spawn(async move { store.try_acquire(&job, &holder, ttl).await });

        let outcome = match tokio::time::timeout(self.op_timeout, &mut attempt).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => {
                debug!(op = "try_acquire", error = %e, "store call failed");
                return Err(LockError::StoreUnavailable(e.to_string()));
            }
            Ok(Err(e)) => return Err(LockError::StoreUnavailable(e.to_string())),
            Err(_) => {
                self.release_late_win(job_id.clone(), attempt);
                return Err(LockError::StoreUnavailable(format!(
                    "try_acquire timed out after {}ms",
                    self.op_timeout.as_millis()
                )));
            }
        };

        match outcome {
            AcquireOutcome::Acquired(lease) => {
                debug!(token = lease.fencing_token, "lease acquired");
                Ok(lease)
            }
            AcquireOutcome::Busy {
                holder_id,
                expires_at,
            } => Err(LockError::Busy {
                job_id: job_id.clone(),
                holder_id,
                expires_at,
            }),
        }
    }

    fn release_late_win(
        &self,
        job_id: JobId,
        attempt: JoinHandle<cronfleet_store::Result<AcquireOutcome>>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(Ok(AcquireOutcome::Acquired(lease))) = attempt.await {
                warn!(%job_id, token = lease.fencing_token, "acquire committed after timeout; releasing");
                manager.release(&lease).await;
            }
        });
    }

    /// Extend `lease`. A stale token or an expired lease is [`LockError::LeaseLost`].
    #[instrument(skip_all, fields(job_id = %lease.job_id, token = lease.fencing_token))]
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LockError> {
        match self.bounded("renew", self.store.renew(lease, ttl)).await? {
            Some(renewed) => Ok(renewed),
            None => Err(LockError::LeaseLost {
                job_id: lease.job_id.clone(),
                token: lease.fencing_token,
            }),
        }
    }

    /// Stop renewing and signal that the holder is wrapping up.
    #[instrument(skip_all, fields(job_id = %lease.job_id, token = lease.fencing_token))]
    pub async fn mark_releasing(&self, lease: &Lease) -> Result<(), LockError> {
        if self
            .bounded("mark_releasing", self.store.mark_releasing(lease))
            .await?
        {
            Ok(())
        } else {
            Err(LockError::LeaseLost {
                job_id: lease.job_id.clone(),
                token: lease.fencing_token,
            })
        }
    }

    /// Best-effort release. Failures are logged; the lease expires on its own.
    #[instrument(skip_all, fields(job_id = %lease.job_id, token = lease.fencing_token))]
    pub async fn release(&self, lease: &Lease) -> bool {
        match self.bounded("release", self.store.release(lease)).await {
            Ok(true) => true,
            Ok(false) => {
                debug!("release skipped: token no longer current");
                false
            }
            Err(e) => {
                warn!(error = %e, expires_at = %lease.expires_at, "release failed; lease will expire");
                false
            }
        }
    }

    /// Fresh read of the lease row for `job_id`.
    pub async fn current_lease(&self, job_id: &JobId) -> Result<Option<Lease>, LockError> {
        self.bounded("get_lease", self.store.get_lease(job_id)).await
    }

    pub async fn validate_fence(&self, job_id: &JobId, token: u64) -> Result<bool, LockError> {
        self.bounded("validate_fence", self.store.validate_fence(job_id, token))
            .await
    }

    /// Fencing token of the newest execution record for `job_id`.
    pub async fn latest_recorded_token(&self, job_id: &JobId) -> Result<Option<u64>, LockError> {
        let recent = self
            .bounded(
                "list_recent_execution_records",
                self.store.list_recent_execution_records(job_id, 1),
            )
            .await?;
        Ok(recent.first().map(|r| r.fencing_token))
    }

    pub async fn record_execution(
        &self,
        record: NewExecutionRecord,
    ) -> Result<ExecutionRecord, LockError> {
        self.bounded("append_execution", self.store.append_execution(record))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronfleet_core::ManualClock;
    use cronfleet_store::{LeaseStatus, MemoryLockStore};

    const TTL: Duration = Duration::from_secs(60);

    fn manager(store: Arc<MemoryLockStore>, runner: &str) -> LockManager {
        LockManager::new(store, RunnerId::from(runner), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn losing_race_is_busy_not_error() {
        let store = MemoryLockStore::new(Arc::new(ManualClock::at_epoch()));
        let r1 = manager(store.clone(), "r1");
        let r2 = manager(store, "r2");
        let job = JobId::from("card_sync");

        r1.try_acquire(&job, TTL).await.unwrap();
        let err = r2.try_acquire(&job, TTL).await.unwrap_err();
        assert!(matches!(err, LockError::Busy { ref holder_id, .. } if holder_id.as_str() == "r1"));
        assert!(!err.is_alertable());
    }

    #[tokio::test]
    async fn stale_renew_is_lease_lost() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = MemoryLockStore::new(clock.clone());
        let r1 = manager(store.clone(), "r1");
        let r2 = manager(store, "r2");
        let job = JobId::from("card_sync");

        let lease = r1.try_acquire(&job, TTL).await.unwrap();
        clock.advance(Duration::from_secs(61));
        r2.try_acquire(&job, TTL).await.unwrap();

        let err = r1.renew(&lease, TTL).await.unwrap_err();
        assert_eq!(
            err,
            LockError::LeaseLost {
                job_id: job.clone(),
                token: 1
            }
        );
        assert!(!r1.release(&lease).await);
    }

    #[tokio::test]
    async fn store_fault_maps_to_unavailable() {
        let store = MemoryLockStore::new(Arc::new(ManualClock::at_epoch()));
        store.set_unavailable(true);
        let r1 = manager(store, "r1");
        let err = r1
            .try_acquire(&JobId::from("card_sync"), TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::StoreUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_store_call_times_out() {
        let store = MemoryLockStore::new(Arc::new(ManualClock::at_epoch()));
        store.set_latency(Duration::from_secs(30));
        let r1 = manager(store, "r1");
        let err = r1
            .try_acquire(&JobId::from("card_sync"), TTL)
            .await
            .unwrap_err();
        match err {
            LockError::StoreUnavailable(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_committing_after_timeout_is_given_back() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = MemoryLockStore::new(clock);
        store.set_acquire_latency(Duration::from_secs(3));
        let r1 = manager(store.clone(), "r1");
        let job = JobId::from("card_sync");

        let err = r1.try_acquire(&job, TTL).await.unwrap_err();
        assert!(matches!(err, LockError::StoreUnavailable(_)));

        // The write lands at t=3 and is released right after.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let row = store.get_lease(&job).await.unwrap().unwrap();
        assert_eq!(row.holder_id.as_str(), "r1");
        assert_eq!(row.fencing_token, 1);
        assert_eq!(row.status, LeaseStatus::Free);

        store.set_acquire_latency(Duration::ZERO);
        let next = manager(store, "r2").try_acquire(&job, TTL).await.unwrap();
        assert_eq!(next.fencing_token, 2);
    }
}
