//! Runs one job body under a lease.
//!
//! Lifecycle of a single execution:
//!
//! 1. pre-flight `renew`: the lease handed over by the scheduler must still be
//!    ours, otherwise nothing runs and nothing is recorded;
//! 2. the body runs on its own task while the executor renews the lease on a
//!    fixed cadence and watches the `max_duration` deadline;
//! 3. post-flight: mark the lease `releasing`, append the execution record,
//!    free the lease.
//!
//! Losing the lease cancels the body's [`JobContext`]; the body gets a short
//! grace period to notice and is then dropped. Hitting the deadline drops it
//! immediately. Neither undoes side effects the body already issued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronfleet_core::{JobDefinition, JobId, RunnerId};
use cronfleet_store::{Lease, NewExecutionRecord, Outcome};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::LockError;
use crate::lock::LockManager;

/// Detail written to the record when the lease was taken away mid-run.
pub const LEASE_LOST_DETAIL: &str = "lease_lost";

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// The opaque unit of work a job runs.
///
/// `Err` carries a short human-readable reason that ends up in the execution
/// record. Long-running bodies should poll [`JobContext::still_valid`] or
/// select on [`JobContext::invalidated`] between side effects.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, ctx: JobContext) -> std::result::Result<(), String>;
}

/// What a job body can see about its own execution.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    runner_id: RunnerId,
    fencing_token: u64,
    cancel: CancellationToken,
    lock: LockManager,
}

impl JobContext {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    /// Token to attach to any write that must be rejected once a newer holder exists.
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    /// False once the lease was lost or the deadline passed.
    pub fn still_valid(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves when [`still_valid`](Self::still_valid) turns false.
    pub async fn invalidated(&self) {
        self.cancel.cancelled().await
    }

    /// Ask the store whether our token is still the current one.
    pub async fn confirm_fence(&self) -> Result<bool, LockError> {
        self.lock
            .validate_fence(&self.job_id, self.fencing_token)
            .await
    }
}

/// Summary of one finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub fencing_token: u64,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Id of the persisted record, `None` if the write failed.
    pub record_id: Option<i64>,
    /// Whether our lease was freed. False after a lease loss or a failed release.
    pub released: bool,
}

pub struct JobExecutor {
    lock: LockManager,
    cancel_grace: Duration,
}

impl JobExecutor {
    pub fn new(lock: LockManager) -> Self {
        Self {
            lock,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// How long a body may keep running after its lease was lost.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    /// Renewal cadence: a third of the TTL, tightened for short jobs so every
    /// execution renews a few times.
    pub fn renew_interval(def: &JobDefinition) -> Duration {
        (def.lease_ttl / 3)
            .min(def.max_duration / 4)
            .max(MIN_RENEW_INTERVAL)
    }

    /// Execute `body` under `lease`.
    ///
    /// Returns `Err` only when the pre-flight renewal fails; in that case the
    /// body never started and no record was written.
    #[instrument(skip_all, fields(job_id = %def.job_id, token = lease.fencing_token))]
    pub async fn execute(
        &self,
        def: &JobDefinition,
        lease: Lease,
        body: Arc<dyn JobBody>,
    ) -> Result<ExecutionReport, LockError> {
        let mut current = match self.lock.renew(&lease, def.lease_ttl).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "pre-flight renew failed; not running");
                return Err(e);
            }
        };

        let started_at = self.lock.now();
        let cancel = CancellationToken::new();
        let ctx = JobContext {
            job_id: def.job_id.clone(),
            runner_id: self.lock.runner_id().clone(),
            fencing_token: current.fencing_token,
            cancel: cancel.clone(),
            lock: self.lock.clone(),
        };
        info!(max_duration_secs = def.max_duration.as_secs(), "job started");

        let mut body_task = tokio::spawn(async move { body.run(ctx).await });

        let every = Self::renew_interval(def);
        let mut renew_ticker = tokio::time::interval_at(Instant::now() + every, every);
        renew_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(def.max_duration);
        tokio::pin!(deadline);

        let (outcome, detail, lease_lost) = loop {
            tokio::select! {
                biased;

                joined = &mut body_task => {
                    let (outcome, detail) = settle(joined);
                    break (outcome, detail, false);
                }

                _ = &mut deadline => {
                    cancel.cancel();
                    body_task.abort();
                    warn!(max_duration_secs = def.max_duration.as_secs(), "deadline exceeded; abandoning job body");
                    let detail = format!("deadline exceeded after {:?}", def.max_duration);
                    break (Outcome::Timeout, Some(detail), false);
                }

                _ = renew_ticker.tick() => {
                    match self.lock.renew(&current, def.lease_ttl).await {
                        Ok(renewed) => {
                            debug!(expires_at = %renewed.expires_at, "lease renewed");
                            current = renewed;
                        }
                        // A store blip is survivable while the lease has not run out.
                        Err(LockError::StoreUnavailable(reason))
                            if self.lock.now() < current.expires_at =>
                        {
                            warn!(%reason, expires_at = %current.expires_at, "renew failed; will retry");
                        }
                        Err(e) => {
                            warn!(error = %e, "lease lost; cancelling job body");
                            cancel.cancel();
                            if tokio::time::timeout(self.cancel_grace, &mut body_task).await.is_err() {
                                body_task.abort();
                            }
                            break (Outcome::Failure, Some(LEASE_LOST_DETAIL.to_string()), true);
                        }
                    }
                }
            }
        };

        let finished_at = self.lock.now();
        let mut still_holder = !lease_lost;
        if still_holder {
            match self.lock.mark_releasing(&current).await {
                Ok(()) => {}
                Err(LockError::LeaseLost { .. }) => {
                    warn!("lease taken over before release");
                    still_holder = false;
                }
                Err(e) => warn!(error = %e, "could not mark lease releasing"),
            }
        }

        let record = NewExecutionRecord {
            job_id: def.job_id.clone(),
            runner_id: self.lock.runner_id().clone(),
            fencing_token: current.fencing_token,
            started_at,
            finished_at,
            outcome,
            detail: detail.clone(),
        };
        let record_id = match self.lock.record_execution(record).await {
            Ok(rec) => Some(rec.id),
            Err(e) => {
                error!(error = %e, %outcome, "failed to write execution record");
                None
            }
        };

        let released = still_holder && self.lock.release(&current).await;

        match outcome {
            Outcome::Success => info!(%outcome, "job finished"),
            _ => warn!(%outcome, detail = detail.as_deref().unwrap_or(""), "job finished"),
        }

        Ok(ExecutionReport {
            job_id: def.job_id.clone(),
            fencing_token: current.fencing_token,
            outcome,
            detail,
            started_at,
            finished_at,
            record_id,
            released,
        })
    }
}

fn settle(
    joined: std::result::Result<std::result::Result<(), String>, JoinError>,
) -> (Outcome, Option<String>) {
    match joined {
        Ok(Ok(())) => (Outcome::Success, None),
        Ok(Err(reason)) => (Outcome::Failure, Some(reason)),
        Err(e) if e.is_panic() => (Outcome::Failure, Some("job body panicked".to_string())),
        Err(e) => (Outcome::Failure, Some(e.to_string())),
    }
}
