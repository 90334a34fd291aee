//! The per-runner scheduling loop.
//!
//! Every tick, each job goes through
//! `Idle -> Evaluating -> Racing -> {Running | Skipped}` and back to idle.
//! Ticks are not coordinated between runners; the lease decides who runs.
//!
//! A per-job slot cursor remembers the last slot this runner has dealt with,
//! so a slot is raced for at most once per runner. Store failures leave the
//! cursor alone and arm a backoff; the slot is retried once the store answers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronfleet_core::config::RunnerConfig;
use cronfleet_core::{JobDefinition, JobId, RunnerId};
use cronfleet_store::Lease;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{LockError, Result, SchedulerError};
use crate::executor::{ExecutionReport, JobBody, JobExecutor};
use crate::in_flight::InFlight;
use crate::lock::LockManager;
use crate::registry::JobRegistry;
use crate::schedule::CronSchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub tick_period: Duration,
    /// Ceiling for the store-unavailability backoff.
    pub backoff_max: Duration,
}

impl From<&RunnerConfig> for EngineSettings {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            tick_period: cfg.tick_period(),
            backoff_max: cfg.backoff_max(),
        }
    }
}

/// Why a job did not start on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotDue,
    /// The previous execution on this runner has not resolved yet.
    InFlight,
    /// Some runner already acquired the lease for this slot.
    AlreadyClaimed { holder_id: RunnerId, fencing_token: u64 },
    /// Lost the race: another runner holds a live lease.
    LockBusy { holder_id: RunnerId },
    /// The store failed or is in backoff. Nothing is held.
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickDecision {
    Started {
        job_id: JobId,
        slot: DateTime<Utc>,
        fencing_token: u64,
    },
    Skipped {
        job_id: JobId,
        reason: SkipReason,
    },
}

impl TickDecision {
    pub fn job_id(&self) -> &JobId {
        match self {
            TickDecision::Started { job_id, .. } | TickDecision::Skipped { job_id, .. } => job_id,
        }
    }

    fn skipped(job_id: &JobId, reason: SkipReason) -> Self {
        TickDecision::Skipped {
            job_id: job_id.clone(),
            reason,
        }
    }
}

/// Exponential delay after store failures: one tick period, doubling, capped.
#[derive(Debug)]
struct StoreBackoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
    until: Option<Instant>,
}

impl StoreBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
            until: None,
        }
    }

    fn active(&self) -> bool {
        self.until.is_some_and(|t| Instant::now() < t)
    }

    fn failure(&mut self) -> Duration {
        let next = match self.current {
            Some(d) => (d * 2).min(self.max),
            None => self.base,
        };
        self.current = Some(next);
        self.until = Some(Instant::now() + next);
        next
    }

    fn reset(&mut self) {
        if self.current.take().is_some() {
            info!("store reachable again; backoff cleared");
        }
        self.until = None;
    }
}

struct ScheduledJob {
    def: JobDefinition,
    schedule: CronSchedule,
    body: Arc<dyn JobBody>,
    /// Latest slot this runner has resolved (ran, lost, or skipped).
    cursor: DateTime<Utc>,
}

pub struct SchedulerEngine {
    jobs: Vec<ScheduledJob>,
    lock: LockManager,
    executor: Arc<JobExecutor>,
    in_flight: InFlight,
    settings: EngineSettings,
    backoff: StoreBackoff,
    tasks: JoinSet<()>,
}

impl SchedulerEngine {
    /// Build an engine for `defs`. Fails on an unparsable schedule or a job
    /// without a body.
    pub fn new(
        defs: Vec<JobDefinition>,
        registry: &JobRegistry,
        executor: JobExecutor,
        in_flight: InFlight,
        settings: EngineSettings,
    ) -> Result<Self> {
        let lock = executor.lock().clone();
        let now = lock.now();
        let jobs = defs
            .into_iter()
            .map(|def| {
                let schedule = CronSchedule::parse(&def.schedule_expr).map_err(|e| {
                    SchedulerError::InvalidSchedule(format!("{}: {e}", def.job_id))
                })?;
                let body = registry.resolve(&def)?;
                Ok(ScheduledJob {
                    def,
                    schedule,
                    body,
                    cursor: now,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            jobs,
            lock,
            executor: Arc::new(executor),
            in_flight,
            backoff: StoreBackoff::new(settings.tick_period, settings.backoff_max),
            settings,
            tasks: JoinSet::new(),
        })
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.def.job_id.clone()).collect()
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`, then waits for
    /// in-flight executions to finish (each is bounded by its deadline).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            runner_id = %self.lock.runner_id(),
            jobs = self.jobs.len(),
            tick_secs = self.settings.tick_period.as_secs(),
            "scheduler engine started"
        );

        let mut interval = tokio::time::interval(self.settings.tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(in_flight = self.in_flight.len(), "scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
        self.drain().await;
    }

    /// Wait for every spawned execution to resolve.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("executor task failed: {e}");
            }
        }
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!("executor task failed: {e}");
            }
        }
    }

    /// Evaluate every job once.
    pub async fn tick(&mut self) -> Vec<TickDecision> {
        self.reap();
        let now = self.lock.now();
        let mut decisions = Vec::with_capacity(self.jobs.len());
        let mut store_failed = false;
        let mut store_ok = false;

        for idx in 0..self.jobs.len() {
            let decision = self.evaluate(idx, now, &mut store_failed, &mut store_ok).await;
            match &decision {
                TickDecision::Started {
                    job_id,
                    fencing_token,
                    ..
                } => info!(%job_id, token = fencing_token, "job slot claimed"),
                TickDecision::Skipped { job_id, reason } => {
                    debug!(%job_id, ?reason, "job skipped")
                }
            }
            decisions.push(decision);
        }

        if store_failed {
            let delay = self.backoff.failure();
            warn!(backoff_secs = delay.as_secs(), "store unavailable; backing off");
        } else if store_ok {
            self.backoff.reset();
        }
        decisions
    }

    async fn evaluate(
        &mut self,
        idx: usize,
        now: DateTime<Utc>,
        store_failed: &mut bool,
        store_ok: &mut bool,
    ) -> TickDecision {
        let tick_period = self.settings.tick_period;
        let job = &mut self.jobs[idx];
        let job_id = job.def.job_id.clone();

        let Some(slot) = job.schedule.due_slot(job.cursor, now) else {
            return TickDecision::skipped(&job_id, SkipReason::NotDue);
        };

        let Some(guard) = self.in_flight.try_claim(&job_id) else {
            info!(%job_id, %slot, "previous run still in flight; slot dropped");
            job.cursor = slot;
            return TickDecision::skipped(&job_id, SkipReason::InFlight);
        };

        if *store_failed || self.backoff.active() {
            return TickDecision::skipped(&job_id, SkipReason::StoreUnavailable);
        }

        // Advisory re-read: a lease acquired around this slot means some
        // runner already took it, possibly one whose tick came first.
        let window = claim_window(&job.schedule, slot, tick_period);
        let recent = match self.lock.current_lease(&job_id).await {
            Ok(lease) => lease.filter(|l| l.acquired_at >= slot - window),
            Err(e) => {
                warn!(%job_id, error = %e, "lease read failed");
                *store_failed = true;
                return TickDecision::skipped(&job_id, SkipReason::StoreUnavailable);
            }
        };
        *store_ok = true;
        if let Some(lease) = recent {
            match slot_taken(&self.lock, &lease, now).await {
                Ok(true) => {
                    job.cursor = slot;
                    return TickDecision::skipped(
                        &job_id,
                        SkipReason::AlreadyClaimed {
                            holder_id: lease.holder_id,
                            fencing_token: lease.fencing_token,
                        },
                    );
                }
                Ok(false) => {
                    debug!(%job_id, token = lease.fencing_token, "recent lease never ran; racing")
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "execution record read failed");
                    *store_failed = true;
                    return TickDecision::skipped(&job_id, SkipReason::StoreUnavailable);
                }
            }
        }

        match self.lock.try_acquire(&job_id, job.def.lease_ttl).await {
            Ok(lease) => {
                job.cursor = slot;
                let token = lease.fencing_token;
                let executor = Arc::clone(&self.executor);
                let def = job.def.clone();
                let body = Arc::clone(&job.body);
                self.tasks.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = executor.execute(&def, lease, body).await {
                        warn!(job_id = %def.job_id, error = %e, "execution did not start");
                    }
                });
                TickDecision::Started {
                    job_id,
                    slot,
                    fencing_token: token,
                }
            }
            Err(LockError::Busy { holder_id, .. }) => {
                job.cursor = slot;
                TickDecision::skipped(&job_id, SkipReason::LockBusy { holder_id })
            }
            Err(e) => {
                warn!(%job_id, error = %e, "acquire failed");
                *store_failed = true;
                TickDecision::skipped(&job_id, SkipReason::StoreUnavailable)
            }
        }
    }

    /// Race for `job_id` once, right now, and run it in the foreground.
    ///
    /// Ignores the schedule. Losing the race surfaces as
    /// [`LockError::Busy`] wrapped in [`SchedulerError::Lock`]; a run of the
    /// same job already going on this runner is [`SchedulerError::InFlight`].
    pub async fn run_job_now(&self, job_id: &JobId) -> Result<ExecutionReport> {
        let job = self
            .jobs
            .iter()
            .find(|j| &j.def.job_id == job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;

        let Some(_guard) = self.in_flight.try_claim(job_id) else {
            return Err(SchedulerError::InFlight(job_id.clone()));
        };

        let lease = self.lock.try_acquire(job_id, job.def.lease_ttl).await?;
        let report = self
            .executor
            .execute(&job.def, lease, Arc::clone(&job.body))
            .await?;
        Ok(report)
    }
}

/// Whether a lease acquired around the current slot stands for a real run:
/// either someone still holds it, or its holder got as far as the record.
/// An acquisition that was given back unused (a write that committed after
/// its caller timed out) or whose holder died before recording leaves the
/// slot open.
async fn slot_taken(
    lock: &LockManager,
    lease: &Lease,
    now: DateTime<Utc>,
) -> std::result::Result<bool, LockError> {
    if lease.is_live_at(now) {
        return Ok(true);
    }
    let recorded = lock.latest_recorded_token(&lease.job_id).await?;
    Ok(recorded == Some(lease.fencing_token))
}

/// How far before `slot` a lease acquisition still counts as claiming it.
/// Covers clock skew between runners without swallowing the previous slot.
fn claim_window(
    schedule: &CronSchedule,
    slot: DateTime<Utc>,
    tick_period: Duration,
) -> chrono::Duration {
    let half_spacing = schedule
        .spacing_after(slot)
        .map(|d| d / 2)
        .unwrap_or(tick_period);
    chrono::Duration::from_std(tick_period.min(half_spacing))
        .unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let mut b = StoreBackoff::new(Duration::from_secs(15), Duration::from_secs(50));
        assert!(!b.active());
        assert_eq!(b.failure(), Duration::from_secs(15));
        assert!(b.active());
        assert_eq!(b.failure(), Duration::from_secs(30));
        assert_eq!(b.failure(), Duration::from_secs(50));
        assert_eq!(b.failure(), Duration::from_secs(50));

        tokio::time::advance(Duration::from_secs(51)).await;
        assert!(!b.active());
        b.reset();
        assert_eq!(b.failure(), Duration::from_secs(15));
    }

    #[test]
    fn claim_window_is_bounded_by_half_spacing() {
        let every_minute = CronSchedule::parse("* * * * *").unwrap();
        let slot = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(
            claim_window(&every_minute, slot, Duration::from_secs(15)),
            chrono::Duration::seconds(15)
        );
        assert_eq!(
            claim_window(&every_minute, slot, Duration::from_secs(120)),
            chrono::Duration::seconds(30)
        );
    }
}
