// Shared fixtures for scheduler simulations.
// Time is tokio's paused clock; the store reads the same clock through
// `TokioClock`, so lease expiry and tick timing stay in lockstep.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronfleet_core::{Clock, JobDefinition, RunnerId};
use cronfleet_scheduler::{
    EngineSettings, InFlight, JobBody, JobContext, JobExecutor, JobRegistry, LockManager,
    SchedulerEngine,
};
use cronfleet_store::MemoryLockStore;

pub const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Wall clock that advances with tokio's (possibly paused) time.
#[derive(Debug)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: DateTime::<Utc>::UNIX_EPOCH,
            start: tokio::time::Instant::now(),
        })
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap();
        self.origin + elapsed
    }
}

pub fn store() -> Arc<MemoryLockStore> {
    MemoryLockStore::new(TokioClock::new())
}

pub fn lock(store: &Arc<MemoryLockStore>, runner: &str) -> LockManager {
    LockManager::new(store.clone(), RunnerId::from(runner), OP_TIMEOUT)
}

pub fn job(id: &str, schedule: &str, max_secs: u64, ttl_secs: u64) -> JobDefinition {
    JobDefinition::new(
        id,
        schedule,
        Duration::from_secs(max_secs),
        Duration::from_secs(ttl_secs),
    )
}

pub fn engine(
    store: &Arc<MemoryLockStore>,
    runner: &str,
    tick_secs: u64,
    def: JobDefinition,
    body: Arc<dyn JobBody>,
) -> SchedulerEngine {
    let mut registry = JobRegistry::new();
    registry.register(def.job_id.clone(), body);
    let settings = EngineSettings {
        tick_period: Duration::from_secs(tick_secs),
        backoff_max: Duration::from_secs(60),
    };
    SchedulerEngine::new(
        vec![def],
        &registry,
        JobExecutor::new(lock(store, runner)),
        InFlight::new(),
        settings,
    )
    .unwrap()
}

/// Sleeps for `work`, tracking how many copies run at once.
#[derive(Default)]
pub struct Tracked {
    pub work: Duration,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub completed: AtomicUsize,
}

impl Tracked {
    pub fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            ..Default::default()
        })
    }
}

#[async_trait]
impl JobBody for Tracked {
    async fn run(&self, _ctx: JobContext) -> Result<(), String> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Never finishes and ignores cancellation.
pub struct Hangs;

#[async_trait]
impl JobBody for Hangs {
    async fn run(&self, _ctx: JobContext) -> Result<(), String> {
        std::future::pending::<()>().await;
        Ok(())
    }
}
