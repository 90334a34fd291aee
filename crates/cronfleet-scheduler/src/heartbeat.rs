//! Liveness signal, on its own timer.
//!
//! The reporter shares nothing with the scheduler loop except the read-only
//! [`InFlight`] view used to build the status note. A failed upsert is logged
//! and retried next period; it never reaches the scheduler.

use std::sync::Arc;
use std::time::Duration;

use cronfleet_core::RunnerId;
use cronfleet_store::LockStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::in_flight::InFlight;

pub struct HeartbeatReporter {
    store: Arc<dyn LockStore>,
    runner_id: RunnerId,
    period: Duration,
    op_timeout: Duration,
    base_note: Option<String>,
    in_flight: InFlight,
}

impl HeartbeatReporter {
    pub fn new(
        store: Arc<dyn LockStore>,
        runner_id: RunnerId,
        period: Duration,
        op_timeout: Duration,
        in_flight: InFlight,
    ) -> Self {
        Self {
            store,
            runner_id,
            period,
            op_timeout,
            base_note: None,
            in_flight,
        }
    }

    /// Free text prefixed to every status note, e.g. `home desktop`.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.base_note = Some(note.into());
        self
    }

    /// `"<base>; running: a,b"`, or `"idle"` when nothing is in flight.
    pub fn status_note(&self) -> String {
        let jobs = self.in_flight.snapshot();
        let activity = if jobs.is_empty() {
            "idle".to_string()
        } else {
            let names: Vec<&str> = jobs.iter().map(|j| j.as_str()).collect();
            format!("running: {}", names.join(","))
        };
        match &self.base_note {
            Some(base) if !base.is_empty() => format!("{base}; {activity}"),
            _ => activity,
        }
    }

    /// One upsert. Returns whether it reached the store.
    pub async fn beat(&self) -> bool {
        let note = self.status_note();
        match tokio::time::timeout(
            self.op_timeout,
            self.store.upsert_heartbeat(&self.runner_id, &note),
        )
        .await
        {
            Ok(Ok(hb)) => {
                debug!(runner_id = %self.runner_id, last_seen_at = %hb.last_seen_at, "heartbeat");
                true
            }
            Ok(Err(e)) => {
                warn!(runner_id = %self.runner_id, error = %e, "heartbeat write failed");
                false
            }
            Err(_) => {
                warn!(
                    runner_id = %self.runner_id,
                    timeout_ms = self.op_timeout.as_millis() as u64,
                    "heartbeat write timed out"
                );
                false
            }
        }
    }

    /// Beat every period until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(runner_id = %self.runner_id, period_secs = self.period.as_secs(), "heartbeat reporter started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.beat().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(runner_id = %self.runner_id, "heartbeat reporter shutting down");
                        break;
                    }
                }
            }
        }
    }
}
