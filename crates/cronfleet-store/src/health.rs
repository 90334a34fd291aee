//! Read-only view used by external alerting.
//!
//! Nothing here mutates the store. Results are eventually consistent within
//! one heartbeat / tick period, not linearizable: a runner that just died can
//! still look fresh until its heartbeat ages past the threshold.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronfleet_core::JobId;
use serde::Serialize;

use crate::error::Result;
use crate::store::LockStore;
use crate::types::{ExecutionRecord, Heartbeat, Lease};

#[derive(Clone)]
pub struct HealthReader {
    store: Arc<dyn LockStore>,
}

/// Point-in-time summary of the fleet for operators.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub stale_after_secs: u64,
    pub heartbeats: Vec<Heartbeat>,
    pub stale_runners: Vec<Heartbeat>,
    pub leases: Vec<LeaseView>,
    pub recent: Vec<ExecutionRecord>,
}

/// A lease plus whether it currently excludes other runners.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseView {
    #[serde(flatten)]
    pub lease: Lease,
    pub live: bool,
}

impl HealthReader {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub async fn list_stale_heartbeats(&self, threshold: Duration) -> Result<Vec<Heartbeat>> {
        self.store.list_stale_heartbeats(threshold).await
    }

    pub async fn list_recent_execution_records(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.store.list_recent_execution_records(job_id, limit).await
    }

    /// Assemble a snapshot. When `job_id` is `None`, recent records are
    /// gathered for every job that has a lease row.
    pub async fn snapshot(
        &self,
        stale_after: Duration,
        job_id: Option<&JobId>,
        limit: usize,
    ) -> Result<FleetSnapshot> {
        let now = self.store.now();
        let heartbeats = self.store.list_heartbeats().await?;
        let stale_runners = self.store.list_stale_heartbeats(stale_after).await?;
        let leases = self.store.list_leases().await?;

        let recent = match job_id {
            Some(id) => self.store.list_recent_execution_records(id, limit).await?,
            None => {
                let mut all = Vec::new();
                for lease in &leases {
                    all.extend(
                        self.store
                            .list_recent_execution_records(&lease.job_id, limit)
                            .await?,
                    );
                }
                all.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
                all
            }
        };

        Ok(FleetSnapshot {
            taken_at: now,
            stale_after_secs: stale_after.as_secs(),
            heartbeats,
            stale_runners,
            leases: leases
                .into_iter()
                .map(|lease| LeaseView {
                    live: lease.is_live_at(now),
                    lease,
                })
                .collect(),
            recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockStore;
    use crate::types::{AcquireOutcome, NewExecutionRecord, Outcome};
    use cronfleet_core::{Clock, ManualClock, RunnerId};

    #[tokio::test]
    async fn snapshot_reports_stale_runner_and_live_lease() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = MemoryLockStore::new(clock.clone());
        let reader = HealthReader::new(store.clone());

        store.upsert_heartbeat(&RunnerId::from("desktop"), "idle").await.unwrap();
        clock.advance(Duration::from_secs(120));
        store.upsert_heartbeat(&RunnerId::from("pi"), "running: card_sync").await.unwrap();

        let job = JobId::from("card_sync");
        let AcquireOutcome::Acquired(lease) = store
            .try_acquire(&job, &RunnerId::from("pi"), Duration::from_secs(60))
            .await
            .unwrap()
        else {
            panic!("acquire failed");
        };
        store
            .append_execution(NewExecutionRecord {
                job_id: job.clone(),
                runner_id: lease.holder_id.clone(),
                fencing_token: lease.fencing_token,
                started_at: clock.now(),
                finished_at: clock.now(),
                outcome: Outcome::Success,
                detail: None,
            })
            .await
            .unwrap();

        let snap = reader.snapshot(Duration::from_secs(90), None, 5).await.unwrap();
        assert_eq!(snap.heartbeats.len(), 2);
        assert_eq!(snap.stale_runners.len(), 1);
        assert_eq!(snap.stale_runners[0].runner_id.as_str(), "desktop");
        assert_eq!(snap.leases.len(), 1);
        assert!(snap.leases[0].live);
        assert_eq!(snap.recent.len(), 1);

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains(r#""status":"held""#));
    }
}
