//! In-process lock store with the same semantics as the SQLite backend.
//!
//! Several simulated runners share one `Arc<MemoryLockStore>`. Each lease
//! decision happens under the `DashMap` entry lock for that job, which plays
//! the role of the database's conditional write. Faults can be injected to
//! exercise unavailability and slow-store paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronfleet_core::{Clock, JobId, RunnerId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Result, StoreError};
use crate::store::{expiry_from, renewed_expiry, stale_cutoff, LockStore};
use crate::types::{
    AcquireOutcome, ExecutionRecord, Heartbeat, Lease, LeaseStatus, NewExecutionRecord,
};

#[derive(Debug)]
pub struct MemoryLockStore {
    clock: Arc<dyn Clock>,
    leases: DashMap<JobId, Lease>,
    heartbeats: DashMap<RunnerId, Heartbeat>,
    records: Mutex<Vec<ExecutionRecord>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    acquire_latency_ms: AtomicU64,
    heartbeat_writes: AtomicU64,
}

impl MemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            leases: DashMap::new(),
            heartbeats: DashMap::new(),
            records: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            acquire_latency_ms: AtomicU64::new(0),
            heartbeat_writes: AtomicU64::new(0),
        })
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency` (tokio time).
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(millis(latency), Ordering::SeqCst);
    }

    /// Delay only `try_acquire`, after the fault check and before the write.
    /// Models an acquisition that commits long after the caller gave up.
    pub fn set_acquire_latency(&self, latency: Duration) {
        self.acquire_latency_ms.store(millis(latency), Ordering::SeqCst);
    }

    /// Total successful heartbeat upserts, across all runners.
    pub fn heartbeat_writes(&self) -> u64 {
        self.heartbeat_writes.load(Ordering::SeqCst)
    }

    pub fn execution_count(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn gate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn try_acquire(
        &self,
        job_id: &JobId,
        holder: &RunnerId,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        self.gate().await?;
        let delay = self.acquire_latency_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let now = self.clock.now();
        let fresh = |token: u64| Lease {
            job_id: job_id.clone(),
            holder_id: holder.clone(),
            fencing_token: token,
            acquired_at: now,
            expires_at: expiry_from(now, ttl),
            status: LeaseStatus::Held,
        };

        match self.leases.entry(job_id.clone()) {
            Entry::Vacant(slot) => {
                let lease = fresh(1);
                slot.insert(lease.clone());
                Ok(AcquireOutcome::Acquired(lease))
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.is_live_at(now) {
                    return Ok(AcquireOutcome::Busy {
                        holder_id: current.holder_id.clone(),
                        expires_at: current.expires_at,
                    });
                }
                let lease = fresh(current.fencing_token + 1);
                slot.insert(lease.clone());
                Ok(AcquireOutcome::Acquired(lease))
            }
        }
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        self.gate().await?;
        let now = self.clock.now();
        let Some(mut current) = self.leases.get_mut(&lease.job_id) else {
            return Ok(None);
        };
        let valid = current.fencing_token == lease.fencing_token
            && current.holder_id == lease.holder_id
            && current.status == LeaseStatus::Held
            && current.expires_at > now;
        if !valid {
            return Ok(None);
        }
        current.expires_at = renewed_expiry(now, ttl, current.expires_at);
        Ok(Some(current.clone()))
    }

    async fn mark_releasing(&self, lease: &Lease) -> Result<bool> {
        self.gate().await?;
        let Some(mut current) = self.leases.get_mut(&lease.job_id) else {
            return Ok(false);
        };
        if current.fencing_token != lease.fencing_token
            || current.holder_id != lease.holder_id
            || current.status != LeaseStatus::Held
        {
            return Ok(false);
        }
        current.status = LeaseStatus::Releasing;
        Ok(true)
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        self.gate().await?;
        let Some(mut current) = self.leases.get_mut(&lease.job_id) else {
            return Ok(false);
        };
        if current.fencing_token != lease.fencing_token
            || current.holder_id != lease.holder_id
            || current.status == LeaseStatus::Free
        {
            return Ok(false);
        }
        current.status = LeaseStatus::Free;
        Ok(true)
    }

    async fn get_lease(&self, job_id: &JobId) -> Result<Option<Lease>> {
        self.gate().await?;
        Ok(self.leases.get(job_id).map(|l| l.clone()))
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        self.gate().await?;
        let mut leases: Vec<Lease> = self.leases.iter().map(|e| e.value().clone()).collect();
        leases.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(leases)
    }

    async fn validate_fence(&self, job_id: &JobId, token: u64) -> Result<bool> {
        self.gate().await?;
        let now = self.clock.now();
        Ok(self
            .leases
            .get(job_id)
            .is_some_and(|l| l.fencing_token == token && l.is_live_at(now)))
    }

    async fn upsert_heartbeat(
        &self,
        runner_id: &RunnerId,
        status_note: &str,
    ) -> Result<Heartbeat> {
        self.gate().await?;
        let hb = Heartbeat {
            runner_id: runner_id.clone(),
            last_seen_at: self.clock.now(),
            status_note: status_note.to_string(),
        };
        self.heartbeats.insert(runner_id.clone(), hb.clone());
        self.heartbeat_writes.fetch_add(1, Ordering::SeqCst);
        Ok(hb)
    }

    async fn list_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        self.gate().await?;
        let mut rows: Vec<Heartbeat> = self.heartbeats.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
        Ok(rows)
    }

    async fn list_stale_heartbeats(&self, threshold: Duration) -> Result<Vec<Heartbeat>> {
        self.gate().await?;
        let cutoff = stale_cutoff(self.clock.now(), threshold);
        let mut rows: Vec<Heartbeat> = self
            .heartbeats
            .iter()
            .filter(|e| e.value().last_seen_at < cutoff)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|h| h.last_seen_at);
        Ok(rows)
    }

    async fn append_execution(&self, record: NewExecutionRecord) -> Result<ExecutionRecord> {
        self.gate().await?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = ExecutionRecord::from_new(records.len() as i64 + 1, record);
        records.push(rec.clone());
        Ok(rec)
    }

    async fn list_recent_execution_records(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.gate().await?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<ExecutionRecord> = records
            .iter()
            .filter(|r| &r.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronfleet_core::ManualClock;

    #[tokio::test]
    async fn injected_fault_surfaces_as_unavailable() {
        let store = MemoryLockStore::new(Arc::new(ManualClock::at_epoch()));
        store.set_unavailable(true);
        let err = store
            .upsert_heartbeat(&RunnerId::from("pi"), "idle")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.heartbeat_writes(), 0);

        store.set_unavailable(false);
        store.upsert_heartbeat(&RunnerId::from("pi"), "idle").await.unwrap();
        assert_eq!(store.heartbeat_writes(), 1);
    }

    #[tokio::test]
    async fn release_with_stale_token_is_refused() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = MemoryLockStore::new(clock.clone());
        let job = JobId::from("card_sync");
        let ttl = Duration::from_secs(60);

        let AcquireOutcome::Acquired(old) =
            store.try_acquire(&job, &RunnerId::from("r1"), ttl).await.unwrap()
        else {
            panic!("first acquire must win");
        };
        clock.advance(Duration::from_secs(61));
        let AcquireOutcome::Acquired(new) =
            store.try_acquire(&job, &RunnerId::from("r2"), ttl).await.unwrap()
        else {
            panic!("expired lease must be acquirable");
        };

        assert!(!store.release(&old).await.unwrap());
        let current = store.get_lease(&job).await.unwrap().unwrap();
        assert_eq!(current.fencing_token, new.fencing_token);
        assert_eq!(current.status, LeaseStatus::Held);
    }
}
