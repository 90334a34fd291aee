use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use cronfleet_core::JobId;

/// Runner-local set of job ids that currently have an executor running.
///
/// A job id enters the set when its slot is claimed and leaves it when the
/// returned [`InFlightGuard`] is dropped, so a panicking executor task cannot
/// wedge the job forever.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    jobs: Arc<Mutex<BTreeSet<JobId>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `job_id`. Returns `None` if it is already in flight.
    pub fn try_claim(&self, job_id: &JobId) -> Option<InFlightGuard> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if !jobs.insert(job_id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            jobs: Arc::clone(&self.jobs),
            job_id: job_id.clone(),
        })
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }

    /// Sorted snapshot of the running job ids.
    pub fn snapshot(&self) -> Vec<JobId> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its job id from the owning [`InFlight`] set on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    jobs: Arc<Mutex<BTreeSet<JobId>>>,
    job_id: JobId,
}

impl InFlightGuard {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_until_guard_drops() {
        let set = InFlight::new();
        let job = JobId::from("card_sync");

        let guard = set.try_claim(&job).unwrap();
        assert!(set.try_claim(&job).is_none());
        assert!(set.contains(&job));
        assert_eq!(guard.job_id(), &job);

        drop(guard);
        assert!(set.is_empty());
        assert!(set.try_claim(&job).is_some());
    }

    #[test]
    fn snapshot_is_sorted() {
        let set = InFlight::new();
        let _b = set.try_claim(&JobId::from("market_sync")).unwrap();
        let _a = set.try_claim(&JobId::from("card_sync")).unwrap();
        let ids: Vec<String> = set.snapshot().into_iter().map(|j| j.0).collect();
        assert_eq!(ids, vec!["card_sync", "market_sync"]);
    }
}
