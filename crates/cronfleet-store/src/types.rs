use chrono::{DateTime, Utc};
use cronfleet_core::{JobId, RunnerId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a lease row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Released by its last holder; acquirable immediately.
    Free,
    /// Exclusively held until `expires_at`.
    Held,
    /// Holder is wrapping up. Still exclusive until `expires_at`, no longer renewable.
    Releasing,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaseStatus::Free => "free",
            LeaseStatus::Held => "held",
            LeaseStatus::Releasing => "releasing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LeaseStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "free" => Ok(LeaseStatus::Free),
            "held" => Ok(LeaseStatus::Held),
            "releasing" => Ok(LeaseStatus::Releasing),
            other => Err(format!("unknown lease status: {other}")),
        }
    }
}

/// One row of the `leases` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub holder_id: RunnerId,
    /// Strictly increases on every successful acquisition of this job.
    pub fencing_token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: LeaseStatus,
}

impl Lease {
    /// Whether this lease still excludes other runners at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status != LeaseStatus::Free && self.expires_at > now
    }
}

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Lease),
    /// Another live lease holds the slot. Normal contention, not a fault.
    Busy {
        holder_id: RunnerId,
        expires_at: DateTime<Utc>,
    },
}

/// One row of the `heartbeats` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub runner_id: RunnerId,
    pub last_seen_at: DateTime<Utc>,
    pub status_note: String,
}

/// Final result of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "timeout" => Ok(Outcome::Timeout),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// An execution record before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExecutionRecord {
    pub job_id: JobId,
    pub runner_id: RunnerId,
    pub fencing_token: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    /// Free-text reason, e.g. `lease_lost` or a stderr tail.
    pub detail: Option<String>,
}

/// A persisted, immutable row of `execution_records`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub job_id: JobId,
    pub runner_id: RunnerId,
    pub fencing_token: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

impl ExecutionRecord {
    pub fn from_new(id: i64, rec: NewExecutionRecord) -> Self {
        Self {
            id,
            job_id: rec.job_id,
            runner_id: rec.runner_id,
            fencing_token: rec.fencing_token,
            started_at: rec.started_at,
            finished_at: rec.finished_at,
            outcome: rec.outcome,
            detail: rec.detail,
        }
    }
}
