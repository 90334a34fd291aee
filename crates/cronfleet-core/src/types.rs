use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable identifier of a runner process (survives restarts on the same machine).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerId(pub String);

impl RunnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique name of a scheduled job, e.g. `card_sync`. Doubles as the lease key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Process-local identity, generated once at startup.
///
/// `runner_id` is what other runners see in lease and heartbeat rows;
/// `instance_id` (UUIDv7) changes on every start so log lines from two
/// incarnations of the same runner can be told apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerIdentity {
    pub runner_id: RunnerId,
    pub instance_id: String,
    pub process_start_time: DateTime<Utc>,
}

impl RunnerIdentity {
    pub fn new(runner_id: impl Into<RunnerId>) -> Self {
        Self {
            runner_id: runner_id.into(),
            instance_id: Uuid::now_v7().to_string(),
            process_start_time: Utc::now(),
        }
    }

    /// Derive the runner id from the machine: `{hostname}-{sha256(machine-id)[..8]}`.
    ///
    /// Falls back to the bare hostname when no machine-id file is readable.
    pub fn from_machine() -> Self {
        let host = hostname();
        let machine_id = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let id = match machine_id {
            Some(mid) => {
                let digest = Sha256::digest(mid.as_bytes());
                format!("{}-{}", host, &hex::encode(digest)[..8])
            }
            None => host,
        };
        Self::new(id)
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "runner".to_string())
}

/// Immutable descriptor of a periodic job, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub job_id: JobId,
    /// Cron expression or `@every` interval; parsed by the scheduler.
    pub schedule_expr: String,
    /// Hard deadline for one execution.
    pub max_duration: Duration,
    /// Lease length granted on acquisition and on every renewal.
    pub lease_ttl: Duration,
    /// Shell command used as the job body when no in-process body is registered.
    pub command: Option<String>,
}

impl JobDefinition {
    pub fn new(
        job_id: impl Into<JobId>,
        schedule_expr: impl Into<String>,
        max_duration: Duration,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            schedule_expr: schedule_expr.into(),
            max_duration,
            lease_ttl,
            command: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_differ_per_identity() {
        let a = RunnerIdentity::new("pi");
        let b = RunnerIdentity::new("pi");
        assert_eq!(a.runner_id, b.runner_id);
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[test]
    fn machine_identity_is_stable() {
        let a = RunnerIdentity::from_machine();
        let b = RunnerIdentity::from_machine();
        assert_eq!(a.runner_id, b.runner_id);
        assert!(!a.runner_id.as_str().is_empty());
    }
}
