use std::collections::HashSet;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::types::{JobDefinition, RunnerIdentity};

pub const DEFAULT_TICK_SECS: u64 = 15;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_LEASE_TTL_SECS: u64 = 60;
pub const DEFAULT_MAX_DURATION_SECS: u64 = 600;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Top-level config (cronfleet.toml + CRONFLEET_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Explicit runner id. When unset the id is derived from the machine.
    pub id: Option<String>,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Upper bound on any single store call before it counts as unavailable.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Free-text note written with every heartbeat (e.g. "home desktop").
    pub status_note: Option<String>,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            id: None,
            tick_secs: DEFAULT_TICK_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            status_note: None,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
        }
    }
}

impl RunnerConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    /// Build the identity for this process, honouring an explicit `id`.
    pub fn identity(&self) -> RunnerIdentity {
        match &self.id {
            Some(id) => RunnerIdentity::new(id.as_str()),
            None => RunnerIdentity::from_machine(),
        }
    }
}

/// Where the shared lock store lives.
///
/// Setting `url` selects PostgreSQL, which is what a fleet spread over
/// several hosts needs. Without it the store is the SQLite file at `path`,
/// usable only by runners on one host with the file on local disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL, e.g. `postgres://cron@db.lan/cronfleet`.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_db_path")]
    pub path: String,
    /// SQLite busy handler timeout for lock contention between runners.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    /// Whether the PostgreSQL backend is configured.
    pub fn uses_postgres(&self) -> bool {
        self.url.is_some()
    }
}

/// One `[[jobs]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub schedule: String,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    pub command: Option<String>,
}

impl JobConfig {
    fn to_definition(&self) -> Result<JobDefinition> {
        let invalid = |reason: &str| FleetError::InvalidJob {
            job_id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.schedule.trim().is_empty() {
            return Err(invalid("schedule must not be empty"));
        }
        if self.max_duration_secs == 0 {
            return Err(invalid("max_duration_secs must be positive"));
        }
        if self.lease_ttl_secs == 0 {
            return Err(invalid("lease_ttl_secs must be positive"));
        }

        let mut def = JobDefinition::new(
            self.id.as_str(),
            self.schedule.trim(),
            Duration::from_secs(self.max_duration_secs),
            Duration::from_secs(self.lease_ttl_secs),
        );
        def.command = self.command.clone();
        Ok(def)
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT_SECS
}
fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}
fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_backoff_max_secs() -> u64 {
    DEFAULT_BACKOFF_MAX_SECS
}
fn default_max_duration_secs() -> u64 {
    DEFAULT_MAX_DURATION_SECS
}
fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronfleet/cronfleet.db", home)
}

impl FleetConfig {
    /// Load config from a TOML file with CRONFLEET_* env var overrides.
    ///
    /// Nested keys use a double underscore: `CRONFLEET_RUNNER__TICK_SECS=5`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading config");

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CRONFLEET_").split("__")),
        )
    }

    /// Extract and validate from an already-assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: FleetConfig = figment
            .extract()
            .map_err(|e| FleetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runner.tick_secs == 0 {
            return Err(FleetError::Config("runner.tick_secs must be positive".into()));
        }
        if self.runner.heartbeat_secs == 0 {
            return Err(FleetError::Config(
                "runner.heartbeat_secs must be positive".into(),
            ));
        }
        if self.runner.store_timeout_ms == 0 {
            return Err(FleetError::Config(
                "runner.store_timeout_ms must be positive".into(),
            ));
        }
        if let Some(url) = &self.database.url {
            if url.trim().is_empty() {
                return Err(FleetError::Config("database.url must not be empty".into()));
            }
            if self.database.max_connections == 0 {
                return Err(FleetError::Config(
                    "database.max_connections must be positive".into(),
                ));
            }
        }
        self.job_definitions().map(|_| ())
    }

    /// Convert the `[[jobs]]` table into definitions, rejecting duplicates.
    pub fn job_definitions(&self) -> Result<Vec<JobDefinition>> {
        let mut seen = HashSet::new();
        let mut defs = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if !seen.insert(job.id.as_str()) {
                return Err(FleetError::InvalidJob {
                    job_id: job.id.clone(),
                    reason: "duplicate job id".to_string(),
                });
            }
            defs.push(job.to_definition()?);
        }
        Ok(defs)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronfleet/cronfleet.toml", home)
}
