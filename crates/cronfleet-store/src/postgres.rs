//! PostgreSQL lock store, the backend for runners spread over several hosts.
//!
//! Every expiry comparison and every timestamp written to `leases` or
//! `heartbeats` comes from the server's `now()` inside the statement itself,
//! so a runner whose wall clock has drifted can neither steal a live lease
//! nor make its own look fresher than it is. [`LockStore::now`] on this store
//! is the local clock corrected by the offset to the server observed on the
//! most recent round trip; it is only used for log lines and for timestamps
//! on execution records.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronfleet_core::{Clock, JobId, RunnerId, SystemClock};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::error::{Result, StoreError};
use crate::store::LockStore;
use crate::types::{
    AcquireOutcome, ExecutionRecord, Heartbeat, Lease, LeaseStatus, NewExecutionRecord, Outcome,
};

const LEASE_COLUMNS: &str =
    "job_id, holder_id, fencing_token, acquired_at, expires_at, status";
const RECORD_COLUMNS: &str =
    "id, job_id, runner_id, fencing_token, started_at, finished_at, outcome, detail";

/// Serialises schema creation between runners starting at the same time.
const SCHEMA_LOCK_KEY: i64 = 0x6372_6f6e_666c_7431;

/// Longest interval handed to `make_interval`. Larger TTLs and thresholds
/// are clamped here instead of overflowing the server's interval type.
const MAX_INTERVAL_SECS: f64 = 100.0 * 365.0 * 86_400.0;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS leases (
        job_id         TEXT        NOT NULL PRIMARY KEY,
        holder_id      TEXT        NOT NULL,
        fencing_token  BIGINT      NOT NULL,
        acquired_at    TIMESTAMPTZ NOT NULL,
        expires_at     TIMESTAMPTZ NOT NULL,
        status         TEXT        NOT NULL DEFAULT 'held'
                       CHECK (status IN ('free', 'held', 'releasing'))
    )",
    "CREATE TABLE IF NOT EXISTS heartbeats (
        runner_id      TEXT        NOT NULL PRIMARY KEY,
        last_seen_at   TIMESTAMPTZ NOT NULL,
        status_note    TEXT        NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS execution_records (
        id             BIGSERIAL   PRIMARY KEY,
        job_id         TEXT        NOT NULL,
        runner_id      TEXT        NOT NULL,
        fencing_token  BIGINT      NOT NULL,
        started_at     TIMESTAMPTZ NOT NULL,
        finished_at    TIMESTAMPTZ NOT NULL,
        outcome        TEXT        NOT NULL
                       CHECK (outcome IN ('success', 'failure', 'timeout')),
        detail         TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_exec_job_finished
        ON execution_records (job_id, finished_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_heartbeats_seen
        ON heartbeats (last_seen_at)",
];

/// Lock store backed by a shared PostgreSQL database.
pub struct PgLockStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    /// Server clock minus local clock, in milliseconds.
    offset_ms: AtomicI64,
}

impl PgLockStore {
    /// Connect to `url` and make sure the schema exists.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        info!(max_connections, "connecting to PostgreSQL lock store");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Self::from_pool(pool, Arc::new(SystemClock)).await
    }

    /// Wrap an existing pool. `clock` is the runner's local clock; it never
    /// takes part in lease decisions.
    pub async fn from_pool(pool: PgPool, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self {
            pool,
            clock,
            offset_ms: AtomicI64::new(0),
        };
        store.init_schema().await?;
        store.sync_clock().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Re-read the server clock and update the local offset.
    pub async fn sync_clock(&self) -> Result<DateTime<Utc>> {
        let row = sqlx::query("SELECT now() AS server_now")
            .fetch_one(&self.pool)
            .await?;
        self.observe(&row)
    }

    /// Current server-minus-local clock offset.
    pub fn clock_offset(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Record the `server_now` column of `row` as the latest server time.
    fn observe(&self, row: &PgRow) -> Result<DateTime<Utc>> {
        let server_now: DateTime<Utc> = row.try_get("server_now")?;
        let offset = (server_now - self.clock.now()).num_milliseconds();
        let previous = self.offset_ms.swap(offset, Ordering::Relaxed);
        if (offset - previous).abs() > 1_000 {
            debug!(offset_ms = offset, "store clock offset changed");
        }
        Ok(server_now)
    }
}

impl std::fmt::Debug for PgLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLockStore")
            .field("clock", &self.clock)
            .field("offset_ms", &self.offset_ms.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    fn now(&self) -> DateTime<Utc> {
        let local = self.clock.now();
        local
            .checked_add_signed(self.clock_offset())
            .unwrap_or(local)
    }

    #[instrument(skip_all, fields(job_id = %job_id, holder = %holder))]
    async fn try_acquire(
        &self,
        job_id: &JobId,
        holder: &RunnerId,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        // Same exclusion rule as the SQLite backend, but judged by the server
        // clock: overwrite only a released row or one whose lease has run out.
        let won = sqlx::query(&format!(
            "INSERT INTO leases AS l
             (job_id, holder_id, fencing_token, acquired_at, expires_at, status)
             VALUES ($1, $2, 1, now(), now() + make_interval(secs => $3), 'held')
             ON CONFLICT (job_id) DO UPDATE SET
                holder_id     = EXCLUDED.holder_id,
                fencing_token = l.fencing_token + 1,
                acquired_at   = EXCLUDED.acquired_at,
                expires_at    = EXCLUDED.expires_at,
                status        = 'held'
             WHERE l.status = 'free' OR l.expires_at <= now()
             RETURNING {LEASE_COLUMNS}, now() AS server_now"
        ))
        .bind(job_id.as_str())
        .bind(holder.as_str())
        .bind(interval_secs(ttl))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = won {
            self.observe(&row)?;
            let lease = row_to_lease(&row)?;
            info!(token = lease.fencing_token, expires_at = %lease.expires_at, "lease acquired");
            return Ok(AcquireOutcome::Acquired(lease));
        }

        // The conflicting row was live when the upsert ran. It cannot be
        // deleted, so it is still there to report.
        let row = sqlx::query(&format!(
            "SELECT {LEASE_COLUMNS}, now() AS server_now FROM leases WHERE job_id = $1"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::Unavailable(format!("lease row for {job_id} vanished")))?;
        self.observe(&row)?;
        let lease = row_to_lease(&row)?;
        debug!(current = %lease.holder_id, "lease busy");
        Ok(AcquireOutcome::Busy {
            holder_id: lease.holder_id,
            expires_at: lease.expires_at,
        })
    }

    #[instrument(skip_all, fields(job_id = %lease.job_id, token = lease.fencing_token))]
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        let row = sqlx::query(&format!(
            "UPDATE leases SET expires_at = GREATEST(
                now() + make_interval(secs => $1),
                expires_at + interval '1 millisecond')
             WHERE job_id = $2 AND holder_id = $3 AND fencing_token = $4
               AND status = 'held' AND expires_at > now()
             RETURNING {LEASE_COLUMNS}, now() AS server_now"
        ))
        .bind(interval_secs(ttl))
        .bind(lease.job_id.as_str())
        .bind(lease.holder_id.as_str())
        .bind(lease.fencing_token as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                self.observe(&row)?;
                Ok(Some(row_to_lease(&row)?))
            }
            None => Ok(None),
        }
    }

    async fn mark_releasing(&self, lease: &Lease) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE leases SET status = 'releasing'
             WHERE job_id = $1 AND holder_id = $2 AND fencing_token = $3
               AND status = 'held'",
        )
        .bind(lease.job_id.as_str())
        .bind(lease.holder_id.as_str())
        .bind(lease.fencing_token as i64)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip_all, fields(job_id = %lease.job_id, token = lease.fencing_token))]
    async fn release(&self, lease: &Lease) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE leases SET status = 'free'
             WHERE job_id = $1 AND holder_id = $2 AND fencing_token = $3
               AND status IN ('held', 'releasing')",
        )
        .bind(lease.job_id.as_str())
        .bind(lease.holder_id.as_str())
        .bind(lease.fencing_token as i64)
        .execute(&self.pool)
        .await?;
        let released = done.rows_affected() == 1;
        if released {
            info!("lease released");
        }
        Ok(released)
    }

    async fn get_lease(&self, job_id: &JobId) -> Result<Option<Lease>> {
        let row = sqlx::query(&format!(
            "SELECT {LEASE_COLUMNS}, now() AS server_now FROM leases WHERE job_id = $1"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                self.observe(&row)?;
                Ok(Some(row_to_lease(&row)?))
            }
            None => Ok(None),
        }
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let rows = sqlx::query(&format!("SELECT {LEASE_COLUMNS} FROM leases ORDER BY job_id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row_to_lease(row).map_err(StoreError::from))
            .collect()
    }

    async fn validate_fence(&self, job_id: &JobId, token: u64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (
                SELECT 1 FROM leases
                WHERE job_id = $1 AND fencing_token = $2
                  AND status <> 'free' AND expires_at > now()
             ) AS is_current, now() AS server_now",
        )
        .bind(job_id.as_str())
        .bind(token as i64)
        .fetch_one(&self.pool)
        .await?;
        self.observe(&row)?;
        Ok(row.try_get::<bool, _>("is_current")?)
    }

    async fn upsert_heartbeat(
        &self,
        runner_id: &RunnerId,
        status_note: &str,
    ) -> Result<Heartbeat> {
        let row = sqlx::query(
            "INSERT INTO heartbeats (runner_id, last_seen_at, status_note)
             VALUES ($1, now(), $2)
             ON CONFLICT (runner_id) DO UPDATE SET
                last_seen_at = EXCLUDED.last_seen_at,
                status_note  = EXCLUDED.status_note
             RETURNING runner_id, last_seen_at, status_note, now() AS server_now",
        )
        .bind(runner_id.as_str())
        .bind(status_note)
        .fetch_one(&self.pool)
        .await?;
        self.observe(&row)?;
        Ok(row_to_heartbeat(&row)?)
    }

    async fn list_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        let rows = sqlx::query(
            "SELECT runner_id, last_seen_at, status_note
             FROM heartbeats ORDER BY runner_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_heartbeat(row).map_err(StoreError::from))
            .collect()
    }

    async fn list_stale_heartbeats(&self, threshold: Duration) -> Result<Vec<Heartbeat>> {
        let rows = sqlx::query(
            "SELECT runner_id, last_seen_at, status_note
             FROM heartbeats
             WHERE last_seen_at < now() - make_interval(secs => $1)
             ORDER BY last_seen_at",
        )
        .bind(interval_secs(threshold))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_heartbeat(row).map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip_all, fields(job_id = %record.job_id, outcome = %record.outcome))]
    async fn append_execution(&self, record: NewExecutionRecord) -> Result<ExecutionRecord> {
        let row = sqlx::query(
            "INSERT INTO execution_records
             (job_id, runner_id, fencing_token, started_at, finished_at, outcome, detail)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(record.job_id.as_str())
        .bind(record.runner_id.as_str())
        .bind(record.fencing_token as i64)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.outcome.to_string())
        .bind(record.detail.as_deref())
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.try_get("id")?;
        Ok(ExecutionRecord::from_new(id, record))
    }

    async fn list_recent_execution_records(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM execution_records
             WHERE job_id = $1
             ORDER BY finished_at DESC, id DESC
             LIMIT $2"
        ))
        .bind(job_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_record(row).map_err(StoreError::from))
            .collect()
    }
}

fn interval_secs(d: Duration) -> f64 {
    d.as_secs_f64().min(MAX_INTERVAL_SECS)
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn row_to_lease(row: &PgRow) -> std::result::Result<Lease, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Lease {
        job_id: JobId(row.try_get("job_id")?),
        holder_id: RunnerId(row.try_get("holder_id")?),
        fencing_token: row.try_get::<i64, _>("fencing_token")? as u64,
        acquired_at: row.try_get("acquired_at")?,
        expires_at: row.try_get("expires_at")?,
        status: status.parse::<LeaseStatus>().map_err(decode_err)?,
    })
}

fn row_to_heartbeat(row: &PgRow) -> std::result::Result<Heartbeat, sqlx::Error> {
    Ok(Heartbeat {
        runner_id: RunnerId(row.try_get("runner_id")?),
        last_seen_at: row.try_get("last_seen_at")?,
        status_note: row.try_get("status_note")?,
    })
}

fn row_to_record(row: &PgRow) -> std::result::Result<ExecutionRecord, sqlx::Error> {
    let outcome: String = row.try_get("outcome")?;
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        job_id: JobId(row.try_get("job_id")?),
        runner_id: RunnerId(row.try_get("runner_id")?),
        fencing_token: row.try_get::<i64, _>("fencing_token")? as u64,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        outcome: outcome.parse::<Outcome>().map_err(decode_err)?,
        detail: row.try_get("detail")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_are_clamped_to_a_century() {
        assert_eq!(interval_secs(Duration::from_millis(1500)), 1.5);
        assert_eq!(interval_secs(Duration::from_secs(u64::MAX)), MAX_INTERVAL_SECS);
        assert_eq!(interval_secs(Duration::MAX), MAX_INTERVAL_SECS);
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let err = "stolen".parse::<LeaseStatus>().map_err(decode_err).unwrap_err();
        assert!(matches!(err, sqlx::Error::Decode(_)));
        assert!(err.to_string().contains("stolen"));
    }
}
