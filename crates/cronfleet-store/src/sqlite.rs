use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronfleet_core::{Clock, JobId, RunnerId, SystemClock};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::Result;
use crate::store::{expiry_from, stale_cutoff, LockStore};
use crate::types::{AcquireOutcome, ExecutionRecord, Heartbeat, Lease, NewExecutionRecord};

const LEASE_COLUMNS: &str =
    "job_id, holder_id, fencing_token, acquired_at, expires_at, status";
const RECORD_COLUMNS: &str =
    "id, job_id, runner_id, fencing_token, started_at, finished_at, outcome, detail";

/// Lock store backed by a SQLite database file shared by runners on one host.
///
/// Expiry is judged by the clock of whichever process performs the write, so
/// this backend is only safe when every runner reads the same wall clock.
/// The file must sit on local disk: WAL mode relies on shared memory that
/// network filesystems do not provide. Use [`crate::PgLockStore`] for a fleet
/// spread over several hosts.
///
/// Each instance owns one connection; several runners (or several instances
/// in one test) opening the same file coordinate through SQLite's own write
/// lock. Acquisition runs inside a `BEGIN IMMEDIATE` transaction so the
/// conditional upsert and the read-back see the same snapshot.
#[derive(Clone)]
pub struct SqliteLockStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteLockStore {
    /// Open (or create) the database at `path` and run the schema migration.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self> {
        Self::open_with_clock(path, busy_timeout, Arc::new(SystemClock))
    }

    /// Like [`SqliteLockStore::open`] but with an explicit lease clock.
    pub fn open_with_clock(
        path: &str,
        busy_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn, clock)
    }

    /// Wrap an open connection, initialising the schema if needed.
    pub fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    /// Run `f` on the blocking pool with exclusive access to the connection.
    ///
    /// `now` is read from the store clock immediately before `f` runs.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, DateTime<Utc>) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let clock = Arc::clone(&self.clock);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            let now = clock.now();
            f(&mut guard, now)
        })
        .await?
    }
}

impl std::fmt::Debug for SqliteLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLockStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[instrument(skip_all, fields(job_id = %job_id, holder = %holder))]
    async fn try_acquire(
        &self,
        job_id: &JobId,
        holder: &RunnerId,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        let job_id = job_id.clone();
        let holder = holder.clone();
        self.call(move |conn, now| {
            let expires = expiry_from(now, ttl);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // The WHERE on DO UPDATE is the whole exclusion rule: overwrite only
            // a released row or one whose lease has run out.
            let changed = tx.execute(
                "INSERT INTO leases
                 (job_id, holder_id, fencing_token, acquired_at, expires_at, status)
                 VALUES (?1, ?2, 1, ?3, ?4, 'held')
                 ON CONFLICT(job_id) DO UPDATE SET
                    holder_id     = excluded.holder_id,
                    fencing_token = leases.fencing_token + 1,
                    acquired_at   = excluded.acquired_at,
                    expires_at    = excluded.expires_at,
                    status        = 'held'
                 WHERE leases.status = 'free' OR leases.expires_at <= excluded.acquired_at",
                params![
                    job_id.as_str(),
                    holder.as_str(),
                    now.timestamp_millis(),
                    expires.timestamp_millis()
                ],
            )?;

            let lease = tx.query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE job_id = ?1"),
                params![job_id.as_str()],
                row_to_lease,
            )?;
            tx.commit()?;

            if changed == 1 {
                info!(token = lease.fencing_token, expires_at = %lease.expires_at, "lease acquired");
                Ok(AcquireOutcome::Acquired(lease))
            } else {
                debug!(current = %lease.holder_id, "lease busy");
                Ok(AcquireOutcome::Busy {
                    holder_id: lease.holder_id,
                    expires_at: lease.expires_at,
                })
            }
        })
        .await
    }

    #[instrument(skip_all, fields(job_id = %lease.job_id, token = lease.fencing_token))]
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        let lease = lease.clone();
        self.call(move |conn, now| {
            let target = expiry_from(now, ttl);
            // MAX keeps expires_at strictly increasing even if the clock stalls.
            let changed = conn.execute(
                "UPDATE leases SET expires_at = MAX(?1, expires_at + 1)
                 WHERE job_id = ?2 AND holder_id = ?3 AND fencing_token = ?4
                   AND status = 'held' AND expires_at > ?5",
                params![
                    target.timestamp_millis(),
                    lease.job_id.as_str(),
                    lease.holder_id.as_str(),
                    lease.fencing_token as i64,
                    now.timestamp_millis()
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let renewed = conn.query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE job_id = ?1"),
                params![lease.job_id.as_str()],
                row_to_lease,
            )?;
            Ok(Some(renewed))
        })
        .await
    }

    async fn mark_releasing(&self, lease: &Lease) -> Result<bool> {
        let lease = lease.clone();
        self.call(move |conn, _now| {
            let changed = conn.execute(
                "UPDATE leases SET status = 'releasing'
                 WHERE job_id = ?1 AND holder_id = ?2 AND fencing_token = ?3
                   AND status = 'held'",
                params![
                    lease.job_id.as_str(),
                    lease.holder_id.as_str(),
                    lease.fencing_token as i64
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    #[instrument(skip_all, fields(job_id = %lease.job_id, token = lease.fencing_token))]
    async fn release(&self, lease: &Lease) -> Result<bool> {
        let lease = lease.clone();
        self.call(move |conn, _now| {
            let changed = conn.execute(
                "UPDATE leases SET status = 'free'
                 WHERE job_id = ?1 AND holder_id = ?2 AND fencing_token = ?3
                   AND status IN ('held', 'releasing')",
                params![
                    lease.job_id.as_str(),
                    lease.holder_id.as_str(),
                    lease.fencing_token as i64
                ],
            )?;
            if changed == 1 {
                info!("lease released");
            }
            Ok(changed == 1)
        })
        .await
    }

    async fn get_lease(&self, job_id: &JobId) -> Result<Option<Lease>> {
        let job_id = job_id.clone();
        self.call(move |conn, _now| {
            let lease = conn
                .query_row(
                    &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE job_id = ?1"),
                    params![job_id.as_str()],
                    row_to_lease,
                )
                .optional()?;
            Ok(lease)
        })
        .await
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        self.call(|conn, _now| {
            let mut stmt =
                conn.prepare(&format!("SELECT {LEASE_COLUMNS} FROM leases ORDER BY job_id"))?;
            let leases = stmt
                .query_map([], row_to_lease)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(leases)
        })
        .await
    }

    async fn validate_fence(&self, job_id: &JobId, token: u64) -> Result<bool> {
        let job_id = job_id.clone();
        self.call(move |conn, now| {
            let current = conn
                .query_row(
                    "SELECT 1 FROM leases
                     WHERE job_id = ?1 AND fencing_token = ?2
                       AND status != 'free' AND expires_at > ?3",
                    params![job_id.as_str(), token as i64, now.timestamp_millis()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(current.is_some())
        })
        .await
    }

    async fn upsert_heartbeat(
        &self,
        runner_id: &RunnerId,
        status_note: &str,
    ) -> Result<Heartbeat> {
        let runner_id = runner_id.clone();
        let note = status_note.to_string();
        self.call(move |conn, now| {
            conn.execute(
                "INSERT INTO heartbeats (runner_id, last_seen_at, status_note)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(runner_id) DO UPDATE SET
                    last_seen_at = excluded.last_seen_at,
                    status_note  = excluded.status_note",
                params![runner_id.as_str(), now.timestamp_millis(), note],
            )?;
            Ok(Heartbeat {
                runner_id,
                last_seen_at: ms_to_dt(now.timestamp_millis()),
                status_note: note,
            })
        })
        .await
    }

    async fn list_heartbeats(&self) -> Result<Vec<Heartbeat>> {
        self.call(|conn, _now| {
            let mut stmt = conn.prepare(
                "SELECT runner_id, last_seen_at, status_note
                 FROM heartbeats ORDER BY runner_id",
            )?;
            let rows = stmt
                .query_map([], row_to_heartbeat)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_stale_heartbeats(&self, threshold: Duration) -> Result<Vec<Heartbeat>> {
        self.call(move |conn, now| {
            let cutoff = stale_cutoff(now, threshold).timestamp_millis();
            let mut stmt = conn.prepare(
                "SELECT runner_id, last_seen_at, status_note
                 FROM heartbeats WHERE last_seen_at < ?1
                 ORDER BY last_seen_at",
            )?;
            let rows = stmt
                .query_map(params![cutoff], row_to_heartbeat)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    #[instrument(skip_all, fields(job_id = %record.job_id, outcome = %record.outcome))]
    async fn append_execution(&self, record: NewExecutionRecord) -> Result<ExecutionRecord> {
        self.call(move |conn, _now| {
            conn.execute(
                "INSERT INTO execution_records
                 (job_id, runner_id, fencing_token, started_at, finished_at, outcome, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.job_id.as_str(),
                    record.runner_id.as_str(),
                    record.fencing_token as i64,
                    record.started_at.timestamp_millis(),
                    record.finished_at.timestamp_millis(),
                    record.outcome.to_string(),
                    record.detail
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(ExecutionRecord::from_new(id, record))
        })
        .await
    }

    async fn list_recent_execution_records(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let job_id = job_id.clone();
        self.call(move |conn, _now| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM execution_records
                 WHERE job_id = ?1
                 ORDER BY finished_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![job_id.as_str(), limit as i64], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

/// Map a SQLite row to a `Lease`. Column order follows `LEASE_COLUMNS`.
fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    let status: String = row.get(5)?;
    Ok(Lease {
        job_id: JobId(row.get(0)?),
        holder_id: RunnerId(row.get(1)?),
        fencing_token: row.get::<_, i64>(2)? as u64,
        acquired_at: ms_to_dt(row.get(3)?),
        expires_at: ms_to_dt(row.get(4)?),
        status: status.parse().map_err(|e| conversion_err(5, e))?,
    })
}

fn row_to_heartbeat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Heartbeat> {
    Ok(Heartbeat {
        runner_id: RunnerId(row.get(0)?),
        last_seen_at: ms_to_dt(row.get(1)?),
        status_note: row.get(2)?,
    })
}

/// Column order follows `RECORD_COLUMNS`.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let outcome: String = row.get(6)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        job_id: JobId(row.get(1)?),
        runner_id: RunnerId(row.get(2)?),
        fencing_token: row.get::<_, i64>(3)? as u64,
        started_at: ms_to_dt(row.get(4)?),
        finished_at: ms_to_dt(row.get(5)?),
        outcome: outcome.parse().map_err(|e| conversion_err(6, e))?,
        detail: row.get(7)?,
    })
}
