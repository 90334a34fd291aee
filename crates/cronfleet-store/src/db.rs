use rusqlite::Connection;

use crate::error::Result;

/// Initialise the coordination schema in `conn`.
///
/// Safe to call on every startup from every runner; uses `IF NOT EXISTS`
/// throughout. Timestamps are stored as Unix milliseconds so that expiry
/// comparisons happen inside the conditional write itself.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS leases (
            job_id         TEXT    NOT NULL PRIMARY KEY,
            holder_id      TEXT    NOT NULL,
            fencing_token  INTEGER NOT NULL,
            acquired_at    INTEGER NOT NULL,   -- unix ms
            expires_at     INTEGER NOT NULL,   -- unix ms
            status         TEXT    NOT NULL DEFAULT 'held'
                           CHECK (status IN ('free', 'held', 'releasing'))
        ) STRICT;

        CREATE TABLE IF NOT EXISTS heartbeats (
            runner_id      TEXT    NOT NULL PRIMARY KEY,
            last_seen_at   INTEGER NOT NULL,   -- unix ms
            status_note    TEXT    NOT NULL DEFAULT ''
        ) STRICT;

        CREATE TABLE IF NOT EXISTS execution_records (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id         TEXT    NOT NULL,
            runner_id      TEXT    NOT NULL,
            fencing_token  INTEGER NOT NULL,
            started_at     INTEGER NOT NULL,
            finished_at    INTEGER NOT NULL,
            outcome        TEXT    NOT NULL
                           CHECK (outcome IN ('success', 'failure', 'timeout')),
            detail         TEXT
        );

        -- list_recent_execution_records: WHERE job_id = ? ORDER BY finished_at DESC
        CREATE INDEX IF NOT EXISTS idx_exec_job_finished
            ON execution_records (job_id, finished_at DESC);
        -- list_stale_heartbeats: WHERE last_seen_at < ?
        CREATE INDEX IF NOT EXISTS idx_heartbeats_seen
            ON heartbeats (last_seen_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('leases', 'heartbeats', 'execution_records')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn rejects_unknown_lease_status() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO leases VALUES ('card_sync', 'pi', 1, 0, 1000, 'stolen')",
            [],
        );
        assert!(res.is_err());
    }
}
