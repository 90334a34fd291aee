//! `cronfleet-store`: the shared lock store.
//!
//! # Overview
//!
//! Three tables live in the shared database and are the only thing runners
//! ever synchronise through:
//!
//! | Table               | Key       | Written by                          |
//! |---------------------|-----------|-------------------------------------|
//! | `leases`            | `job_id`  | conditional writes from any runner  |
//! | `heartbeats`        | `runner_id` | idempotent upsert, one row per runner |
//! | `execution_records` | `id`      | append-only, after each execution   |
//!
//! Mutual exclusion rests on one primitive: a single conditional write per
//! acquisition, renewal or release, evaluated inside the store.
//! Every successful acquisition bumps the job's fencing token, so a holder
//! that lost its lease can always be told apart from the current one.
//!
//! [`PgLockStore`] is the backend for a fleet spread over several hosts: every
//! expiry check runs against the database server's `now()`, so runner clock
//! skew cannot hand one lease to two runners. [`SqliteLockStore`] is for a
//! fleet on a single host (one wall clock, database on local disk; WAL mode
//! does not work over a network filesystem). [`MemoryLockStore`] keeps the same
//! semantics in-process for simulations and tests.

pub mod db;
pub mod error;
pub mod health;
pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use health::{FleetSnapshot, HealthReader, LeaseView};
pub use memory::MemoryLockStore;
pub use postgres::PgLockStore;
pub use sqlite::SqliteLockStore;
pub use store::LockStore;
pub use types::{
    AcquireOutcome, ExecutionRecord, Heartbeat, Lease, LeaseStatus, NewExecutionRecord, Outcome,
};
