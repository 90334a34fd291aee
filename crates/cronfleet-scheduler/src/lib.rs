//! `cronfleet-scheduler`: runs periodic jobs on whichever runner wins the lease.
//!
//! # Overview
//!
//! Each runner process hosts three independent tasks that only talk to each
//! other through the shared store:
//!
//! - [`engine::SchedulerEngine`] wakes on a fixed tick, asks the
//!   [`schedule::CronSchedule`] of every job whether a slot is due, races for
//!   the lease through [`lock::LockManager`] and hands winners to the
//!   [`executor::JobExecutor`].
//! - [`heartbeat::HeartbeatReporter`] upserts a liveness row on its own timer,
//!   so a stuck job never silences it.
//! - One executor task per running job, renewing its lease while the body runs.
//!
//! Execution is at-least-once/at-most-once *usually*. Cancellation is
//! cooperative: a body that lost its lease is told to stop and then dropped
//! at its next await point, but side effects it already issued (HTTP calls,
//! child processes it detached) are not undone.

pub mod command;
pub mod engine;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod in_flight;
pub mod lock;
pub mod registry;
pub mod schedule;

pub use command::CommandJob;
pub use engine::{EngineSettings, SchedulerEngine, SkipReason, TickDecision};
pub use error::{LockError, Result, SchedulerError};
pub use executor::{ExecutionReport, JobBody, JobContext, JobExecutor};
pub use heartbeat::HeartbeatReporter;
pub use in_flight::InFlight;
pub use lock::LockManager;
pub use registry::JobRegistry;
pub use schedule::CronSchedule;
