//! `cronfleet-core`: shared configuration, identities and time source for the
//! cronfleet runners.
//!
//! Every other crate in the workspace depends on this one; it has no knowledge
//! of the database or of the scheduler loop.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FleetConfig;
pub use error::{FleetError, Result};
pub use types::{JobDefinition, JobId, RunnerId, RunnerIdentity};
