use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job definition ({job_id}): {reason}")]
    InvalidJob { job_id: String, reason: String },
}

impl FleetError {
    /// Short error code used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "CONFIG_ERROR",
            FleetError::InvalidJob { .. } => "INVALID_JOB",
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
