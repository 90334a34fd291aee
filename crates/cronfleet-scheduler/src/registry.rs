use std::collections::HashMap;
use std::sync::Arc;

use cronfleet_core::{JobDefinition, JobId};

use crate::command::CommandJob;
use crate::error::{Result, SchedulerError};
use crate::executor::JobBody;

/// Maps job ids to their bodies.
///
/// In-process bodies registered here win; otherwise a job with a configured
/// `command` runs it through [`CommandJob`].
#[derive(Default, Clone)]
pub struct JobRegistry {
    bodies: HashMap<JobId, Arc<dyn JobBody>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_id: impl Into<JobId>, body: Arc<dyn JobBody>) -> &mut Self {
        self.bodies.insert(job_id.into(), body);
        self
    }

    pub fn resolve(&self, def: &JobDefinition) -> Result<Arc<dyn JobBody>> {
        if let Some(body) = self.bodies.get(&def.job_id) {
            return Ok(Arc::clone(body));
        }
        match &def.command {
            Some(cmd) => Ok(Arc::new(CommandJob::new(cmd.as_str()))),
            None => Err(SchedulerError::UnknownJob(format!(
                "{}: no registered body and no command",
                def.job_id
            ))),
        }
    }
}
