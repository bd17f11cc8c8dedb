//! Kinds of job the pipeline runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::stages::{StageDescriptor, BUILD_STAGES, SIMULATION_STAGES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Build,
    Simulation,
}

impl JobType {
    /// Value stored in `jobs.job_type` and `job_queue.queue`.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Build => "build",
            JobType::Simulation => "simulation",
        }
    }

    /// Stage table output lines of this job type are classified against.
    pub fn stage_table(self) -> &'static [StageDescriptor] {
        match self {
            JobType::Build => BUILD_STAGES,
            JobType::Simulation => SIMULATION_STAGES,
        }
    }
}

impl FromStr for JobType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(JobType::Build),
            "simulation" => Ok(JobType::Simulation),
            other => Err(CoreError::Validation(format!("unknown job type '{other}'"))),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
