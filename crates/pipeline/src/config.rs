//! Driver tuning and tool locations.

use std::path::PathBuf;
use std::time::Duration;

use crate::plan::CommandSpec;

/// Lines buffered before the sink appends them to the job log.
pub const DEFAULT_LOG_FLUSH_LINES: usize = 10;

/// Longest a buffered line waits before being flushed.
pub const DEFAULT_LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// How often a running job re-reads its persisted status for cancellation.
pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Wall-clock limit for a whole job.
pub const DEFAULT_MAX_JOB_DURATION: Duration = Duration::from_secs(3600);

/// Output lines kept for a tool failure message.
pub const FAILURE_TAIL_LINES: usize = 50;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Parent of the per-job `job_<id>` scratch directories.
    pub workspace_root: PathBuf,
    pub max_job_duration: Duration,
    pub cancel_poll_interval: Duration,
    pub log_flush_lines: usize,
    pub log_flush_interval: Duration,
    pub tools: ToolPaths,
}

impl DriverConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_job_duration: DEFAULT_MAX_JOB_DURATION,
            cancel_poll_interval: DEFAULT_CANCEL_POLL_INTERVAL,
            log_flush_lines: DEFAULT_LOG_FLUSH_LINES,
            log_flush_interval: DEFAULT_LOG_FLUSH_INTERVAL,
            tools: ToolPaths::default(),
        }
    }
}

/// Commands used to launch each external tool. Plan-specific arguments
/// are appended to these.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    /// Native LibreLane entry point, used when a job sets `use_docker: false`.
    pub librelane: CommandSpec,
    pub docker: CommandSpec,
    /// Deployment-wide image pin; overrides the job's `docker_image`.
    pub librelane_image: Option<String>,
    pub iverilog: CommandSpec,
    pub vvp: CommandSpec,
    pub verilator: CommandSpec,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            librelane: CommandSpec::new("librelane"),
            docker: CommandSpec::new("docker"),
            librelane_image: None,
            iverilog: CommandSpec::new("iverilog"),
            vvp: CommandSpec::new("vvp"),
            verilator: CommandSpec::new("verilator"),
        }
    }
}
