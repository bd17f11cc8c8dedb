use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use a6hub_core::job_type::JobType;
use a6hub_pipeline::plan::CommandSpec;
use a6hub_pipeline::{DriverConfig, ToolPaths};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded on claimed queue entries and job rows.
    pub worker_id: String,
    /// Jobs run at the same time (default: `1`).
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Queues this worker claims from (default: both).
    pub queues: Vec<JobType>,
    pub workspace_root: PathBuf,
    /// Where artifacts are copied. `None` discards them.
    pub artifacts_dir: Option<PathBuf>,
    pub max_job_duration: Duration,
    /// Slack the dispatcher adds on top of `max_job_duration` before it
    /// gives up on a driver.
    pub dispatch_grace: Duration,
    pub tools: ToolPaths,
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// How long a claim may sit on a still-PENDING job before redelivery.
    pub claim_visibility: Duration,
    pub max_delivery_attempts: i32,
    /// Added to `max_job_duration` to decide a RUNNING job's worker is gone.
    pub stale_grace: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                     |
    /// |--------------------------|-----------------------------|
    /// | `WORKER_ID`              | `worker-<pid>`              |
    /// | `WORKER_CONCURRENCY`     | `1`                         |
    /// | `WORKER_QUEUES`          | `build,simulation`          |
    /// | `POLL_INTERVAL_MS`       | `1000`                      |
    /// | `WORKSPACE_ROOT`         | `./workspaces`              |
    /// | `ARTIFACTS_DIR`          | unset (artifacts discarded) |
    /// | `MAX_JOB_DURATION_SECS`  | `3600`                      |
    /// | `DISPATCH_GRACE_SECS`    | `60`                        |
    /// | `LIBRELANE_BIN`          | `librelane`                 |
    /// | `LIBRELANE_DOCKER_IMAGE` | unset (per-job image)       |
    /// | `DOCKER_BIN`             | `docker`                    |
    /// | `IVERILOG_BIN`           | `iverilog`                  |
    /// | `VVP_BIN`                | `vvp`                       |
    /// | `VERILATOR_BIN`          | `verilator`                 |
    /// | `REAPER_INTERVAL_SECS`   | `60`                        |
    /// | `CLAIM_VISIBILITY_SECS`  | `300`                       |
    /// | `MAX_DELIVERY_ATTEMPTS`  | `3`                         |
    /// | `STALE_GRACE_SECS`       | `300`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let concurrency: usize = parse(&var, "WORKER_CONCURRENCY", 1)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                reason: "must be at least 1".into(),
            });
        }

        let queues = match var("WORKER_QUEUES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<JobType>().map_err(|e| ConfigError::Invalid {
                        key: "WORKER_QUEUES",
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![JobType::Build, JobType::Simulation],
        };

        let defaults = ToolPaths::default();
        let tool = |key: &str, default: CommandSpec| var(key).map(|v| command(&v)).unwrap_or(default);
        let tools = ToolPaths {
            librelane: tool("LIBRELANE_BIN", defaults.librelane.clone()),
            docker: tool("DOCKER_BIN", defaults.docker.clone()),
            librelane_image: var("LIBRELANE_DOCKER_IMAGE"),
            iverilog: tool("IVERILOG_BIN", defaults.iverilog.clone()),
            vvp: tool("VVP_BIN", defaults.vvp.clone()),
            verilator: tool("VERILATOR_BIN", defaults.verilator.clone()),
        };

        Ok(Self {
            worker_id: var("WORKER_ID").unwrap_or_else(|| format!("worker-{}", std::process::id())),
            concurrency,
            poll_interval: Duration::from_millis(parse(&var, "POLL_INTERVAL_MS", 1000)?),
            queues,
            workspace_root: var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./workspaces")),
            artifacts_dir: var("ARTIFACTS_DIR").map(PathBuf::from),
            max_job_duration: secs(&var, "MAX_JOB_DURATION_SECS", 3600)?,
            dispatch_grace: secs(&var, "DISPATCH_GRACE_SECS", 60)?,
            tools,
            reaper: ReaperConfig {
                interval: secs(&var, "REAPER_INTERVAL_SECS", 60)?,
                claim_visibility: secs(&var, "CLAIM_VISIBILITY_SECS", 300)?,
                max_delivery_attempts: parse(&var, "MAX_DELIVERY_ATTEMPTS", 3)?,
                stale_grace: secs(&var, "STALE_GRACE_SECS", 300)?,
            },
        })
    }

    pub fn driver_config(&self) -> DriverConfig {
        let mut config = DriverConfig::new(&self.workspace_root);
        config.max_job_duration = self.max_job_duration;
        config.tools = self.tools.clone();
        config
    }

    /// Outer limit the dispatcher puts around one driver run.
    pub fn dispatch_limit(&self) -> Duration {
        self.max_job_duration + self.dispatch_grace
    }

    /// Age after which a RUNNING job with no writes is considered orphaned.
    pub fn stale_after(&self) -> Duration {
        self.max_job_duration + self.reaper.stale_grace
    }
}

/// `"python3 -m librelane"` -> program `python3`, args `["-m", "librelane"]`.
fn command(raw: &str) -> CommandSpec {
    let mut parts = raw.split_whitespace();
    let program = parts.next().unwrap_or_default();
    CommandSpec::with_args(program, parts)
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse(var, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.queues, vec![JobType::Build, JobType::Simulation]);
        assert_eq!(config.max_job_duration, Duration::from_secs(3600));
        assert_eq!(config.dispatch_limit(), Duration::from_secs(3660));
        assert_eq!(config.stale_after(), Duration::from_secs(3900));
        assert_eq!(config.reaper.max_delivery_attempts, 3);
        assert!(config.artifacts_dir.is_none());
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn tool_commands_split_on_whitespace() {
        let config = load(&[
            ("LIBRELANE_BIN", "python3 -m librelane"),
            ("LIBRELANE_DOCKER_IMAGE", "registry.local/librelane:2.4"),
        ])
        .unwrap();
        assert_eq!(config.tools.librelane.program, "python3");
        assert_eq!(config.tools.librelane.args, vec!["-m", "librelane"]);
        assert_eq!(
            config.tools.librelane_image.as_deref(),
            Some("registry.local/librelane:2.4")
        );
        assert_eq!(config.driver_config().tools.librelane.program, "python3");
    }

    #[test]
    fn queue_list_is_parsed() {
        let config = load(&[("WORKER_QUEUES", "simulation")]).unwrap();
        assert_eq!(config.queues, vec![JobType::Simulation]);

        let err = load(&[("WORKER_QUEUES", "build,render")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { key: "WORKER_QUEUES", .. });
    }

    #[test]
    fn bad_numbers_are_rejected() {
        assert_matches!(
            load(&[("WORKER_CONCURRENCY", "many")]),
            Err(ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. })
        );
        assert_matches!(
            load(&[("WORKER_CONCURRENCY", "0")]),
            Err(ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. })
        );
        assert_matches!(
            load(&[("MAX_JOB_DURATION_SECS", "-5")]),
            Err(ConfigError::Invalid { key: "MAX_JOB_DURATION_SECS", .. })
        );
    }
}
