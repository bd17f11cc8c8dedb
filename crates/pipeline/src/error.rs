//! Failure kinds of a build job. Every kind ends the job in FAILED with
//! its `Display` text as `error_message`; none is retried.

use std::time::Duration;

use a6hub_core::error::CoreError;
use a6hub_db::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Missing or unusable project sources.
    #[error("Input error: {0}")]
    Input(String),

    /// Job config could not be parsed or validated.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tool exited unsuccessfully. `tail` holds its last output lines.
    #[error("{}", tool_failure_message(.program, .exit_code, .tail))]
    ToolFailure {
        program: String,
        exit_code: Option<i32>,
        tail: Vec<String>,
    },

    #[error("Job exceeded time limit of {}s", .limit.as_secs())]
    Timeout { limit: Duration },

    /// Workspace I/O, store or uploader failure.
    #[error("Infrastructure error: {0}")]
    Infra(String),
}

fn tool_failure_message(program: &str, exit_code: &Option<i32>, tail: &[String]) -> String {
    let code = match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_string(),
    };
    if tail.is_empty() {
        format!("{program} failed with {code}")
    } else {
        format!(
            "{program} failed with {code}. Last output:\n{}",
            tail.join("\n")
        )
    }
}

impl From<StoreError> for BuildError {
    fn from(e: StoreError) -> Self {
        BuildError::Infra(e.to_string())
    }
}

impl From<std::io::Error> for BuildError {
    fn from(e: std::io::Error) -> Self {
        BuildError::Infra(e.to_string())
    }
}

impl From<CoreError> for BuildError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(msg) => BuildError::Config(msg),
            other => BuildError::Infra(other.to_string()),
        }
    }
}
