//! Job update events: the JSON wire schema shared by the worker (producer)
//! and the API fan-out (relay).
//!
//! ```json
//! {"job_id": 7, "type": "log", "log_line": "...", "timestamp": "2026-03-01T12:00:00Z"}
//! ```

use serde::{Deserialize, Serialize};

use crate::job_status::JobStatus;
use crate::progress::ProgressData;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// JobUpdate
// ---------------------------------------------------------------------------

/// One transient update about a job. Never persisted beyond the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: DbId,

    #[serde(flatten)]
    pub kind: UpdateKind,

    pub timestamp: Timestamp,
}

/// Type-specific payload, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateKind {
    Status {
        status: JobStatus,
    },
    Log {
        log_line: String,
    },
    Progress {
        progress: i16,
        current_step: Option<String>,
        completed_steps: Vec<String>,
    },
    Step {
        step_name: String,
        step_label: String,
    },
    Complete {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        error_message: String,
    },
    /// Snapshot sent by the API to each new subscriber before any relayed
    /// event.
    Connected {
        status: JobStatus,
        current_step: Option<String>,
        progress: i16,
        completed_steps: Vec<String>,
    },
}

impl UpdateKind {
    /// Wire value of the `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            UpdateKind::Status { .. } => "status",
            UpdateKind::Log { .. } => "log",
            UpdateKind::Progress { .. } => "progress",
            UpdateKind::Step { .. } => "step",
            UpdateKind::Complete { .. } => "complete",
            UpdateKind::Error { .. } => "error",
            UpdateKind::Connected { .. } => "connected",
        }
    }

    /// The free-form text of the event, if it carries any: a log line, an
    /// error message or the completion message.
    pub fn text_mut(&mut self) -> Option<&mut String> {
        match self {
            UpdateKind::Log { log_line } => Some(log_line),
            UpdateKind::Error { error_message } => Some(error_message),
            UpdateKind::Complete { message, .. } => message.as_mut(),
            _ => None,
        }
    }
}

impl JobUpdate {
    pub fn new(job_id: DbId, kind: UpdateKind) -> Self {
        Self {
            job_id,
            kind,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn status(job_id: DbId, status: JobStatus) -> Self {
        Self::new(job_id, UpdateKind::Status { status })
    }

    pub fn log(job_id: DbId, log_line: impl Into<String>) -> Self {
        Self::new(
            job_id,
            UpdateKind::Log {
                log_line: log_line.into(),
            },
        )
    }

    pub fn progress(job_id: DbId, data: &ProgressData) -> Self {
        Self::new(
            job_id,
            UpdateKind::Progress {
                progress: data.progress_percent,
                current_step: data.current_step.clone(),
                completed_steps: data.completed_steps.clone(),
            },
        )
    }

    pub fn step(job_id: DbId, step_name: &str, step_label: &str) -> Self {
        Self::new(
            job_id,
            UpdateKind::Step {
                step_name: step_name.to_string(),
                step_label: step_label.to_string(),
            },
        )
    }

    pub fn complete(job_id: DbId, status: JobStatus, message: Option<String>) -> Self {
        Self::new(job_id, UpdateKind::Complete { status, message })
    }

    pub fn error(job_id: DbId, error_message: impl Into<String>) -> Self {
        Self::new(
            job_id,
            UpdateKind::Error {
                error_message: error_message.into(),
            },
        )
    }

    /// Snapshot of the persisted job state for a newly connected subscriber.
    pub fn connected(job_id: DbId, status: JobStatus, data: &ProgressData) -> Self {
        Self::new(
            job_id,
            UpdateKind::Connected {
                status,
                current_step: data.current_step.clone(),
                progress: data.progress_percent,
                completed_steps: data.completed_steps.clone(),
            },
        )
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
