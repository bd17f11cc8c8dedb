//! Job status state machine.
//!
//! Discriminants match the seed data order (1-based) of the `job_statuses`
//! lookup table in `20260301000001_create_jobs.sql`.
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    │           ├──────► Failed
//!    │           └──────► Cancelled
//!    ├──────────────────► Cancelled
//!    └──────────────────► Failed
//! ```
//!
//! Nothing leaves a terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant in discriminant order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Lowercase name used on the wire and in the lookup table.
            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

define_status_enum! {
    /// Build/simulation job execution status.
    JobStatus {
        Pending = 1 => "pending",
        Running = 2 => "running",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
        Cancelled = 5 => "cancelled",
    }
}

/// Statuses a job can still be cancelled or failed from.
pub const ACTIVE_STATUSES: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

/// Statuses no edge leaves.
pub const TERMINAL_STATUSES: [JobStatus; 3] =
    [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        TERMINAL_STATUSES.contains(&self)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Running -> Running` is allowed so a redelivered job can be re-claimed
    /// by the worker that now owns it.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Checked transition used by the in-memory store and callers that want
    /// a typed error instead of a silent no-op.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
