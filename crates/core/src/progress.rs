//! Persisted progress snapshot stored in `jobs.progress_data`.

use serde::{Deserialize, Serialize};

use crate::stages::{StageDescriptor, StageTracker};

/// Owned copy of a [`StageDescriptor`] as stored in the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub name: String,
    pub label: String,
    pub description: String,
}

impl From<&StageDescriptor> for StepInfo {
    fn from(stage: &StageDescriptor) -> Self {
        Self {
            name: stage.name.to_string(),
            label: stage.label.to_string(),
            description: stage.description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressData {
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub progress_percent: i16,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub steps_info: Vec<StepInfo>,
}

impl ProgressData {
    /// Snapshot of a tracker, including the full table it classifies against.
    pub fn from_tracker(tracker: &StageTracker) -> Self {
        Self {
            current_step: tracker.current().map(|s| s.name.to_string()),
            progress_percent: tracker.progress_percent(),
            completed_steps: tracker.completed_steps().to_vec(),
            steps_info: tracker.table().iter().map(StepInfo::from).collect(),
        }
    }

    /// Parse the JSON column; a missing or malformed value reads as empty.
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
