//! Best-effort publishing of job updates from the worker.
//!
//! Bus failures never fail a job: they are logged at `warn` and dropped.
//! Durable state lives in the job row, and subscribers resynchronise from
//! the `connected` snapshot. Every update is cut to [`MAX_PAYLOAD_BYTES`]
//! before it is sent, whichever bus carries it.

use std::sync::Arc;

use a6hub_core::job_events::JobUpdate;
use a6hub_core::job_status::JobStatus;
use a6hub_core::progress::ProgressData;
use a6hub_core::stages::StageDescriptor;
use a6hub_core::types::DbId;

use crate::bus::UpdateBus;
use crate::payload::{shrink_to_fit, MAX_PAYLOAD_BYTES};

#[derive(Clone)]
pub struct ProgressPublisher {
    bus: Arc<dyn UpdateBus>,
}

impl ProgressPublisher {
    pub fn new(bus: Arc<dyn UpdateBus>) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, mut update: JobUpdate) {
        match shrink_to_fit(&mut update, MAX_PAYLOAD_BYTES) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    job_id = update.job_id,
                    kind = update.type_name(),
                    "Job update too large to publish, dropped"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = update.job_id, error = %e, "Failed to encode job update");
                return;
            }
        }
        if let Err(e) = self.bus.publish(&update).await {
            tracing::warn!(
                job_id = update.job_id,
                kind = update.type_name(),
                error = %e,
                "Failed to publish job update"
            );
        }
    }

    pub async fn status(&self, job_id: DbId, status: JobStatus) {
        self.publish(JobUpdate::status(job_id, status)).await;
    }

    pub async fn log(&self, job_id: DbId, line: &str) {
        self.publish(JobUpdate::log(job_id, line)).await;
    }

    pub async fn progress(&self, job_id: DbId, data: &ProgressData) {
        self.publish(JobUpdate::progress(job_id, data)).await;
    }

    pub async fn step(&self, job_id: DbId, stage: &StageDescriptor) {
        self.publish(JobUpdate::step(job_id, stage.name, stage.label))
            .await;
    }

    pub async fn complete(&self, job_id: DbId, status: JobStatus, message: Option<String>) {
        self.publish(JobUpdate::complete(job_id, status, message))
            .await;
    }

    pub async fn error(&self, job_id: DbId, message: &str) {
        self.publish(JobUpdate::error(job_id, message))
            .await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
