//! Runs one claimed job from RUNNING to a terminal state.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use a6hub_core::build_settings::{BuildSettings, SimulationSettings};
use a6hub_core::hdl_files::resolve_sources;
use a6hub_core::job_status::JobStatus;
use a6hub_core::job_type::JobType;
use a6hub_core::progress::ProgressData;
use a6hub_core::stages::{StageTracker, StageTransition};
use a6hub_core::types::DbId;
use a6hub_db::models::job::Job;
use a6hub_db::store::JobStore;
use a6hub_events::ProgressPublisher;
use tokio::time::{Instant, MissedTickBehavior};

use crate::collaborators::{artifacts_path, ArtifactUploader, FileSource};
use crate::config::{DriverConfig, FAILURE_TAIL_LINES};
use crate::error::BuildError;
use crate::plan::{build_plan, simulation_plan, PlanStep, LIBRELANE_CONFIG_FILE};
use crate::runner::{self, RunningTool};
use crate::sink::PersistenceSink;
use crate::workspace::JobWorkspace;

/// Time allowed for a step's cleanup command after a kill.
const CLEANUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// How a [`BuildDriver::drive`] call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    /// The job is FAILED with this `error_message`.
    Failed(String),
    Cancelled,
    /// The job was already terminal; nothing ran.
    Skipped,
    /// The job could not be started because the store was unavailable. It
    /// is left untouched for redelivery.
    Deferred(String),
}

pub struct BuildDriver {
    store: Arc<dyn JobStore>,
    files: Arc<dyn FileSource>,
    uploader: Arc<dyn ArtifactUploader>,
    publisher: ProgressPublisher,
    config: DriverConfig,
    worker_id: String,
}

impl BuildDriver {
    pub fn new(
        store: Arc<dyn JobStore>,
        files: Arc<dyn FileSource>,
        uploader: Arc<dyn ArtifactUploader>,
        publisher: ProgressPublisher,
        config: DriverConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            files,
            uploader,
            publisher,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Execute `job_id`. Safe to call again for a redelivered PENDING or
    /// RUNNING job; a terminal job is left alone.
    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn drive(&self, job_id: DbId) -> DriveOutcome {
        let job = match self.store.mark_running(job_id, &self.worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::info!(job_id, "Job is not runnable, skipping");
                return DriveOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to claim job row");
                return DriveOutcome::Deferred(e.to_string());
            }
        };

        tracing::info!(job_id, job_type = %job.job_type, "Job started");
        self.publisher.status(job_id, JobStatus::Running).await;

        let Some(job_type) = job.kind() else {
            let mut run = JobRun::new(self, job_id, StageTracker::new(&[]));
            let err = BuildError::Config(format!("unknown job type '{}'", job.job_type));
            return run.fail(err).await;
        };

        let progress = job.progress();
        let tracker = StageTracker::resume(
            job_type.stage_table(),
            progress.current_step.as_deref(),
            &progress.completed_steps,
        );
        let mut run = JobRun::new(self, job_id, tracker);

        match run.execute(&job, job_type).await {
            Ok(RunEnd::Succeeded) => run.succeed().await,
            Ok(RunEnd::Cancelled) => run.cancelled().await,
            Err(e) => run.fail(e).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-job run state
// ---------------------------------------------------------------------------

enum RunEnd {
    Succeeded,
    Cancelled,
}

struct JobRun<'a> {
    driver: &'a BuildDriver,
    job_id: DbId,
    tracker: StageTracker,
    sink: PersistenceSink,
    tail: VecDeque<String>,
    deadline: Instant,
}

impl<'a> JobRun<'a> {
    fn new(driver: &'a BuildDriver, job_id: DbId, tracker: StageTracker) -> Self {
        let config = &driver.config;
        Self {
            driver,
            job_id,
            tracker,
            sink: PersistenceSink::new(driver.store.clone(), job_id, config.log_flush_lines),
            tail: VecDeque::with_capacity(FAILURE_TAIL_LINES),
            deadline: Instant::now() + config.max_job_duration,
        }
    }

    async fn execute(&mut self, job: &Job, job_type: JobType) -> Result<RunEnd, BuildError> {
        let driver = self.driver;
        let config = &driver.config;
        let workspace = JobWorkspace::acquire(&config.workspace_root, self.job_id).await?;
        let materialized = self.materialize(job.project_id, &workspace).await?;

        let mut inputs: HashSet<String> = materialized.iter().cloned().collect();
        let plan = match job_type {
            JobType::Build => {
                let settings = BuildSettings::from_config(&job.config)?;
                let sources = resolve_inputs(&settings.verilog_files, &materialized)?;
                let rendered = settings.to_librelane_config(&sources);
                let bytes = serde_json::to_vec_pretty(&rendered)
                    .map_err(|e| BuildError::Infra(e.to_string()))?;
                workspace.write_file(LIBRELANE_CONFIG_FILE, &bytes).await?;
                inputs.insert(LIBRELANE_CONFIG_FILE.to_string());
                self.note(format!(
                    "Design {} on {} with {} source files",
                    settings.design_name,
                    settings.pdk,
                    sources.len()
                ))
                .await;
                build_plan(self.job_id, &settings, &config.tools, workspace.path())
            }
            JobType::Simulation => {
                let settings = SimulationSettings::from_config(&job.config)?;
                if !materialized.contains(&settings.testbench) {
                    return Err(BuildError::Input(format!(
                        "testbench '{}' not found in project",
                        settings.testbench
                    )));
                }
                let mut sources = resolve_inputs(&settings.verilog_files, &materialized)?;
                if !sources.contains(&settings.testbench) {
                    sources.push(settings.testbench.clone());
                }
                simulation_plan(&settings, &sources, &config.tools, workspace.path())
            }
        };

        self.persist_progress(&ProgressData::from_tracker(&self.tracker))
            .await;

        for step in &plan {
            if let RunEnd::Cancelled = self.run_step(step, workspace.path()).await? {
                return Ok(RunEnd::Cancelled);
            }
        }

        let outputs = workspace.outputs(&inputs).await?;
        driver
            .uploader
            .upload(self.job_id, workspace.path(), &outputs)
            .await
            .map_err(|e| BuildError::Infra(format!("artifact upload failed: {e}")))?;
        self.note(format!("Collected {} artifact files", outputs.len()))
            .await;

        Ok(RunEnd::Succeeded)
    }

    /// Copy every project file with content into the workspace.
    async fn materialize(
        &mut self,
        project_id: DbId,
        workspace: &JobWorkspace,
    ) -> Result<Vec<String>, BuildError> {
        let source = self.driver.files.clone();
        let files = source.list(project_id).await?;
        let mut written = Vec::with_capacity(files.len());

        for file in &files {
            let result = match source.fetch(file).await {
                Ok(Some(bytes)) => workspace
                    .write_file(&file.filepath, &bytes)
                    .await
                    .map_err(|e| e.to_string()),
                Ok(None) => Err("no stored content".to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => written.push(file.filepath.clone()),
                Err(reason) => {
                    tracing::warn!(job_id = self.job_id, file = %file.filepath, %reason, "Skipped project file");
                    self.note(format!("WARNING: skipped {}: {reason}", file.filepath))
                        .await;
                }
            }
        }

        if written.is_empty() {
            return Err(BuildError::Input(format!(
                "project {project_id} has no files to build"
            )));
        }
        self.note(format!(
            "Materialized {} of {} project files",
            written.len(),
            files.len()
        ))
        .await;
        Ok(written)
    }

    async fn run_step(&mut self, step: &PlanStep, cwd: &Path) -> Result<RunEnd, BuildError> {
        if self.cancel_requested().await {
            return Ok(RunEnd::Cancelled);
        }
        if let Some(transition) = step.stage.and_then(|name| self.tracker.enter(name)) {
            self.on_transition(transition).await;
        }

        self.note(format!("$ {}", step.command)).await;
        self.tail.clear();
        let mut tool = runner::spawn(&step.command, cwd).map_err(|e| {
            BuildError::Infra(format!("failed to start {}: {e}", step.command.program))
        })?;

        let config = &self.driver.config;
        let mut cancel_poll = tokio::time::interval(config.cancel_poll_interval);
        cancel_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cancel_poll.tick().await;
        let mut flush_tick = tokio::time::interval(config.log_flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_tick.tick().await;

        loop {
            tokio::select! {
                line = tool.output.recv() => match line {
                    Some(line) => self.on_line(line).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(self.deadline) => {
                    self.abort(&mut tool, step).await;
                    return Err(self.timeout());
                }
                _ = cancel_poll.tick() => {
                    if self.cancel_requested().await {
                        self.abort(&mut tool, step).await;
                        return Ok(RunEnd::Cancelled);
                    }
                }
                _ = flush_tick.tick() => self.sink.flush().await,
            }
        }

        let status = match tokio::time::timeout_at(self.deadline, tool.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                self.abort(&mut tool, step).await;
                return Err(self.timeout());
            }
        };

        if status.success() {
            tracing::debug!(job_id = self.job_id, command = %step.command.program, "Step finished");
            Ok(RunEnd::Succeeded)
        } else {
            Err(BuildError::ToolFailure {
                program: step.command.program.clone(),
                exit_code: status.code(),
                tail: self.tail.iter().cloned().collect(),
            })
        }
    }

    /// One line of tool output.
    async fn on_line(&mut self, line: String) {
        if self.tail.len() == FAILURE_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.clone());

        self.driver.publisher.log(self.job_id, &line).await;
        let transition = self.tracker.observe(&line);
        self.sink.push_line(line).await;

        if let Some(transition) = transition {
            self.on_transition(transition).await;
        }
    }

    async fn on_transition(&mut self, transition: StageTransition) {
        tracing::info!(
            job_id = self.job_id,
            stage = transition.stage.name,
            previous = ?transition.previous,
            progress = transition.progress_percent,
            "Stage advanced"
        );
        self.sink.flush().await;
        let data = ProgressData::from_tracker(&self.tracker);
        self.persist_progress(&data).await;

        let publisher = &self.driver.publisher;
        publisher.step(self.job_id, transition.stage).await;
        publisher.progress(self.job_id, &data).await;
    }

    /// Driver-generated log line. Not fed to the stage detector.
    async fn note(&mut self, line: String) {
        self.driver.publisher.log(self.job_id, &line).await;
        self.sink.push_line(line).await;
    }

    async fn persist_progress(&self, data: &ProgressData) {
        if let Err(e) = self.driver.store.update_progress(self.job_id, data).await {
            tracing::warn!(job_id = self.job_id, error = %e, "Failed to persist progress");
        }
    }

    async fn cancel_requested(&self) -> bool {
        match self.driver.store.job_status(self.job_id).await {
            Ok(status) => status == Some(JobStatus::Cancelled),
            Err(e) => {
                tracing::warn!(job_id = self.job_id, error = %e, "Cancellation check failed");
                false
            }
        }
    }

    /// Kill the step's process group and reap the tool, then run its
    /// cleanup command.
    async fn abort(&self, tool: &mut RunningTool, step: &PlanStep) {
        if let Err(e) = tool.kill().await {
            tracing::warn!(job_id = self.job_id, error = %e, "Failed to kill tool process");
        }
        if let Some(cleanup) = &step.cleanup {
            match runner::run_quiet(cleanup, CLEANUP_TIMEOUT).await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(job_id = self.job_id, command = %cleanup, ?status, "Cleanup command failed")
                }
                Err(e) => {
                    tracing::warn!(job_id = self.job_id, command = %cleanup, error = %e, "Cleanup command failed")
                }
            }
        }
    }

    fn timeout(&self) -> BuildError {
        BuildError::Timeout {
            limit: self.driver.config.max_job_duration,
        }
    }

    // -- endings --------------------------------------------------------------

    async fn succeed(&mut self) -> DriveOutcome {
        self.tracker.finish();
        let data = ProgressData::from_tracker(&self.tracker);
        self.note("Job completed successfully".to_string()).await;
        self.sink.flush().await;

        let path = artifacts_path(self.job_id);
        let recorded = self.driver.store.complete(self.job_id, &path, &data).await;
        match recorded {
            Ok(true) => {
                tracing::info!(job_id = self.job_id, "Job completed");
                let publisher = &self.driver.publisher;
                publisher.progress(self.job_id, &data).await;
                publisher
                    .complete(self.job_id, JobStatus::Completed, None)
                    .await;
                DriveOutcome::Completed
            }
            Ok(false) => {
                if self.cancel_requested().await {
                    return self.cancelled().await;
                }
                tracing::warn!(job_id = self.job_id, "Job was finalized elsewhere before completion");
                DriveOutcome::Skipped
            }
            Err(e) => self.fail(e.into()).await,
        }
    }

    async fn cancelled(&mut self) -> DriveOutcome {
        tracing::info!(job_id = self.job_id, "Job cancelled");
        self.note("Job cancelled".to_string()).await;
        self.sink.flush().await;
        self.driver
            .publisher
            .complete(
                self.job_id,
                JobStatus::Cancelled,
                Some("Job cancelled".to_string()),
            )
            .await;
        DriveOutcome::Cancelled
    }

    async fn fail(&mut self, error: BuildError) -> DriveOutcome {
        let message = error.to_string();
        tracing::warn!(job_id = self.job_id, error = %message, "Job failed");
        self.note(format!("ERROR: {message}")).await;
        self.sink.flush().await;

        let recorded = self.driver.store.fail(self.job_id, &message).await;
        match recorded {
            Ok(true) => {}
            Ok(false) => {
                if self.cancel_requested().await {
                    return self.cancelled().await;
                }
                tracing::warn!(job_id = self.job_id, "Job was already terminal when failing");
            }
            Err(e) => {
                tracing::error!(job_id = self.job_id, error = %e, "Failed to record job failure");
            }
        }

        let publisher = &self.driver.publisher;
        publisher.error(self.job_id, &message).await;
        publisher
            .complete(self.job_id, JobStatus::Failed, Some(message.clone()))
            .await;
        DriveOutcome::Failed(message)
    }
}

/// Explicit sources must all have been materialized; otherwise fall back to
/// extension detection.
fn resolve_inputs(explicit: &[String], materialized: &[String]) -> Result<Vec<String>, BuildError> {
    let missing: Vec<&str> = explicit
        .iter()
        .filter(|f| !materialized.contains(f))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(BuildError::Input(format!(
            "source files not found in project: {}",
            missing.join(", ")
        )));
    }

    let sources = resolve_sources(explicit, materialized);
    if sources.is_empty() {
        return Err(BuildError::Input(
            "no Verilog sources found (expected .v, .sv or .vh files)".to_string(),
        ));
    }
    Ok(sources)
}
