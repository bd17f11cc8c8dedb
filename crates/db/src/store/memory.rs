use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use a6hub_core::error::CoreError;
use a6hub_core::job_status::JobStatus;
use a6hub_core::job_type::JobType;
use a6hub_core::progress::ProgressData;
use a6hub_core::types::{DbId, Timestamp};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{JobQueue, JobStore, StoreError, StoreResult};
use crate::models::job::{CreateJob, Job};
use crate::models::project::Project;
use crate::models::queue::QueueEntry;

/// In-process store for tests and single-process runs.
///
/// Status writes go through [`JobStatus::can_transition_to`], matching the
/// `status_id` guards in the SQL repositories. Queue and log writes can be
/// switched off to simulate an outage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    queue_down: AtomicBool,
    log_writes_down: AtomicBool,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<DbId, Job>,
    projects: HashMap<DbId, Project>,
    files: HashMap<DbId, Vec<String>>,
    queue: Vec<QueueEntry>,
    next_job_id: DbId,
    next_project_id: DbId,
    next_queue_id: DbId,
}

impl Inner {
    /// Apply a transition if allowed; returns the job when it moved.
    fn transition(&mut self, id: DbId, to: JobStatus) -> Option<&mut Job> {
        let job = self.jobs.get_mut(&id)?;
        let from = job.status()?;
        if !from.can_transition_to(to) {
            return None;
        }
        job.status_id = to.id();
        job.updated_at = Utc::now();
        if to.is_terminal() {
            job.completed_at = Some(job.updated_at);
        }
        Some(job)
    }

    fn job_status(&self, id: DbId) -> Option<JobStatus> {
        self.jobs.get(&id).and_then(Job::status)
    }

    fn insert_job(&mut self, input: &CreateJob) -> StoreResult<Job> {
        if !self.projects.contains_key(&input.project_id) {
            return Err(CoreError::NotFound {
                entity: "project",
                id: input.project_id,
            }
            .into());
        }
        self.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id: self.next_job_id,
            job_type: input.job_type.as_str().to_string(),
            status_id: JobStatus::Pending.id(),
            config: input.config.clone(),
            started_at: None,
            completed_at: None,
            current_step: None,
            progress_data: None,
            logs: None,
            error_message: None,
            artifacts_path: None,
            project_id: input.project_id,
            user_id: input.user_id,
            worker_id: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn push_entry(&mut self, job_id: DbId, job_type: JobType) -> bool {
        if self.queue.iter().any(|e| e.job_id == job_id) {
            return false;
        }
        self.next_queue_id += 1;
        let entry = QueueEntry {
            id: self.next_queue_id,
            job_id,
            queue: job_type.as_str().to_string(),
            enqueued_at: Utc::now(),
            claimed_by: None,
            claimed_at: None,
            attempts: 0,
        };
        self.queue.push(entry);
        true
    }

    /// Newest first; ids break ties between jobs created in the same instant.
    fn project_jobs(&self, project_id: DbId) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.project_id == project_id)
            .collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        jobs
    }
}

fn outage() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

fn age_cutoff(age: Duration) -> Timestamp {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now() - age
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_project(&self, owner_id: DbId, visibility: &str) -> Project {
        let mut inner = self.inner.lock().await;
        inner.next_project_id += 1;
        let now = Utc::now();
        let project = Project {
            id: inner.next_project_id,
            owner_id,
            name: format!("project-{}", inner.next_project_id),
            visibility: visibility.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.projects.insert(project.id, project.clone());
        project
    }

    pub async fn insert_project_file(&self, project_id: DbId, filepath: &str) {
        let mut inner = self.inner.lock().await;
        let files = inner.files.entry(project_id).or_default();
        files.push(filepath.to_string());
        files.sort();
    }

    /// While down, every queue write fails as if the pool timed out.
    pub fn set_queue_down(&self, down: bool) {
        self.queue_down.store(down, Ordering::SeqCst);
    }

    /// While down, `append_logs` fails as if the pool timed out.
    pub fn set_log_writes_down(&self, down: bool) {
        self.log_writes_down.store(down, Ordering::SeqCst);
    }

    fn check_queue(&self) -> StoreResult<()> {
        if self.queue_down.load(Ordering::SeqCst) {
            return Err(outage());
        }
        Ok(())
    }

    /// Full log text of a job, empty if none.
    pub async fn logs(&self, id: DbId) -> String {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&id)
            .and_then(|j| j.logs.clone())
            .unwrap_or_default()
    }

    pub async fn queue_entries(&self) -> Vec<QueueEntry> {
        self.inner.lock().await.queue.clone()
    }

    /// Rewind a job's `updated_at`, simulating a silent worker.
    pub async fn backdate_job(&self, id: DbId, by: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.updated_at = age_cutoff(by);
        }
    }

    /// Rewind a queue claim, simulating a worker that died after claiming.
    pub async fn backdate_claim(&self, job_id: DbId, by: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.queue.iter_mut().find(|e| e.job_id == job_id) {
            entry.claimed_at = Some(age_cutoff(by));
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create_job(&self, input: &CreateJob) -> StoreResult<Job> {
        self.inner.lock().await.insert_job(input)
    }

    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn find_project(&self, id: DbId) -> StoreResult<Option<Project>> {
        Ok(self.inner.lock().await.projects.get(&id).cloned())
    }

    async fn list_project_jobs(&self, project_id: DbId) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .project_jobs(project_id)
            .into_iter()
            .map(|j| Job {
                logs: None,
                ..j.clone()
            })
            .collect())
    }

    async fn latest_job(&self, project_id: DbId, job_type: JobType) -> StoreResult<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .project_jobs(project_id)
            .into_iter()
            .find(|j| j.job_type == job_type.as_str())
            .cloned())
    }

    async fn project_file_paths(&self, project_id: DbId) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.files.get(&project_id).cloned().unwrap_or_default())
    }

    async fn job_status(&self, id: DbId) -> StoreResult<Option<JobStatus>> {
        Ok(self.inner.lock().await.job_status(id))
    }

    async fn mark_running(&self, id: DbId, worker_id: &str) -> StoreResult<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.transition(id, JobStatus::Running) else {
            return Ok(None);
        };
        job.worker_id = Some(worker_id.to_string());
        job.started_at.get_or_insert(job.updated_at);
        Ok(Some(job.clone()))
    }

    async fn append_logs(&self, id: DbId, chunk: &str) -> StoreResult<()> {
        if self.log_writes_down.load(Ordering::SeqCst) {
            return Err(outage());
        }
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.logs.get_or_insert_with(String::new).push_str(chunk);
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_progress(&self, id: DbId, data: &ProgressData) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status() != Some(JobStatus::Running)
            || job.progress().progress_percent > data.progress_percent
        {
            return Ok(false);
        }
        job.current_step = data.current_step.clone();
        job.progress_data = Some(data.to_json());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(
        &self,
        id: DbId,
        artifacts_path: &str,
        data: &ProgressData,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.transition(id, JobStatus::Completed) else {
            return Ok(false);
        };
        job.artifacts_path = Some(artifacts_path.to_string());
        job.current_step = data.current_step.clone();
        job.progress_data = Some(data.to_json());
        Ok(true)
    }

    async fn fail(&self, id: DbId, error: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.transition(id, JobStatus::Failed) else {
            return Ok(false);
        };
        job.error_message = Some(error.to_string());
        Ok(true)
    }

    async fn cancel(&self, id: DbId) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(id, JobStatus::Cancelled).is_some())
    }

    async fn fail_stale_running(&self, max_age: Duration, error: &str) -> StoreResult<Vec<DbId>> {
        let cutoff = age_cutoff(max_age);
        let mut inner = self.inner.lock().await;
        let stale: Vec<DbId> = inner
            .jobs
            .values()
            .filter(|j| j.status() == Some(JobStatus::Running) && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();
        for id in &stale {
            if let Some(job) = inner.transition(*id, JobStatus::Failed) {
                job.error_message = Some(error.to_string());
            }
        }
        Ok(stale)
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn submit(&self, input: &CreateJob) -> StoreResult<Job> {
        self.check_queue()?;
        let mut inner = self.inner.lock().await;
        let job = inner.insert_job(input)?;
        inner.push_entry(job.id, input.job_type);
        Ok(job)
    }

    async fn enqueue(&self, job_id: DbId, job_type: JobType) -> StoreResult<bool> {
        self.check_queue()?;
        Ok(self.inner.lock().await.push_entry(job_id, job_type))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        queues: &[JobType],
    ) -> StoreResult<Option<QueueEntry>> {
        let mut inner = self.inner.lock().await;
        let entry = inner.queue.iter_mut().find(|e| {
            e.claimed_at.is_none() && queues.iter().any(|q| q.as_str() == e.queue)
        });
        Ok(entry.map(|e| {
            e.claimed_by = Some(worker_id.to_string());
            e.claimed_at = Some(Utc::now());
            e.attempts += 1;
            e.clone()
        }))
    }

    async fn remove(&self, job_id: DbId) -> StoreResult<()> {
        self.inner.lock().await.queue.retain(|e| e.job_id != job_id);
        Ok(())
    }

    async fn release_stale(
        &self,
        visibility: Duration,
        max_attempts: i32,
    ) -> StoreResult<Vec<DbId>> {
        let cutoff = age_cutoff(visibility);
        let mut inner = self.inner.lock().await;
        let pending: Vec<DbId> = inner
            .queue
            .iter()
            .filter(|e| inner.job_status(e.job_id) == Some(JobStatus::Pending))
            .map(|e| e.job_id)
            .collect();

        let mut released = Vec::new();
        for entry in inner.queue.iter_mut() {
            let stale = entry.claimed_at.is_some_and(|at| at < cutoff);
            if stale && entry.attempts < max_attempts && pending.contains(&entry.job_id) {
                entry.claimed_by = None;
                entry.claimed_at = None;
                released.push(entry.job_id);
            }
        }
        Ok(released)
    }

    async fn take_exhausted(
        &self,
        visibility: Duration,
        max_attempts: i32,
    ) -> StoreResult<Vec<DbId>> {
        let cutoff = age_cutoff(visibility);
        let mut inner = self.inner.lock().await;
        let exhausted: Vec<DbId> = inner
            .queue
            .iter()
            .filter(|e| {
                inner.job_status(e.job_id) == Some(JobStatus::Pending)
                    && e.claimed_at.is_some_and(|at| at < cutoff)
                    && e.attempts >= max_attempts
            })
            .map(|e| e.job_id)
            .collect();
        inner.queue.retain(|e| !exhausted.contains(&e.job_id));
        Ok(exhausted)
    }

    async fn purge_terminal(&self) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let terminal: Vec<DbId> = inner
            .queue
            .iter()
            .filter(|e| inner.job_status(e.job_id).is_some_and(JobStatus::is_terminal))
            .map(|e| e.job_id)
            .collect();
        inner.queue.retain(|e| !terminal.contains(&e.job_id));
        Ok(terminal.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
