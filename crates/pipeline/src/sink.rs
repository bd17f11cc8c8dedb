//! Batched log persistence for a running job.

use std::collections::VecDeque;
use std::sync::Arc;

use a6hub_core::types::DbId;
use a6hub_db::store::JobStore;

/// Lines held while the store is unreachable. Older lines are dropped first.
pub const MAX_BUFFERED_LINES: usize = 10_000;

/// Buffers output lines and appends them to the job's `logs` column in
/// batches.
///
/// A failed append keeps the batch. Until the next successful flush, new
/// lines only accumulate (the periodic flush retries), and once
/// [`MAX_BUFFERED_LINES`] are held the oldest are discarded. The gap is
/// recorded in the log when writes resume.
pub struct PersistenceSink {
    store: Arc<dyn JobStore>,
    job_id: DbId,
    buffer: VecDeque<String>,
    flush_lines: usize,
    max_buffered: usize,
    failing: bool,
    dropped: usize,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn JobStore>, job_id: DbId, flush_lines: usize) -> Self {
        Self {
            store,
            job_id,
            buffer: VecDeque::new(),
            flush_lines: flush_lines.max(1),
            max_buffered: MAX_BUFFERED_LINES,
            failing: false,
            dropped: 0,
        }
    }

    pub fn with_max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered.max(1);
        self
    }

    /// Buffer `line`, flushing once the batch is full.
    pub async fn push_line(&mut self, line: impl Into<String>) {
        if self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            if self.dropped == 0 {
                tracing::warn!(
                    job_id = self.job_id,
                    limit = self.max_buffered,
                    "Log buffer full, dropping oldest lines"
                );
            }
            self.dropped += 1;
        }
        self.buffer.push_back(line.into());
        if !self.failing && self.buffer.len() >= self.flush_lines {
            self.flush().await;
        }
    }

    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut chunk = String::new();
        if self.dropped > 0 {
            chunk.push_str(&format!(
                "[{} log lines lost while the job store was unreachable]\n",
                self.dropped
            ));
        }
        for line in &self.buffer {
            chunk.push_str(line);
            chunk.push('\n');
        }
        match self.store.append_logs(self.job_id, &chunk).await {
            Ok(()) => {
                if self.failing {
                    tracing::info!(job_id = self.job_id, dropped = self.dropped, "Job log writes resumed");
                }
                self.buffer.clear();
                self.failing = false;
                self.dropped = 0;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = self.job_id,
                    buffered = self.buffer.len(),
                    error = %e,
                    "Failed to persist job logs, will retry"
                );
                self.failing = true;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
