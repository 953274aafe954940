//! Shared job state: single writer (the pipeline), many readers (the UI).

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed
        )
    }
}

/// Read-only progress snapshot, polled by the UI. Never blocks the pipeline.
#[derive(Clone, Debug)]
pub struct JobProgress {
    pub status: JobStatus,
    pub processed: u64,
    pub total_estimate: u64,
    pub text_messages: u64,
    pub media_messages: u64,
    pub failed_items: u64,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_estimate == 0 {
            return 0.0;
        }
        (self.processed as f64 / self.total_estimate as f64) * 100.0
    }
}

struct JobInner {
    status: Mutex<JobStatus>,
    processed: AtomicU64,
    total_estimate: AtomicU64,
    text_messages: AtomicU64,
    media_messages: AtomicU64,
    failed_items: AtomicU64,
    last_error: Mutex<Option<String>>,
    started_at: DateTime<Utc>,
}

/// Handle to one running export or redelivery job.
///
/// Status transitions are fixed: Running → Cancelling → Cancelled,
/// Running → Completed, Running → Failed. Anything else is a no-op.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl JobHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JobInner {
                status: Mutex::new(JobStatus::Running),
                processed: AtomicU64::new(0),
                total_estimate: AtomicU64::new(0),
                text_messages: AtomicU64::new(0),
                media_messages: AtomicU64::new(0),
                failed_items: AtomicU64::new(0),
                last_error: Mutex::new(None),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// External stop request. Idempotent; a no-op unless the job is Running.
    /// Returns whether the request took effect.
    pub fn request_cancel(&self) -> bool {
        let mut st = self.inner.status.lock().unwrap_or_else(|e| e.into_inner());
        if *st == JobStatus::Running {
            *st = JobStatus::Cancelling;
            debug!("job cancellation requested");
            return true;
        }
        false
    }

    pub fn is_cancel_requested(&self) -> bool {
        matches!(self.status(), JobStatus::Cancelling | JobStatus::Cancelled)
    }

    /// Running → Completed.
    pub fn mark_completed(&self) {
        self.transition(JobStatus::Completed, &[JobStatus::Running]);
    }

    /// Cancelling → Cancelled.
    pub fn mark_cancelled(&self) {
        self.transition(JobStatus::Cancelled, &[JobStatus::Cancelling]);
    }

    /// Running → Failed, recording the fatal error.
    pub fn mark_failed(&self, error: impl Into<String>) {
        self.set_last_error(error);
        self.transition(JobStatus::Failed, &[JobStatus::Running]);
    }

    fn transition(&self, to: JobStatus, allowed_from: &[JobStatus]) {
        let mut st = self.inner.status.lock().unwrap_or_else(|e| e.into_inner());
        if allowed_from.contains(&st) {
            *st = to;
        } else {
            debug!(from = ?*st, ?to, "ignoring invalid job status transition");
        }
    }

    pub fn set_total_estimate(&self, total: u64) {
        self.inner.total_estimate.store(total, Ordering::Relaxed);
    }

    pub fn add_total_estimate(&self, n: u64) {
        self.inner.total_estimate.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_processed(&self, n: u64) {
        self.inner.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_text_messages(&self, n: u64) {
        self.inner.text_messages.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_media_messages(&self, n: u64) {
        self.inner.media_messages.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed_items(&self, n: u64) {
        self.inner.failed_items.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        let mut slot = self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(error.into());
    }

    pub fn snapshot(&self) -> JobProgress {
        JobProgress {
            status: self.status(),
            processed: self.inner.processed.load(Ordering::Relaxed),
            total_estimate: self.inner.total_estimate.load(Ordering::Relaxed),
            text_messages: self.inner.text_messages.load(Ordering::Relaxed),
            media_messages: self.inner.media_messages.load(Ordering::Relaxed),
            failed_items: self.inner.failed_items.load(Ordering::Relaxed),
            last_error: self
                .inner
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            started_at: self.inner.started_at,
        }
    }
}
