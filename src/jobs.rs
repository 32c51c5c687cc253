//! Background job collaborator.
//!
//! Request creation enqueues one "compute and cache the diff" unit of work per
//! action. Jobs are fire-and-forget from the engine's point of view: they run
//! after the creating transaction commits, and their failures are recorded and
//! retried independently, never surfaced to the original caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, error_serialization};
use crate::request::types::RequestNumber;

/// Unique identifier for a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub Uuid);

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        JobId(uuid)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Warm the diff cache for one action of a request.
#[derive(Debug, Clone)]
pub struct DiffJob {
    pub id: JobId,
    pub number: RequestNumber,
    pub action_index: usize,
    pub with_issues: bool,
    /// Attempts so far; the scheduler gives up past its configured maximum
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl DiffJob {
    pub fn new(number: RequestNumber, action_index: usize) -> Self {
        DiffJob {
            id: JobId::from(Uuid::new_v4()),
            number,
            action_index,
            with_issues: false,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job that exhausted its retries, kept for inspection.
#[derive(Debug, Clone)]
pub struct FailedDiffJob {
    pub job: DiffJob,
    /// Error chain serialized via `error_serialization`
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Queue of fire-and-forget background work.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for later execution.
    async fn enqueue(&self, job: DiffJob) -> Result<()>;

    /// Take up to `limit` jobs off the queue.
    async fn claim(&self, limit: usize) -> Result<Vec<DiffJob>>;

    /// Put a failed job back for another attempt.
    async fn requeue(&self, job: DiffJob) -> Result<()>;

    /// Park a job that exhausted its retries, with its error chain.
    async fn record_failure(&self, job: DiffJob, error: &anyhow::Error) -> Result<()>;

    /// Number of jobs currently waiting.
    async fn pending(&self) -> usize;
}

/// In-memory job queue.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    queue: Arc<Mutex<VecDeque<DiffJob>>>,
    failed: Arc<Mutex<Vec<FailedDiffJob>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs that exhausted their retries.
    pub fn failed(&self) -> Vec<FailedDiffJob> {
        self.failed.lock().clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: DiffJob) -> Result<()> {
        tracing::debug!(job_id = %job.id, number = %job.number, action = job.action_index, "Enqueued diff job");
        self.queue.lock().push_back(job);
        Ok(())
    }

    async fn claim(&self, limit: usize) -> Result<Vec<DiffJob>> {
        let mut queue = self.queue.lock();
        let take = limit.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn requeue(&self, job: DiffJob) -> Result<()> {
        self.queue.lock().push_back(job);
        Ok(())
    }

    async fn record_failure(&self, job: DiffJob, error: &anyhow::Error) -> Result<()> {
        tracing::warn!(
            job_id = %job.id,
            number = %job.number,
            attempts = job.attempts,
            error = %error,
            "Diff job failed permanently"
        );
        self.failed.lock().push(FailedDiffJob {
            job,
            error: error_serialization::serialize_error(error),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}
