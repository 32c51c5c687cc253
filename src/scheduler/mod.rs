//! Background scheduler for deadline-driven acceptance and diff pre-caching.
//!
//! The scheduler polls storage for requests whose `accept_at` has elapsed and
//! fires system-authority acceptance for each, and drains the diff job queue
//! with capped retries. Its own lifecycle is tracked as a typestate record
//! persisted through `SchedulerStorage`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::RequestManager;
use crate::error::{GreenlightError, Result};
use crate::jobs::JobQueue;
use crate::request::types::RequestNumber;
use crate::storage::SchedulerStorage;

pub mod transitions;
pub mod types;

pub use types::{
    AnySchedulerRecord, Dead, Initializing, Running, SchedulerData, SchedulerId, SchedulerRecord,
    SchedulerState, SchedulerStats, SchedulerStatus,
};

/// Configuration for the scheduler.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerConfig {
    /// How often to poll for requests with an elapsed accept_at (milliseconds)
    pub accept_poll_interval_ms: u64,

    /// How often to drain the diff job queue (milliseconds)
    pub job_poll_interval_ms: u64,

    /// Maximum number of jobs to claim in each iteration
    pub job_batch_size: usize,

    /// Maximum attempts per diff job before it is parked as failed
    pub max_job_attempts: u32,

    /// Interval for persisting heartbeats with current stats (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Interval for logging scheduler status (milliseconds)
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            accept_poll_interval_ms: 1000,
            job_poll_interval_ms: 1000,
            job_batch_size: 10,
            max_job_attempts: 5,
            heartbeat_interval_ms: 10000,      // Heartbeat every 10 seconds by default
            status_log_interval_ms: Some(2000), // Log every 2 seconds by default
        }
    }
}

/// Scheduler that drives deadline acceptance and background diff jobs.
pub struct Scheduler<S>
where
    S: SchedulerStorage,
{
    scheduler_id: SchedulerId,
    manager: Arc<RequestManager>,
    storage: Arc<S>,
    jobs: Arc<dyn JobQueue>,
    config: SchedulerConfig,
    requests_accepted: Arc<AtomicU64>,
    jobs_processed: Arc<AtomicU64>,
    jobs_failed: Arc<AtomicU64>,
    shutdown_token: CancellationToken,
    /// Requests with an acceptance attempt currently in flight, so a slow
    /// attempt is not fired twice across poll ticks
    in_flight: Arc<dashmap::DashMap<RequestNumber, ()>>,
}

impl<S> Scheduler<S>
where
    S: SchedulerStorage + 'static,
{
    /// Create a new scheduler.
    pub fn new(
        manager: Arc<RequestManager>,
        storage: Arc<S>,
        jobs: Arc<dyn JobQueue>,
        config: SchedulerConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            scheduler_id: SchedulerId::from(uuid::Uuid::new_v4()),
            manager,
            storage,
            jobs,
            config,
            requests_accepted: Arc::new(AtomicU64::new(0)),
            jobs_processed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
            shutdown_token,
            in_flight: Arc::new(dashmap::DashMap::new()),
        }
    }

    pub fn id(&self) -> SchedulerId {
        self.scheduler_id
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            requests_accepted: self.requests_accepted.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Run the scheduler loop.
    ///
    /// Spawns a background task that registers a lifecycle record, polls for
    /// due acceptances and queued jobs, persists heartbeats, and marks the
    /// record dead on graceful shutdown.
    ///
    /// # Errors
    /// Fails with `Shutdown` when the token is already cancelled; the returned
    /// handle resolves to an error if persisting the lifecycle record fails.
    pub fn run(self: Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        if self.shutdown_token.is_cancelled() {
            return Err(GreenlightError::Shutdown);
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let data = SchedulerData {
                id: this.scheduler_id,
                hostname: types::get_hostname(),
                pid: types::get_pid(),
                version: types::get_version(),
                config_snapshot: serde_json::to_value(&this.config)
                    .unwrap_or(serde_json::Value::Null),
            };
            let initializing = SchedulerRecord {
                data,
                state: Initializing {
                    started_at: chrono::Utc::now(),
                },
            };
            let mut record = initializing.start(this.storage.as_ref()).await?;
            tracing::info!(scheduler_id = %this.scheduler_id, "Scheduler started");

            let mut accept_interval = tokio::time::interval(std::time::Duration::from_millis(
                this.config.accept_poll_interval_ms,
            ));
            let mut job_interval = tokio::time::interval(std::time::Duration::from_millis(
                this.config.job_poll_interval_ms,
            ));
            let mut heartbeat_interval = tokio::time::interval(std::time::Duration::from_millis(
                this.config.heartbeat_interval_ms,
            ));
            let mut status_interval = this
                .config
                .status_log_interval_ms
                .map(|ms| tokio::time::interval(std::time::Duration::from_millis(ms)));

            loop {
                tokio::select! {
                    _ = this.shutdown_token.cancelled() => {
                        break;
                    }
                    _ = accept_interval.tick() => {
                        this.poll_due_requests().await;
                    }
                    _ = job_interval.tick() => {
                        this.drain_jobs().await;
                    }
                    _ = heartbeat_interval.tick() => {
                        record = record.heartbeat(this.stats(), this.storage.as_ref()).await?;
                    }
                    _ = tick_opt(status_interval.as_mut()) => {
                        let stats = this.stats();
                        let pending_jobs = this.jobs.pending().await;
                        tracing::info!(
                            scheduler_id = %this.scheduler_id,
                            requests_accepted = stats.requests_accepted,
                            jobs_processed = stats.jobs_processed,
                            jobs_failed = stats.jobs_failed,
                            pending_jobs = pending_jobs,
                            "Scheduler status"
                        );
                    }
                }
            }

            let dead = record.shutdown(this.storage.as_ref()).await?;
            tracing::info!(
                scheduler_id = %this.scheduler_id,
                requests_accepted = dead.state.final_stats.requests_accepted,
                "Scheduler stopped"
            );
            Ok(())
        });
        Ok(handle)
    }

    /// Fire acceptance attempts for every request whose deadline elapsed.
    async fn poll_due_requests(&self) {
        let due = match self.manager.due_for_acceptance().await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll for due requests");
                return;
            }
        };
        for number in due {
            if self.in_flight.insert(number, ()).is_some() {
                continue;
            }
            let manager = self.manager.clone();
            let in_flight = self.in_flight.clone();
            let accepted = self.requests_accepted.clone();
            tokio::spawn(async move {
                match manager.accept_due(number).await {
                    Ok(true) => {
                        accepted.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(number = %number, "Auto-accepted request on elapsed deadline");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(number = %number, error = %e, "Deadline acceptance failed");
                    }
                }
                in_flight.remove(&number);
            });
        }
    }

    /// Claim a batch of diff jobs and run them, retrying failures until the
    /// configured attempt cap.
    async fn drain_jobs(&self) {
        let claimed = match self.jobs.claim(self.config.job_batch_size).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to claim diff jobs");
                return;
            }
        };
        for mut job in claimed {
            match self.manager.prime_action_diff(&job).await {
                Ok(()) => {
                    self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(GreenlightError::RequestNotFound(_)) => {
                    // The request is gone; the job is obsolete.
                    tracing::debug!(job_id = %job.id, number = %job.number, "Dropping diff job for missing request");
                }
                Err(e) => {
                    job.attempts += 1;
                    if job.attempts >= self.config.max_job_attempts {
                        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                        let error = anyhow::anyhow!(e).context("diff pre-cache");
                        if let Err(record_err) = self.jobs.record_failure(job, &error).await {
                            tracing::warn!(error = %record_err, "Failed to record job failure");
                        }
                    } else if let Err(requeue_err) = self.jobs.requeue(job).await {
                        tracing::warn!(error = %requeue_err, "Failed to requeue diff job");
                    }
                }
            }
        }
    }
}

/// Tick an optional interval, or pend forever when logging is disabled.
async fn tick_opt(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
