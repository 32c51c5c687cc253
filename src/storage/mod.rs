//! Persistence traits for the workflow engine.
//!
//! This module defines the `Storage` and `SchedulerStorage` traits: atomic
//! number assignment, compare-and-set commits for request aggregates, and
//! lifecycle records for the background scheduler. The engine validates
//! guards against the loaded version and commits only if nothing moved in
//! between; implementations don't re-validate transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::filters::RequestFilter;
use crate::error::Result;
use crate::request::types::{Request, RequestNumber};
use crate::scheduler::types::{
    AnySchedulerRecord, SchedulerId, SchedulerRecord, SchedulerState, SchedulerStatus,
};

pub mod memory;

/// A request together with the version its caller loaded.
///
/// The version travels back into `commit`; a mismatch there means another
/// command won the race and the caller must reload.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub request: Request,
    pub version: u64,
}

/// Storage trait for persisting and querying requests.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Produce the next request number. Atomic and globally serialized: no
    /// two calls ever return the same number.
    async fn next_number(&self) -> Result<RequestNumber>;

    /// Persist a freshly created request under its assigned number.
    async fn insert(&self, request: Request) -> Result<Versioned>;

    /// Load a request by number.
    ///
    /// # Errors
    /// `RequestNotFound` if no request carries this number.
    async fn load(&self, number: RequestNumber) -> Result<Versioned>;

    /// Commit a mutated request if the stored version still equals
    /// `expected_version`.
    ///
    /// # Errors
    /// `ConcurrentModification` when the stored version moved since load.
    async fn commit(&self, request: Request, expected_version: u64) -> Result<Versioned>;

    /// Destructively replace a request wholesale, keeping its number, inside
    /// one atomic step. Used by the `update` command surface.
    async fn replace(&self, request: Request, expected_version: u64) -> Result<Versioned>;

    /// Hard-delete a request, returning its final snapshot for the deletion
    /// notification.
    async fn remove(&self, number: RequestNumber) -> Result<Request>;

    /// All requests matching the filter, ordered by number ascending. The
    /// filter's `limit` truncates after ordering.
    async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>>;

    /// Numbers of non-terminal requests whose `accept_at` has elapsed and
    /// which hold no open review. Polled by the scheduler.
    async fn due_for_acceptance(&self, now: DateTime<Utc>) -> Result<Vec<RequestNumber>>;
}

/// Scheduler lifecycle persistence.
///
/// This trait provides storage operations for tracking scheduler state,
/// including registration, heartbeat updates, and graceful shutdown.
#[async_trait]
pub trait SchedulerStorage: Send + Sync {
    /// Persist a scheduler state update.
    ///
    /// This is a low-level method used by the state transition methods.
    /// The type parameter `T` ensures type-safe state transitions.
    async fn persist_scheduler<T: SchedulerState + Clone>(
        &self,
        record: &SchedulerRecord<T>,
    ) -> Result<()>
    where
        AnySchedulerRecord: From<SchedulerRecord<T>>;

    /// Get a scheduler record by ID.
    async fn get_scheduler(&self, scheduler_id: SchedulerId) -> Result<AnySchedulerRecord>;

    /// List all scheduler records with optional status filter.
    async fn list_schedulers(
        &self,
        status_filter: Option<SchedulerStatus>,
    ) -> Result<Vec<AnySchedulerRecord>>;
}
