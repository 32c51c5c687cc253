//! In-memory implementation of `Storage` and `SchedulerStorage`.
//!
//! A single mutex over a number-ordered map gives every operation the
//! atomicity the traits demand; versions are bumped on each commit so the
//! engine's compare-and-set detects lost races. The production deployment
//! swaps this for a database-backed implementation behind the same traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{SchedulerStorage, Storage, Versioned};
use crate::engine::filters::RequestFilter;
use crate::error::{GreenlightError, Result};
use crate::request::types::{Request, RequestNumber};
use crate::scheduler::types::{
    AnySchedulerRecord, SchedulerId, SchedulerRecord, SchedulerState, SchedulerStatus,
};

struct Entry {
    request: Request,
    version: u64,
}

/// In-memory request store with optimistic concurrency.
#[derive(Default)]
pub struct InMemoryStorage {
    requests: Mutex<BTreeMap<u64, Entry>>,
    sequence: AtomicU64,
    schedulers: Mutex<Vec<AnySchedulerRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests. Test/introspection helper.
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn next_number(&self) -> Result<RequestNumber> {
        // fetch_add serializes creations; numbers are never reused even if
        // the insert that follows fails.
        Ok(RequestNumber(self.sequence.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn insert(&self, request: Request) -> Result<Versioned> {
        let mut requests = self.requests.lock();
        if requests.contains_key(&request.number.0) {
            return Err(GreenlightError::ValidationError(format!(
                "request number {} already exists",
                request.number
            )));
        }
        requests.insert(
            request.number.0,
            Entry {
                request: request.clone(),
                version: 1,
            },
        );
        Ok(Versioned {
            request,
            version: 1,
        })
    }

    async fn load(&self, number: RequestNumber) -> Result<Versioned> {
        let requests = self.requests.lock();
        requests
            .get(&number.0)
            .map(|entry| Versioned {
                request: entry.request.clone(),
                version: entry.version,
            })
            .ok_or(GreenlightError::RequestNotFound(number))
    }

    async fn commit(&self, request: Request, expected_version: u64) -> Result<Versioned> {
        let number = request.number;
        let mut requests = self.requests.lock();
        let entry = requests
            .get_mut(&number.0)
            .ok_or(GreenlightError::RequestNotFound(number))?;
        if entry.version != expected_version {
            return Err(GreenlightError::ConcurrentModification(number));
        }
        entry.version += 1;
        entry.request = request.clone();
        Ok(Versioned {
            request,
            version: entry.version,
        })
    }

    async fn replace(&self, request: Request, expected_version: u64) -> Result<Versioned> {
        // Same atomicity as commit; a separate entry point keeps the
        // destructive-update intent visible at call sites.
        self.commit(request, expected_version).await
    }

    async fn remove(&self, number: RequestNumber) -> Result<Request> {
        let mut requests = self.requests.lock();
        requests
            .remove(&number.0)
            .map(|entry| entry.request)
            .ok_or(GreenlightError::RequestNotFound(number))
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        let requests = self.requests.lock();
        // BTreeMap iteration is already number-ascending.
        let mut matched: Vec<Request> = requests
            .values()
            .filter(|entry| filter.matches(&entry.request))
            .map(|entry| entry.request.clone())
            .collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn due_for_acceptance(&self, now: DateTime<Utc>) -> Result<Vec<RequestNumber>> {
        let requests = self.requests.lock();
        Ok(requests
            .values()
            .filter(|entry| {
                let r = &entry.request;
                !r.state.is_terminal()
                    && !r.has_open_reviews()
                    && r.accept_at.is_some_and(|at| at <= now)
            })
            .map(|entry| entry.request.number)
            .collect())
    }
}

#[async_trait]
impl SchedulerStorage for InMemoryStorage {
    async fn persist_scheduler<T: SchedulerState + Clone>(
        &self,
        record: &SchedulerRecord<T>,
    ) -> Result<()>
    where
        AnySchedulerRecord: From<SchedulerRecord<T>>,
    {
        let any = AnySchedulerRecord::from(record.clone());
        let mut records = self.schedulers.lock();
        if let Some(existing) = records.iter_mut().find(|r| r.id() == any.id()) {
            *existing = any;
        } else {
            records.push(any);
        }
        Ok(())
    }

    async fn get_scheduler(&self, scheduler_id: SchedulerId) -> Result<AnySchedulerRecord> {
        let records = self.schedulers.lock();
        records
            .iter()
            .find(|r| r.id() == scheduler_id)
            .cloned()
            .ok_or_else(|| {
                GreenlightError::NotFound(format!("scheduler {} not registered", scheduler_id))
            })
    }

    async fn list_schedulers(
        &self,
        status_filter: Option<SchedulerStatus>,
    ) -> Result<Vec<AnySchedulerRecord>> {
        let records = self.schedulers.lock();
        Ok(records
            .iter()
            .filter(|r| status_filter.is_none() || status_filter == Some(r.status()))
            .cloned()
            .collect())
    }
}
