//! Notification collaborator.
//!
//! Every committed transition hands an event record to a `Notifier` for
//! asynchronous delivery. Delivery is best-effort and ordering between events
//! is not guaranteed; a failed publish never rolls back the transition that
//! produced it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::request::types::{RequestNumber, UserId};

/// Unique identifier for an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        EventId(uuid)
    }
}

impl std::ops::Deref for EventId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestCreated,
    RequestStateChanged,
    ReviewWanted,
    ReviewChanged,
    RequestChanged,
    RequestDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RequestCreated => "request_created",
            EventKind::RequestStateChanged => "request_state_changed",
            EventKind::ReviewWanted => "review_wanted",
            EventKind::ReviewChanged => "review_changed",
            EventKind::RequestChanged => "request_changed",
            EventKind::RequestDeleted => "request_deleted",
        }
    }
}

/// An event record handed to the notification collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub number: RequestNumber,
    pub actor: UserId,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        number: RequestNumber,
        actor: UserId,
        payload: serde_json::Value,
    ) -> Self {
        Event {
            id: EventId::from(Uuid::new_v4()),
            kind,
            number,
            actor,
            payload,
            emitted_at: Utc::now(),
        }
    }
}

/// Accepts event records for asynchronous delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Hand off one event. Implementations must not block on delivery.
    async fn publish(&self, event: Event);
}

/// Notifier that forwards events into a tokio channel.
///
/// The receiving side is whatever delivery substrate the deployment uses; the
/// engine only needs the unbounded, non-blocking handoff.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelNotifier {
    /// Create a notifier together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn publish(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            // Receiver gone; the transition already committed, so only log.
            tracing::warn!(error = %e, "Dropping event, notification channel closed");
        }
    }
}

/// Notifier that records events in memory, for tests.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all events published so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events of one kind, in publish order.
    pub fn events_of(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Notifier that discards everything.
#[derive(Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn publish(&self, _event: Event) {}
}
