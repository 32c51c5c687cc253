//! Coordination engine for change-requests in a collaborative build service.
//!
//! A requester proposes one or more actions (submit source, delete, change
//! maintainership, ...) against target projects/packages; reviewers and
//! maintainers resolve review checkpoints, and the workflow engine drives the
//! request through its state machine until it reaches a terminal state and is
//! applied. Persistence, authorization, diff computation, notification
//! delivery and background work are collaborator traits; this crate ships
//! in-memory/mock implementations plus a reqwest-backed diff client.

pub mod authz;
pub mod diff;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod request;
pub mod scheduler;
pub mod sources;
pub mod storage;

// Re-export commonly used types
pub use authz::{AuthScope, Authorizer, Capability, StaticAuthorizer};
pub use diff::{DiffBackend, DiffFormat, DiffOptions, DiffOutput, HttpDiffBackend, MockDiffBackend};
pub use engine::commands::{Command, RequestedState, ReviewResolution};
pub use engine::filters::{FilterRole, RequestFilter};
pub use engine::{ActionInput, EngineConfig, RequestInput, RequestManager};
pub use error::{GreenlightError, Result};
pub use jobs::{DiffJob, InMemoryJobQueue, JobQueue};
pub use notify::{ChannelNotifier, Event, EventKind, Notifier, NullNotifier, RecordingNotifier};
pub use request::types::{
    AcceptInfo, Action, ActionKind, Coordinate, Priority, Request, RequestNumber, RequestState,
    Review, ReviewState, ReviewerRef, UserId,
};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use sources::{MockSourceService, SourceService};
pub use storage::memory::InMemoryStorage;
pub use storage::{SchedulerStorage, Storage, Versioned};
