//! Scheduler state types using the typestate pattern.
//!
//! This module defines type-safe scheduler lifecycle management. Each
//! scheduler instance progresses through distinct states, enforced at compile
//! time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Unique identifier for a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SchedulerId(pub Uuid);

impl std::fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for SchedulerId {
    fn from(uuid: Uuid) -> Self {
        SchedulerId(uuid)
    }
}

impl std::ops::Deref for SchedulerId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Marker trait for valid scheduler states.
pub trait SchedulerState: Send + Sync {}

/// A scheduler instance in the greenlight system.
///
/// Uses the typestate pattern to ensure type-safe state transitions.
/// The generic parameter `T` represents the current state of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerRecord<T: SchedulerState> {
    /// The current state of the scheduler.
    pub state: T,
    /// The scheduler metadata.
    pub data: SchedulerData,
}

/// Immutable scheduler metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerData {
    /// Unique identifier for this scheduler instance.
    pub id: SchedulerId,
    /// Hostname where the scheduler is running.
    pub hostname: String,
    /// Process ID of the scheduler.
    pub pid: i32,
    /// Version string (e.g., git commit hash or semver).
    pub version: String,
    /// Snapshot of scheduler configuration (for audit trail).
    pub config_snapshot: serde_json::Value,
}

// ============================================================================
// Scheduler States
// ============================================================================

/// Scheduler is initializing (registered but not yet polling).
#[derive(Debug, Clone, Serialize)]
pub struct Initializing {
    pub started_at: DateTime<Utc>,
}

impl SchedulerState for Initializing {}

/// Scheduler is actively polling deadlines and draining jobs.
#[derive(Debug, Clone, Serialize)]
pub struct Running {
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub stats: SchedulerStats,
}

impl SchedulerState for Running {}

/// Scheduler has shut down (terminal state).
#[derive(Debug, Clone, Serialize)]
pub struct Dead {
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub final_stats: SchedulerStats,
}

impl SchedulerState for Dead {}

/// Statistics tracked for each scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// Requests auto-accepted on an elapsed deadline.
    pub requests_accepted: u64,
    /// Diff jobs completed successfully.
    pub jobs_processed: u64,
    /// Diff jobs that exhausted their retries.
    pub jobs_failed: u64,
}

// ============================================================================
// Unified Scheduler Representation
// ============================================================================

/// Enum that can hold a scheduler record in any state.
///
/// This is used for storage and introspection where we need to handle
/// schedulers uniformly regardless of their current state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "scheduler")]
pub enum AnySchedulerRecord {
    Initializing(SchedulerRecord<Initializing>),
    Running(SchedulerRecord<Running>),
    Dead(SchedulerRecord<Dead>),
}

impl AnySchedulerRecord {
    /// Get the scheduler ID regardless of state.
    pub fn id(&self) -> SchedulerId {
        match self {
            AnySchedulerRecord::Initializing(s) => s.data.id,
            AnySchedulerRecord::Running(s) => s.data.id,
            AnySchedulerRecord::Dead(s) => s.data.id,
        }
    }

    /// Check if this scheduler is in a terminal state (Dead).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnySchedulerRecord::Dead(_))
    }

    /// Get the scheduler status enum.
    pub fn status(&self) -> SchedulerStatus {
        match self {
            AnySchedulerRecord::Initializing(_) => SchedulerStatus::Initializing,
            AnySchedulerRecord::Running(_) => SchedulerStatus::Running,
            AnySchedulerRecord::Dead(_) => SchedulerStatus::Dead,
        }
    }
}

/// Scheduler status enum for filtering queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Initializing,
    Running,
    Dead,
}

impl SchedulerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStatus::Initializing => "initializing",
            SchedulerStatus::Running => "running",
            SchedulerStatus::Dead => "dead",
        }
    }
}

impl std::str::FromStr for SchedulerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SchedulerStatus::Initializing),
            "running" => Ok(SchedulerStatus::Running),
            "dead" => Ok(SchedulerStatus::Dead),
            _ => Err(format!("Invalid scheduler status: {}", s)),
        }
    }
}

// Conversion traits for going from typed SchedulerRecord to AnySchedulerRecord

impl From<SchedulerRecord<Initializing>> for AnySchedulerRecord {
    fn from(s: SchedulerRecord<Initializing>) -> Self {
        AnySchedulerRecord::Initializing(s)
    }
}

impl From<SchedulerRecord<Running>> for AnySchedulerRecord {
    fn from(s: SchedulerRecord<Running>) -> Self {
        AnySchedulerRecord::Running(s)
    }
}

impl From<SchedulerRecord<Dead>> for AnySchedulerRecord {
    fn from(s: SchedulerRecord<Dead>) -> Self {
        AnySchedulerRecord::Dead(s)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Get the current hostname.
pub fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Get the current process ID.
pub fn get_pid() -> i32 {
    std::process::id() as i32
}

/// Get a version string (currently the crate version, can be replaced with a git hash).
pub fn get_version() -> String {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .unwrap_or("dev")
        .to_string()
}
