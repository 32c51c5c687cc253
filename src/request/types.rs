//! Core types for the request/review workflow.
//!
//! A `Request` is the aggregate root: an ordered list of proposed actions, an
//! ordered list of review checkpoints, and a lifecycle state. State changes
//! happen exclusively through the workflow engine; these types carry the data
//! and the small invariant-free accessors the engine builds on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a user, as known to the surrounding build service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Identity used for engine-driven transitions (auto-acceptance) that are
    /// not performed by a specific user.
    pub fn system() -> Self {
        UserId("_system".to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(s)
    }
}

/// Identity of a reviewer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        GroupId(s.to_string())
    }
}

/// Unique, immutable, monotonically assigned request identifier.
///
/// Numbers are only ever produced by `Storage::next_number`; the engine never
/// generates them itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestNumber(pub u64);

impl std::fmt::Display for RequestNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestNumber {
    fn from(n: u64) -> Self {
        RequestNumber(n)
    }
}

impl std::ops::Deref for RequestNumber {
    type Target = u64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    New,
    Review,
    Declined,
    Revoked,
    Accepted,
    Superseded,
    Deleted,
}

impl RequestState {
    /// Terminal states admit no further mutating command.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::New | RequestState::Review)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::New => "new",
            RequestState::Review => "review",
            RequestState::Declined => "declined",
            RequestState::Revoked => "revoked",
            RequestState::Accepted => "accepted",
            RequestState::Superseded => "superseded",
            RequestState::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(RequestState::New),
            "review" => Ok(RequestState::Review),
            "declined" => Ok(RequestState::Declined),
            "revoked" => Ok(RequestState::Revoked),
            "accepted" => Ok(RequestState::Accepted),
            "superseded" => Ok(RequestState::Superseded),
            "deleted" => Ok(RequestState::Deleted),
            _ => Err(format!("Invalid request state: {}", s)),
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request priority, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Moderate,
    Important,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Moderate => "moderate",
            Priority::Important => "important",
            Priority::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "moderate" => Ok(Priority::Moderate),
            "important" => Ok(Priority::Important),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// The kind of change an action proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Submit,
    Delete,
    ChangeDevel,
    MaintenanceIncident,
    MaintenanceRelease,
    Group,
    SetBugowner,
}

impl ActionKind {
    /// Whether an action of this kind must name a source coordinate.
    pub fn requires_source(&self) -> bool {
        matches!(
            self,
            ActionKind::Submit
                | ActionKind::ChangeDevel
                | ActionKind::MaintenanceIncident
                | ActionKind::MaintenanceRelease
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Submit => "submit",
            ActionKind::Delete => "delete",
            ActionKind::ChangeDevel => "change_devel",
            ActionKind::MaintenanceIncident => "maintenance_incident",
            ActionKind::MaintenanceRelease => "maintenance_release",
            ActionKind::Group => "group",
            ActionKind::SetBugowner => "set_bugowner",
        }
    }
}

/// A project/package coordinate, optionally pinned to a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

impl Coordinate {
    pub fn project(project: impl Into<String>) -> Self {
        Coordinate {
            project: project.into(),
            package: None,
            rev: None,
        }
    }

    pub fn package(project: impl Into<String>, package: impl Into<String>) -> Self {
        Coordinate {
            project: project.into(),
            package: Some(package.into()),
            rev: None,
        }
    }

    /// Same project/package location, ignoring the pinned revision.
    pub fn same_location(&self, other: &Coordinate) -> bool {
        self.project == other.project && self.package == other.package
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.package {
            Some(pkg) => write!(f, "{}/{}", self.project, pkg),
            None => write!(f, "{}", self.project),
        }
    }
}

/// Revision identifiers recorded when an action is applied on acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptInfo {
    /// Resulting revision in the target
    pub rev: String,
    /// Checksum of the accepted source
    pub srcmd5: String,
    /// Origin project, when the application relocated content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oproject: Option<String>,
    /// Origin package, when the application relocated content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opackage: Option<String>,
}

/// A single proposed change, owned by exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// Absent only for kinds that permit a missing source (delete, group, set_bugowner)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Coordinate>,
    pub target: Coordinate,
    /// Populated only once the owning request reaches `accepted`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_info: Option<AcceptInfo>,
}

// ============================================================================
// Reviews
// ============================================================================

/// State of a single review checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    New,
    Accepted,
    Declined,
    Superseded,
    Revoked,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::New => "new",
            ReviewState::Accepted => "accepted",
            ReviewState::Declined => "declined",
            ReviewState::Superseded => "superseded",
            ReviewState::Revoked => "revoked",
        }
    }
}

impl std::str::FromStr for ReviewState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ReviewState::New),
            "accepted" => Ok(ReviewState::Accepted),
            "declined" => Ok(ReviewState::Declined),
            "superseded" => Ok(ReviewState::Superseded),
            "revoked" => Ok(ReviewState::Revoked),
            _ => Err(format!("Invalid review state: {}", s)),
        }
    }
}

/// The party a review is assigned to. Exactly one kind per review.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerRef {
    User(UserId),
    Group(GroupId),
    Project(String),
    Package { project: String, package: String },
}

impl std::fmt::Display for ReviewerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewerRef::User(u) => write!(f, "user {}", u),
            ReviewerRef::Group(g) => write!(f, "group {}", g),
            ReviewerRef::Project(p) => write!(f, "project {}", p),
            ReviewerRef::Package { project, package } => {
                write!(f, "package {}/{}", project, package)
            }
        }
    }
}

/// One entry in a review's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewHistoryElement {
    pub who: UserId,
    pub state: ReviewState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

/// An approval checkpoint, owned by exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub state: ReviewState,
    pub reviewer: ReviewerRef,
    /// Who requested this review
    pub requested_by: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Full state history, in audit order
    pub history: Vec<ReviewHistoryElement>,
}

impl Review {
    /// A fresh open review, with the opening entry already in the audit trail.
    pub fn open(reviewer: ReviewerRef, requested_by: UserId, reason: Option<String>) -> Self {
        let now = Utc::now();
        Review {
            state: ReviewState::New,
            reviewer,
            requested_by: requested_by.clone(),
            reason: reason.clone(),
            created_at: now,
            history: vec![ReviewHistoryElement {
                who: requested_by,
                state: ReviewState::New,
                comment: reason,
                at: now,
            }],
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ReviewState::New
    }

    /// Resolve this review to a new state, appending to the audit trail.
    pub fn resolve(&mut self, state: ReviewState, who: UserId, comment: Option<String>) {
        self.state = state;
        self.history.push(ReviewHistoryElement {
            who,
            state,
            comment,
            at: Utc::now(),
        });
    }
}

// ============================================================================
// Request aggregate
// ============================================================================

/// Record of a pre-approval (`approve` command).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub who: UserId,
    pub approved_at: DateTime<Utc>,
}

/// The aggregate root: a reviewable, stateful proposed change.
///
/// Mutated exclusively through `RequestManager` commands; constructing one
/// directly bypasses every invariant the engine enforces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub number: RequestNumber,
    pub state: RequestState,
    pub creator: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    /// When set and elapsed with no open reviews, the scheduler auto-accepts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_at: Option<DateTime<Utc>>,
    /// Pre-approval flag; independent of `state`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<Approval>,
    /// The request that replaced this one, once superseded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<RequestNumber>,
    /// Ordered: actions apply in sequence on acceptance
    pub actions: Vec<Action>,
    /// Ordered: insertion order is audit order
    pub reviews: Vec<Review>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Whether any review still blocks acceptance.
    pub fn has_open_reviews(&self) -> bool {
        self.reviews.iter().any(Review::is_open)
    }

    pub fn open_review_count(&self) -> usize {
        self.reviews.iter().filter(|r| r.is_open()).count()
    }

    /// Index of the open review assigned to `reviewer`, if any.
    pub fn find_open_review(&self, reviewer: &ReviewerRef) -> Option<usize> {
        self.reviews
            .iter()
            .position(|r| r.is_open() && r.reviewer == *reviewer)
    }

    /// The action of this request proposing the same kind of change against
    /// the same target location as `action`. Used to pick diff operands when
    /// comparing against a superseded predecessor.
    pub fn find_action_with_same_target(&self, action: &Action) -> Option<&Action> {
        self.actions
            .iter()
            .find(|a| a.kind == action.kind && a.target.same_location(&action.target))
    }
}
