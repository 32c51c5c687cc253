//! Permission predicates for workflow transitions.
//!
//! Each predicate is a pure function over an actor's pre-fetched `Grants`
//! snapshot and the loaded aggregate, so it can run speculatively before any
//! mutation and be unit-tested without the state machine. A failing predicate
//! produces `Forbidden` naming the specific unmet requirement.

use crate::engine::commands::{Command, RequestedState};
use crate::error::{GreenlightError, Result};
use crate::request::types::{Request, ReviewerRef};

/// Snapshot of everything the authorization collaborator said about one actor
/// and one request. Index-aligned with `request.actions` / `request.reviews`.
#[derive(Debug, Clone, Default)]
pub struct Grants {
    pub is_admin: bool,
    pub is_requester: bool,
    /// Write capability per action target
    pub writable_targets: Vec<bool>,
    /// Maintain capability per action target
    pub maintained_targets: Vec<bool>,
    /// Approve capability on every action target
    pub can_approve: bool,
    /// Whether the actor matches each review's assignee
    pub assignee_of: Vec<bool>,
}

impl Grants {
    fn maintains_any_target(&self) -> bool {
        self.maintained_targets.iter().any(|&m| m)
    }
}

/// Check the guard for `command` against `request`.
pub fn check(grants: &Grants, request: &Request, command: &Command) -> Result<()> {
    match command {
        Command::ChangeState { state, .. } => check_change_state(grants, request, *state),
        Command::AddReview { .. } => check_add_review(grants, request),
        Command::AssignReview { from, .. } => check_assign_review(grants, request, from),
        Command::ChangeReviewState { reviewer, .. } => {
            check_change_review_state(grants, request, reviewer)
        }
        Command::SetPriority { .. } | Command::SetIncident { .. } | Command::SetAcceptAt { .. } => {
            check_maintainer_or_admin(grants, request, command.name())
        }
        Command::Approve | Command::CancelApproval => check_approval(grants, request),
    }
}

fn check_change_state(grants: &Grants, request: &Request, state: RequestedState) -> Result<()> {
    match state {
        RequestedState::Accepted => {
            for (index, writable) in grants.writable_targets.iter().enumerate() {
                if !writable {
                    return Err(GreenlightError::Forbidden(format!(
                        "no write permission on target {} of request {}",
                        request.actions[index].target, request.number
                    )));
                }
            }
            if request.has_open_reviews() {
                return Err(GreenlightError::Forbidden(format!(
                    "request {} has {} open review(s)",
                    request.number,
                    request.open_review_count()
                )));
            }
            Ok(())
        }
        RequestedState::Declined => {
            if grants.is_admin || grants.maintains_any_target() {
                Ok(())
            } else {
                Err(GreenlightError::Forbidden(format!(
                    "declining request {} requires maintainership of a target",
                    request.number
                )))
            }
        }
        RequestedState::Revoked => {
            if grants.is_admin || grants.is_requester {
                Ok(())
            } else {
                Err(GreenlightError::Forbidden(format!(
                    "only the creator may revoke request {}",
                    request.number
                )))
            }
        }
        RequestedState::Superseded => {
            if grants.is_admin || grants.is_requester || grants.maintains_any_target() {
                Ok(())
            } else {
                Err(GreenlightError::Forbidden(format!(
                    "superseding request {} requires being its creator or a target maintainer",
                    request.number
                )))
            }
        }
    }
}

fn check_add_review(grants: &Grants, request: &Request) -> Result<()> {
    if grants.is_admin || grants.is_requester || grants.maintains_any_target() {
        Ok(())
    } else {
        Err(GreenlightError::Forbidden(format!(
            "adding a review to request {} requires being its creator or a target maintainer",
            request.number
        )))
    }
}

fn check_assign_review(grants: &Grants, request: &Request, from: &ReviewerRef) -> Result<()> {
    if grants.is_admin || grants.maintains_any_target() {
        return Ok(());
    }
    match request.find_open_review(from) {
        Some(index) if grants.assignee_of.get(index).copied().unwrap_or(false) => Ok(()),
        Some(index) => Err(GreenlightError::Forbidden(format!(
            "not the assignee of review {} of request {}",
            index, request.number
        ))),
        // Existence is checked before the guard; an absent review here means
        // the actor holds no claim on it either.
        None => Err(GreenlightError::Forbidden(format!(
            "no open review for {} on request {}",
            from, request.number
        ))),
    }
}

fn check_change_review_state(
    grants: &Grants,
    request: &Request,
    reviewer: &ReviewerRef,
) -> Result<()> {
    match request.find_open_review(reviewer) {
        Some(index) if grants.assignee_of.get(index).copied().unwrap_or(false) => Ok(()),
        Some(index) => Err(GreenlightError::Forbidden(format!(
            "not the assignee of review {} of request {}",
            index, request.number
        ))),
        None => Err(GreenlightError::Forbidden(format!(
            "no open review for {} on request {}",
            reviewer, request.number
        ))),
    }
}

fn check_maintainer_or_admin(grants: &Grants, request: &Request, command: &str) -> Result<()> {
    if grants.is_admin || grants.maintains_any_target() {
        Ok(())
    } else {
        Err(GreenlightError::Forbidden(format!(
            "'{}' on request {} requires maintainership of a target",
            command, request.number
        )))
    }
}

fn check_approval(grants: &Grants, request: &Request) -> Result<()> {
    if grants.is_admin || grants.can_approve {
        Ok(())
    } else {
        Err(GreenlightError::Forbidden(format!(
            "approving request {} requires approval rights on every target",
            request.number
        )))
    }
}
