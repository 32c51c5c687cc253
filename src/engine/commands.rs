//! The closed set of per-request commands.
//!
//! Dispatch inside the engine is a pattern match over this union; command
//! names as strings exist only at the transport boundary, where `parse` turns
//! an inbound `cmd` string plus parameters into a typed variant or an
//! `UnknownCommand` error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GreenlightError, Result};
use crate::request::types::{Priority, RequestNumber, ReviewState, ReviewerRef, UserId};

/// Target of a `changestate` command. Only the four caller-reachable states
/// appear here; `new`/`review`/`deleted` are never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedState {
    Accepted,
    Declined,
    Revoked,
    Superseded,
}

impl RequestedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestedState::Accepted => "accepted",
            RequestedState::Declined => "declined",
            RequestedState::Revoked => "revoked",
            RequestedState::Superseded => "superseded",
        }
    }
}

/// Resolution of a review. A review can only be resolved to accepted or
/// declined by its assignee; the other review states are engine-internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewResolution {
    Accepted,
    Declined,
}

impl From<ReviewResolution> for ReviewState {
    fn from(resolution: ReviewResolution) -> Self {
        match resolution {
            ReviewResolution::Accepted => ReviewState::Accepted,
            ReviewResolution::Declined => ReviewState::Declined,
        }
    }
}

/// A per-request command with its typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Command {
    ChangeState {
        state: RequestedState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        /// Required when `state` is `superseded`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        superseded_by: Option<RequestNumber>,
    },
    AddReview {
        reviewer: ReviewerRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    AssignReview {
        /// The review being reassigned, identified by its current assignee
        from: ReviewerRef,
        /// The user taking it over
        to: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    ChangeReviewState {
        reviewer: ReviewerRef,
        new_state: ReviewResolution,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    SetPriority {
        priority: Priority,
    },
    SetIncident {
        incident_project: String,
    },
    SetAcceptAt {
        #[serde(default)]
        time: Option<DateTime<Utc>>,
    },
    Approve,
    CancelApproval,
}

/// Command names accepted at the transport boundary.
const COMMAND_NAMES: &[&str] = &[
    "changestate",
    "addreview",
    "assignreview",
    "changereviewstate",
    "setpriority",
    "setincident",
    "setacceptat",
    "approve",
    "cancelapproval",
];

impl Command {
    /// The wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ChangeState { .. } => "changestate",
            Command::AddReview { .. } => "addreview",
            Command::AssignReview { .. } => "assignreview",
            Command::ChangeReviewState { .. } => "changereviewstate",
            Command::SetPriority { .. } => "setpriority",
            Command::SetIncident { .. } => "setincident",
            Command::SetAcceptAt { .. } => "setacceptat",
            Command::Approve => "approve",
            Command::CancelApproval => "cancelapproval",
        }
    }

    /// Transport-boundary constructor: turn a command name and its JSON
    /// parameters into a typed command.
    ///
    /// # Errors
    /// `UnknownCommand` for names outside the closed set, `ValidationError`
    /// for malformed parameters.
    pub fn parse(name: &str, params: serde_json::Value) -> Result<Command> {
        if !COMMAND_NAMES.contains(&name) {
            return Err(GreenlightError::UnknownCommand(name.to_string()));
        }
        let mut tagged = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            _ => {
                return Err(GreenlightError::ValidationError(format!(
                    "parameters for '{}' must be an object",
                    name
                )));
            }
        };
        tagged.insert("cmd".to_string(), serde_json::Value::String(name.to_string()));
        serde_json::from_value(serde_json::Value::Object(tagged)).map_err(|e| {
            GreenlightError::ValidationError(format!("malformed parameters for '{}': {}", name, e))
        })
    }
}
