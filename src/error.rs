//! Error types for the request/review workflow engine.

use thiserror::Error;

use crate::request::types::RequestNumber;

/// Result type alias using the greenlight error type.
pub type Result<T> = std::result::Result<T, GreenlightError>;

/// Main error type for the workflow engine.
#[derive(Error, Debug)]
pub enum GreenlightError {
    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestNumber),

    /// Some other referenced entity (review, action, superseded request) is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Command is not legal in the request's current state
    #[error("Invalid state transition: request {0} is in state '{1}', command '{2}' is not allowed")]
    InvalidStateTransition(RequestNumber, String, String),

    /// Command name not recognized at the transport boundary
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// Validation error (e.g., empty action list, malformed action/review data)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A permission predicate failed; the message names the unmet requirement
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unscoped collection query
    #[error(
        "This call requires at least one filter, either by user, group, project, package, states, types, review states or ids"
    )]
    MissingFilter,

    /// Optimistic-concurrency conflict; reload and retry
    #[error("Concurrent modification of request {0}")]
    ConcurrentModification(RequestNumber),

    /// Scheduler is shutting down
    #[error("Scheduler is shutting down")]
    Shutdown,

    /// Diff backend call failed
    #[error("Diff backend request failed: {0}")]
    DiffBackend(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Helper functions for serializing and deserializing errors to/from JSON.
///
/// These are used to store error information in a structured format, e.g. for
/// background-job failure records that outlive the original error value.
pub mod error_serialization {
    use anyhow::Error;
    use serde::{Deserialize, Serialize};

    /// Serialized error format that preserves error message and source chain.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SerializedError {
        /// The main error message
        pub message: String,
        /// Chain of source errors, if any
        pub sources: Vec<String>,
    }

    /// Serializes an anyhow::Error to a JSON string.
    ///
    /// Preserves the error message and the chain of source errors.
    pub fn serialize_error(error: &Error) -> String {
        let serialized = SerializedError {
            message: error.to_string(),
            sources: error.chain().skip(1).map(|e| e.to_string()).collect(),
        };
        serde_json::to_string(&serialized).unwrap_or_else(|_| {
            format!(
                r#"{{"message":"{}","sources":[]}}"#,
                error.to_string().replace('"', "\\\"")
            )
        })
    }

    /// Deserializes an error from a JSON string.
    ///
    /// Returns an anyhow::Error with the original message.
    pub fn deserialize_error(json: &str) -> Error {
        match serde_json::from_str::<SerializedError>(json) {
            Ok(serialized) => {
                let mut error_msg = serialized.message;
                if !serialized.sources.is_empty() {
                    error_msg.push_str("\nCaused by:\n");
                    for (i, source) in serialized.sources.iter().enumerate() {
                        error_msg.push_str(&format!("  {}: {}\n", i + 1, source));
                    }
                }
                anyhow::anyhow!(error_msg)
            }
            Err(_) => {
                // Fallback: treat the entire string as an error message
                anyhow::anyhow!("Deserialization failed: {}", json)
            }
        }
    }

}
