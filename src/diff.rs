//! Diff backend abstraction and diff document assembly.
//!
//! The bytes of a diff are produced by an external backend; the engine's job
//! is only to select the correct comparison operands per action and merge the
//! results in action order. This module defines the `DiffBackend` trait, a
//! reqwest-based production client, and a mock for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::request::types::{Action, ActionKind, Coordinate, RequestNumber};

/// Output shape of a request diff, selected by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffFormat {
    /// Concatenated plain text, one action after another
    #[default]
    Text,
    /// One fragment per action, merged into a container document
    Structured,
}

/// Caller-selected options for a diff computation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffOptions {
    pub format: DiffFormat,
    /// Forward issue references from the backend
    pub with_issues: bool,
    /// Compare against the matching actions of this superseded predecessor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_to_superseded: Option<RequestNumber>,
}

/// One action's diff inside a structured document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDiff {
    pub index: usize,
    pub kind: ActionKind,
    pub target: Coordinate,
    pub diff: String,
}

/// Structured diff document for a whole request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDiff {
    pub number: RequestNumber,
    pub actions: Vec<ActionDiff>,
}

/// Result of a diff computation, in the caller-selected format.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DiffOutput {
    Text(String),
    Structured(RequestDiff),
}

impl DiffOutput {
    /// Merge per-action fragments in action order.
    pub fn merge(number: RequestNumber, format: DiffFormat, fragments: Vec<ActionDiff>) -> Self {
        match format {
            DiffFormat::Text => {
                let mut text = String::new();
                for fragment in &fragments {
                    text.push_str(&fragment.diff);
                }
                DiffOutput::Text(text)
            }
            DiffFormat::Structured => DiffOutput::Structured(RequestDiff {
                number,
                actions: fragments,
            }),
        }
    }
}

/// Trait for computing a single action's diff.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and keeps the engine's operand-selection logic testable without a
/// running backend. Backend calls may be slow; implementations take a timeout
/// and callers can drop the future to cancel.
#[async_trait]
pub trait DiffBackend: Send + Sync {
    /// Compute the diff for one action.
    ///
    /// # Arguments
    /// * `action` - The action to diff against its source
    /// * `with_issues` - Forward issue references in the diff
    /// * `superseded_action` - The matching action of a superseded
    ///   predecessor, when the caller asked for a comparison diff
    ///
    /// # Errors
    /// Returns an error if the backend call fails or times out.
    async fn source_diff(
        &self,
        action: &Action,
        with_issues: bool,
        superseded_action: Option<&Action>,
    ) -> Result<String>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Wire payload sent to the remote diff backend.
#[derive(Serialize)]
struct DiffRequestBody<'a> {
    action: &'a Action,
    with_issues: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    superseded_action: Option<&'a Action>,
}

/// Production diff backend talking to a remote diff service over HTTP.
#[derive(Clone)]
pub struct HttpDiffBackend {
    client: reqwest::Client,
    base_url: String,
    timeout_ms: u64,
}

impl HttpDiffBackend {
    /// Create a client for the backend at `base_url` with a 30s default timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout_ms: 30_000,
        }
    }

    /// Set a custom per-call timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[async_trait]
impl DiffBackend for HttpDiffBackend {
    #[tracing::instrument(skip(self, action, superseded_action), fields(kind = %action.kind.as_str(), target = %action.target))]
    async fn source_diff(
        &self,
        action: &Action,
        with_issues: bool,
        superseded_action: Option<&Action>,
    ) -> Result<String> {
        let url = format!("{}/diff", self.base_url);

        tracing::debug!(
            url = %url,
            timeout_ms = self.timeout_ms,
            with_issues = with_issues,
            "Requesting action diff"
        );

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&DiffRequestBody {
                action,
                with_issues,
                superseded_action,
            })
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url = %url, error = %e, "Diff backend request failed");
                e
            })?
            .error_for_status()?;

        let body = response.text().await?;

        tracing::debug!(diff_len = body.len(), "Diff backend request completed");

        Ok(body)
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Record of a call made to the mock diff backend.
#[derive(Debug, Clone)]
pub struct DiffCall {
    pub key: String,
    pub with_issues: bool,
    pub compared_against_superseded: bool,
}

/// Mock diff backend for testing.
///
/// Allows configuring predetermined diffs for specific targets without a
/// running backend. The key is formatted as "{kind} {target}"; multiple
/// responses per key are returned in FIFO order, and an optional fallback
/// covers everything else.
#[derive(Clone, Default)]
pub struct MockDiffBackend {
    responses: Arc<Mutex<HashMap<String, Vec<String>>>>,
    fallback: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<Vec<DiffCall>>>,
}

impl MockDiffBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(action: &Action) -> String {
        format!("{} {}", action.kind.as_str(), action.target)
    }

    /// Add a predetermined diff for a specific "{kind} {target}" key.
    pub fn add_diff(&self, key: &str, diff: impl Into<String>) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(diff.into());
    }

    /// Serve this diff for any key with no configured response.
    pub fn set_fallback(&self, diff: impl Into<String>) {
        *self.fallback.lock() = Some(diff.into());
    }

    /// Get all calls that have been made to this mock backend.
    pub fn get_calls(&self) -> Vec<DiffCall> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl DiffBackend for MockDiffBackend {
    async fn source_diff(
        &self,
        action: &Action,
        with_issues: bool,
        superseded_action: Option<&Action>,
    ) -> Result<String> {
        let key = Self::key(action);
        self.calls.lock().push(DiffCall {
            key: key.clone(),
            with_issues,
            compared_against_superseded: superseded_action.is_some(),
        });

        let queued = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        match queued.or_else(|| self.fallback.lock().clone()) {
            Some(diff) => Ok(diff),
            None => Err(crate::error::GreenlightError::Other(anyhow::anyhow!(
                "No mock diff configured for {}",
                key
            ))),
        }
    }
}
