//! Source service collaborator.
//!
//! The build service the requests govern: target existence checks at creation
//! time, maintenance-incident lookups for `setincident`, and the actual
//! application of actions when a request is accepted. The engine only selects
//! what to apply and in which order; the source-control work happens here.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::request::types::{AcceptInfo, Action, Coordinate};

/// Interface to the surrounding build service's project/package store.
#[async_trait]
pub trait SourceService: Send + Sync {
    /// Whether the project exists.
    async fn project_exists(&self, project: &str) -> Result<bool>;

    /// Whether the package exists in the project.
    async fn package_exists(&self, project: &str, package: &str) -> Result<bool>;

    /// Whether the project is a maintenance incident.
    async fn is_maintenance_incident(&self, project: &str) -> Result<bool>;

    /// Apply an accepted action to its target, returning the resulting
    /// revision identifiers. Invoked only during acceptance, in action order.
    async fn apply_action(&self, action: &Action) -> Result<AcceptInfo>;
}

/// Record of a call made to the mock source service.
#[derive(Debug, Clone)]
pub struct AppliedAction {
    pub kind: &'static str,
    pub target: Coordinate,
}

/// Mock source service for testing.
///
/// Projects and packages are registered up front; `apply_action` hands back
/// deterministic revision identifiers and records the call.
#[derive(Clone, Default)]
pub struct MockSourceService {
    projects: Arc<Mutex<HashSet<String>>>,
    packages: Arc<Mutex<HashSet<(String, String)>>>,
    incidents: Arc<Mutex<HashSet<String>>>,
    applied: Arc<Mutex<Vec<AppliedAction>>>,
    fail_apply: Arc<Mutex<bool>>,
}

impl MockSourceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, project: &str) -> Self {
        self.projects.lock().insert(project.to_string());
        self
    }

    pub fn with_package(self, project: &str, package: &str) -> Self {
        self.projects.lock().insert(project.to_string());
        self.packages
            .lock()
            .insert((project.to_string(), package.to_string()));
        self
    }

    pub fn with_incident(self, project: &str) -> Self {
        self.projects.lock().insert(project.to_string());
        self.incidents.lock().insert(project.to_string());
        self
    }

    /// Make every subsequent `apply_action` fail.
    pub fn fail_applications(&self, fail: bool) {
        *self.fail_apply.lock() = fail;
    }

    /// Get all actions that have been applied through this mock.
    pub fn applied(&self) -> Vec<AppliedAction> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl SourceService for MockSourceService {
    async fn project_exists(&self, project: &str) -> Result<bool> {
        Ok(self.projects.lock().contains(project))
    }

    async fn package_exists(&self, project: &str, package: &str) -> Result<bool> {
        Ok(self
            .packages
            .lock()
            .contains(&(project.to_string(), package.to_string())))
    }

    async fn is_maintenance_incident(&self, project: &str) -> Result<bool> {
        Ok(self.incidents.lock().contains(project))
    }

    async fn apply_action(&self, action: &Action) -> Result<AcceptInfo> {
        if *self.fail_apply.lock() {
            return Err(crate::error::GreenlightError::Other(anyhow::anyhow!(
                "source backend rejected application to {}",
                action.target
            )));
        }
        let mut applied = self.applied.lock();
        applied.push(AppliedAction {
            kind: action.kind.as_str(),
            target: action.target.clone(),
        });
        Ok(AcceptInfo {
            rev: applied.len().to_string(),
            srcmd5: format!("{:032x}", applied.len()),
            oproject: action.source.as_ref().map(|s| s.project.clone()),
            opackage: action.source.as_ref().and_then(|s| s.package.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::types::ActionKind;

    #[tokio::test]
    async fn test_mock_registration_and_application() {
        let sources = MockSourceService::new()
            .with_package("proj", "pkg")
            .with_incident("proj:maintenance:1");

        assert!(sources.project_exists("proj").await.unwrap());
        assert!(!sources.project_exists("other").await.unwrap());
        assert!(sources.package_exists("proj", "pkg").await.unwrap());
        assert!(
            sources
                .is_maintenance_incident("proj:maintenance:1")
                .await
                .unwrap()
        );
        assert!(!sources.is_maintenance_incident("proj").await.unwrap());

        let action = Action {
            kind: ActionKind::Submit,
            source: Some(Coordinate::package("home:alice", "pkg")),
            target: Coordinate::package("proj", "pkg"),
            accept_info: None,
        };
        let info = sources.apply_action(&action).await.unwrap();
        assert_eq!(info.rev, "1");
        assert_eq!(info.oproject.as_deref(), Some("home:alice"));
        assert_eq!(sources.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_mode() {
        let sources = MockSourceService::new().with_project("proj");
        sources.fail_applications(true);

        let action = Action {
            kind: ActionKind::Delete,
            source: None,
            target: Coordinate::project("proj"),
            accept_info: None,
        };
        assert!(sources.apply_action(&action).await.is_err());
        assert!(sources.applied().is_empty());
    }
}
