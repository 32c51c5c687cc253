//! Authorization collaborator.
//!
//! The engine never stores roles itself; every permission question is a single
//! allow/deny predicate answered by an `Authorizer` implementation backed by
//! whatever role storage the surrounding service uses.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::request::types::{Coordinate, GroupId, UserId};

/// What an actor wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Open a request against a target
    CreateFor,
    /// Apply changes to a target (required for acceptance)
    Write,
    /// Maintain a target (decline, add reviews, set priority, ...)
    Maintain,
    /// Pre-approve a request
    Approve,
    /// Full administrative access
    Administer,
    /// Membership in a group (used to match group reviews)
    Member,
}

/// Where the capability applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthScope {
    Project(String),
    Package { project: String, package: String },
    Group(GroupId),
    Global,
}

impl AuthScope {
    /// The scope covering an action target: package-level when the coordinate
    /// names a package, project-level otherwise.
    pub fn target(coordinate: &Coordinate) -> Self {
        match &coordinate.package {
            Some(package) => AuthScope::Package {
                project: coordinate.project.clone(),
                package: package.clone(),
            },
            None => AuthScope::Project(coordinate.project.clone()),
        }
    }
}

/// Authorization predicate over (actor, capability, scope).
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns whether `actor` holds `capability` in `scope`.
    async fn allows(&self, actor: &UserId, capability: Capability, scope: &AuthScope) -> bool;
}

/// Grant-table authorizer for tests and single-node deployments.
///
/// A project-level grant covers every package in that project, and a global
/// `Administer` grant covers everything.
#[derive(Default)]
pub struct StaticAuthorizer {
    grants: RwLock<HashMap<UserId, HashSet<(Capability, AuthScope)>>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a grant. Builder-style so test setups read as a grant table.
    pub fn grant(self, actor: impl Into<UserId>, capability: Capability, scope: AuthScope) -> Self {
        self.grants
            .write()
            .entry(actor.into())
            .or_default()
            .insert((capability, scope));
        self
    }

    /// Shorthand for a global administrator.
    pub fn admin(self, actor: impl Into<UserId>) -> Self {
        self.grant(actor, Capability::Administer, AuthScope::Global)
    }

    /// Shorthand granting the usual maintainer bundle (write/maintain/approve)
    /// on one scope.
    pub fn maintainer(self, actor: impl Into<UserId>, scope: AuthScope) -> Self {
        let actor = actor.into();
        self.grant(actor.clone(), Capability::Write, scope.clone())
            .grant(actor.clone(), Capability::Maintain, scope.clone())
            .grant(actor, Capability::Approve, scope)
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn allows(&self, actor: &UserId, capability: Capability, scope: &AuthScope) -> bool {
        let grants = self.grants.read();
        let Some(held) = grants.get(actor) else {
            return false;
        };
        if held.contains(&(Capability::Administer, AuthScope::Global)) {
            return true;
        }
        if held.contains(&(capability, scope.clone())) {
            return true;
        }
        // A project-level grant covers the project's packages.
        if let AuthScope::Package { project, .. } = scope {
            return held.contains(&(capability, AuthScope::Project(project.clone())));
        }
        false
    }
}
