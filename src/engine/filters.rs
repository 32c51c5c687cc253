//! Collection query filters.
//!
//! A filter must scope the query along at least one dimension; unscoped scans
//! over the whole collection are rejected with `MissingFilter`. Values within
//! one dimension are OR-combined, dimensions are AND-combined.

use serde::{Deserialize, Serialize};

use crate::request::types::{
    ActionKind, GroupId, Request, RequestNumber, RequestState, ReviewState, ReviewerRef, UserId,
};

/// Relation between a user and a request, for the `user` filter dimension.
///
/// `Creator` and `Reviewer` are resolved structurally from the aggregate.
/// `Maintainer`, `Bugowner`, `Downloader` and `Reader` require role storage
/// and are resolved only by storage implementations that have it; the
/// in-memory store matches nothing for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterRole {
    Creator,
    Maintainer,
    Bugowner,
    Reviewer,
    Downloader,
    Reader,
}

/// Filter set for the collection query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestFilter {
    /// Match requests this user relates to, in the given roles
    pub user: Option<UserId>,
    /// Roles for the `user` dimension; empty means creator + reviewer
    pub roles: Vec<FilterRole>,
    /// Match requests with a review assigned to this group
    pub group: Option<GroupId>,
    /// Match requests touching this project
    pub project: Option<String>,
    /// Match requests touching this package (within `project` when both set)
    pub package: Option<String>,
    pub states: Vec<RequestState>,
    pub kinds: Vec<ActionKind>,
    pub review_states: Vec<ReviewState>,
    pub ids: Vec<RequestNumber>,
    /// Truncate the result; ordering under limit is an unspecified contract
    pub limit: Option<usize>,
}

impl RequestFilter {
    /// Whether no scoping dimension is set. `roles` and `limit` alone do not
    /// scope a query.
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.group.is_none()
            && self.project.is_none()
            && self.package.is_none()
            && self.states.is_empty()
            && self.kinds.is_empty()
            && self.review_states.is_empty()
            && self.ids.is_empty()
    }

    /// Whether `request` matches every provided dimension.
    pub fn matches(&self, request: &Request) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&request.number) {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&request.state) {
            return false;
        }
        if !self.kinds.is_empty()
            && !request.actions.iter().any(|a| self.kinds.contains(&a.kind))
        {
            return false;
        }
        if !self.review_states.is_empty()
            && !request
                .reviews
                .iter()
                .any(|r| self.review_states.contains(&r.state))
        {
            return false;
        }
        if let Some(project) = &self.project {
            if !self.matches_project(request, project) {
                return false;
            }
        }
        if let Some(package) = &self.package {
            if !self.matches_package(request, package) {
                return false;
            }
        }
        if let Some(group) = &self.group {
            if !request
                .reviews
                .iter()
                .any(|r| r.reviewer == ReviewerRef::Group(group.clone()))
            {
                return false;
            }
        }
        if let Some(user) = &self.user {
            if !self.matches_user(request, user) {
                return false;
            }
        }
        true
    }

    fn matches_project(&self, request: &Request, project: &str) -> bool {
        let in_actions = request.actions.iter().any(|a| {
            a.target.project == project
                || a.source.as_ref().is_some_and(|s| s.project == project)
        });
        let in_reviews = request.reviews.iter().any(|r| match &r.reviewer {
            ReviewerRef::Project(p) => p == project,
            ReviewerRef::Package { project: p, .. } => p == project,
            _ => false,
        });
        in_actions || in_reviews
    }

    fn matches_package(&self, request: &Request, package: &str) -> bool {
        let project = self.project.as_deref();
        let coord_matches = |p: &str, pkg: Option<&str>| {
            pkg == Some(package) && project.is_none_or(|want| want == p)
        };
        let in_actions = request.actions.iter().any(|a| {
            coord_matches(&a.target.project, a.target.package.as_deref())
                || a.source
                    .as_ref()
                    .is_some_and(|s| coord_matches(&s.project, s.package.as_deref()))
        });
        let in_reviews = request.reviews.iter().any(|r| match &r.reviewer {
            ReviewerRef::Package {
                project: p,
                package: pkg,
            } => coord_matches(p, Some(pkg)),
            _ => false,
        });
        in_actions || in_reviews
    }

    fn matches_user(&self, request: &Request, user: &UserId) -> bool {
        let roles: &[FilterRole] = if self.roles.is_empty() {
            &[FilterRole::Creator, FilterRole::Reviewer]
        } else {
            &self.roles
        };
        roles.iter().any(|role| match role {
            FilterRole::Creator => request.creator == *user,
            FilterRole::Reviewer => request
                .reviews
                .iter()
                .any(|r| r.reviewer == ReviewerRef::User(user.clone())),
            // Needs role storage; see type-level docs.
            FilterRole::Maintainer
            | FilterRole::Bugowner
            | FilterRole::Downloader
            | FilterRole::Reader => false,
        })
    }
}
