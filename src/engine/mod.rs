//! The workflow engine.
//!
//! `RequestManager` is the only writer of request aggregates: it loads a
//! request, evaluates the pure permission predicates against a pre-fetched
//! grants snapshot, applies the transition to a copy, and commits it with
//! compare-and-set semantics. Side effects (notifications, diff pre-cache
//! jobs) fire only after the commit and never roll a transition back.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::authz::{AuthScope, Authorizer, Capability};
use crate::diff::{ActionDiff, DiffBackend, DiffOptions, DiffOutput};
use crate::error::{GreenlightError, Result};
use crate::jobs::{DiffJob, JobQueue};
use crate::notify::{Event, EventKind, Notifier};
use crate::request::types::{
    Action, ActionKind, Approval, Coordinate, Priority, Request, RequestNumber, RequestState,
    Review, ReviewState, ReviewerRef, UserId,
};
use crate::sources::SourceService;
use crate::storage::{Storage, Versioned};

pub mod commands;
pub mod filters;
pub mod permissions;

use commands::{Command, RequestedState, ReviewResolution};
use filters::RequestFilter;
use permissions::Grants;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum hops walked when checking a superseding chain for cycles
    pub max_supersede_chain: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_supersede_chain: 64,
        }
    }
}

/// One proposed action in a creation or update payload.
#[derive(Debug, Clone)]
pub struct ActionInput {
    pub kind: ActionKind,
    pub source: Option<Coordinate>,
    pub target: Coordinate,
}

/// Full representation submitted to `create` and `update`.
#[derive(Debug, Clone, Default)]
pub struct RequestInput {
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub actions: Vec<ActionInput>,
    /// Reviews requested up front, in addition to policy-assigned ones
    pub reviews: Vec<ReviewerRef>,
}

impl RequestInput {
    pub fn with_action(mut self, kind: ActionKind, source: Option<Coordinate>, target: Coordinate) -> Self {
        self.actions.push(ActionInput {
            kind,
            source,
            target,
        });
        self
    }

    pub fn with_review(mut self, reviewer: ReviewerRef) -> Self {
        self.reviews.push(reviewer);
        self
    }
}

/// The workflow engine over its collaborators.
pub struct RequestManager {
    storage: Arc<dyn Storage>,
    authz: Arc<dyn Authorizer>,
    sources: Arc<dyn SourceService>,
    diff_backend: Arc<dyn DiffBackend>,
    notifier: Arc<dyn Notifier>,
    jobs: Arc<dyn JobQueue>,
    config: EngineConfig,
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::GreenlightMetrics>,
}

impl RequestManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        authz: Arc<dyn Authorizer>,
        sources: Arc<dyn SourceService>,
        diff_backend: Arc<dyn DiffBackend>,
        notifier: Arc<dyn Notifier>,
        jobs: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            storage,
            authz,
            sources,
            diff_backend,
            notifier,
            jobs,
            config: EngineConfig::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Set a custom engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a metrics registry.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: crate::metrics::GreenlightMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The underlying request store.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a request from an inbound action list.
    ///
    /// Every action is validated before anything is persisted; either the
    /// whole command succeeds or no request exists afterwards. Reviews are
    /// auto-assigned for targets the creator cannot write to, and one diff
    /// pre-cache job per action is enqueued after the insert commits.
    #[tracing::instrument(skip(self, input), fields(actor = %actor, actions = input.actions.len()))]
    pub async fn create(&self, actor: &UserId, input: RequestInput) -> Result<Request> {
        if input.actions.is_empty() {
            return Err(GreenlightError::ValidationError(
                "a request must contain at least one action".to_string(),
            ));
        }
        self.validate_actions(&input.actions).await?;

        for action in &input.actions {
            let scope = AuthScope::target(&action.target);
            if !self.authz.allows(actor, Capability::CreateFor, &scope).await {
                return Err(GreenlightError::Forbidden(format!(
                    "not allowed to create requests for target {}",
                    action.target
                )));
            }
        }

        let mut reviews: Vec<Review> = input
            .reviews
            .iter()
            .cloned()
            .map(|reviewer| Review::open(reviewer, actor.clone(), None))
            .collect();

        // Policy: a target the creator cannot write to gets a maintainer
        // review at the most specific level the coordinate names.
        for action in &input.actions {
            let scope = AuthScope::target(&action.target);
            if self.authz.allows(actor, Capability::Write, &scope).await {
                continue;
            }
            let reviewer = match &action.target.package {
                Some(package) => ReviewerRef::Package {
                    project: action.target.project.clone(),
                    package: package.clone(),
                },
                None => ReviewerRef::Project(action.target.project.clone()),
            };
            if !reviews.iter().any(|r| r.reviewer == reviewer) {
                reviews.push(Review::open(
                    reviewer,
                    actor.clone(),
                    Some("target maintainer approval required".to_string()),
                ));
            }
        }

        let number = self.storage.next_number().await?;
        let now = Utc::now();
        let state = if reviews.is_empty() {
            RequestState::New
        } else {
            RequestState::Review
        };
        let request = Request {
            number,
            state,
            creator: actor.clone(),
            description: input.description,
            priority: input.priority.unwrap_or_default(),
            accept_at: None,
            approved_by: None,
            superseded_by: None,
            actions: input
                .actions
                .into_iter()
                .map(|a| Action {
                    kind: a.kind,
                    source: a.source,
                    target: a.target,
                    accept_info: None,
                })
                .collect(),
            reviews,
            created_at: now,
            updated_at: now,
        };

        let committed = self.storage.insert(request).await?;
        tracing::info!(number = %number, state = %committed.request.state, "Created request");

        self.notifier
            .publish(Event::new(
                EventKind::RequestCreated,
                number,
                actor.clone(),
                json!({
                    "state": committed.request.state,
                    "actions": committed.request.actions.len(),
                    "reviews": committed.request.reviews.len(),
                }),
            ))
            .await;

        // Diff pre-cache is best-effort; enqueue failures must not fail the
        // already-committed creation.
        for index in 0..committed.request.actions.len() {
            if let Err(e) = self.jobs.enqueue(DiffJob::new(number, index)).await {
                tracing::warn!(number = %number, action = index, error = %e, "Failed to enqueue diff job");
            }
        }

        Ok(committed.request)
    }

    async fn validate_actions(&self, actions: &[ActionInput]) -> Result<()> {
        for (index, action) in actions.iter().enumerate() {
            if action.kind.requires_source() && action.source.is_none() {
                return Err(GreenlightError::ValidationError(format!(
                    "action {} ({}) requires a source",
                    index,
                    action.kind.as_str()
                )));
            }
            if let Some(source) = &action.source {
                if !self.sources.project_exists(&source.project).await? {
                    return Err(GreenlightError::ValidationError(format!(
                        "source project {} does not exist",
                        source.project
                    )));
                }
                if let Some(package) = &source.package {
                    if !self.sources.package_exists(&source.project, package).await? {
                        return Err(GreenlightError::ValidationError(format!(
                            "source package {}/{} does not exist",
                            source.project, package
                        )));
                    }
                }
            }
            if !self.sources.project_exists(&action.target.project).await? {
                return Err(GreenlightError::ValidationError(format!(
                    "target project {} does not exist",
                    action.target.project
                )));
            }
            // Deleting something that is not there is malformed; submitting to
            // a package that does not exist yet is how packages get created.
            if action.kind == ActionKind::Delete {
                if let Some(package) = &action.target.package {
                    if !self
                        .sources
                        .package_exists(&action.target.project, package)
                        .await?
                    {
                        return Err(GreenlightError::ValidationError(format!(
                            "target package {}/{} does not exist",
                            action.target.project, package
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Command dispatch
    // ========================================================================

    /// Apply a command to a request on behalf of `actor`.
    ///
    /// Guards are evaluated against the loaded version and the new state is
    /// committed compare-and-set; `ConcurrentModification` means another
    /// command won the race and the caller may reload and retry.
    #[tracing::instrument(skip(self, command), fields(actor = %actor, number = %number, cmd = command.name()))]
    pub async fn command(
        &self,
        actor: &UserId,
        number: RequestNumber,
        command: Command,
    ) -> Result<Request> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let name = command.name();

        let result = self.command_inner(actor, number, command).await;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            metrics.observe_command(name, outcome, started.elapsed());
        }
        match &result {
            Ok(request) => {
                tracing::info!(number = %number, cmd = name, state = %request.state, "Command applied")
            }
            Err(e) => tracing::debug!(number = %number, cmd = name, error = %e, "Command rejected"),
        }
        result
    }

    async fn command_inner(
        &self,
        actor: &UserId,
        number: RequestNumber,
        command: Command,
    ) -> Result<Request> {
        let Versioned { request, version } = self.storage.load(number).await?;

        if request.state.is_terminal() {
            return Err(GreenlightError::InvalidStateTransition(
                number,
                request.state.as_str().to_string(),
                command.name().to_string(),
            ));
        }
        // Review manipulation only makes sense while the request is in review.
        if matches!(
            command,
            Command::ChangeReviewState { .. } | Command::AssignReview { .. }
        ) && request.state != RequestState::Review
        {
            return Err(GreenlightError::InvalidStateTransition(
                number,
                request.state.as_str().to_string(),
                command.name().to_string(),
            ));
        }
        // Referenced reviews must exist before the guard runs, so a missing
        // review is reported as such rather than as a permission failure.
        match &command {
            Command::ChangeReviewState { reviewer, .. } | Command::AssignReview { from: reviewer, .. } => {
                if request.find_open_review(reviewer).is_none() {
                    return Err(GreenlightError::NotFound(format!(
                        "no open review for {} on request {}",
                        reviewer, number
                    )));
                }
            }
            _ => {}
        }

        let grants = self.grants_for(actor, &request).await;
        permissions::check(&grants, &request, &command)?;

        let mut next = request.clone();
        let mut events = Vec::new();
        self.apply(actor, &mut next, &command, &mut events).await?;
        next.updated_at = Utc::now();

        #[cfg(feature = "metrics")]
        let from_state = request.state;

        let committed = self.storage.commit(next, version).await?;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            if committed.request.state != from_state {
                metrics.record_transition(from_state.as_str(), committed.request.state.as_str());
            }
        }

        for event in events {
            self.notifier.publish(event).await;
        }

        Ok(committed.request)
    }

    async fn apply(
        &self,
        actor: &UserId,
        next: &mut Request,
        command: &Command,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        match command {
            Command::ChangeState {
                state,
                comment,
                superseded_by,
            } => {
                self.apply_change_state(actor, next, *state, comment.clone(), *superseded_by, events)
                    .await
            }
            Command::AddReview { reviewer, comment } => {
                next.reviews
                    .push(Review::open(reviewer.clone(), actor.clone(), comment.clone()));
                next.state = RequestState::Review;
                events.push(Event::new(
                    EventKind::ReviewWanted,
                    next.number,
                    actor.clone(),
                    json!({ "reviewer": reviewer, "comment": comment }),
                ));
                Ok(())
            }
            Command::AssignReview { from, to, comment } => {
                let index = next
                    .find_open_review(from)
                    .expect("review existence checked before dispatch");
                next.reviews[index].resolve(
                    ReviewState::Superseded,
                    actor.clone(),
                    comment.clone(),
                );
                next.reviews.push(Review::open(
                    ReviewerRef::User(to.clone()),
                    actor.clone(),
                    comment.clone(),
                ));
                events.push(Event::new(
                    EventKind::ReviewChanged,
                    next.number,
                    actor.clone(),
                    json!({ "reassigned_from": from, "reassigned_to": to }),
                ));
                Ok(())
            }
            Command::ChangeReviewState {
                reviewer,
                new_state,
                comment,
            } => {
                self.apply_review_resolution(actor, next, reviewer, *new_state, comment.clone(), events)
                    .await
            }
            Command::SetPriority { priority } => {
                next.priority = *priority;
                events.push(Event::new(
                    EventKind::RequestChanged,
                    next.number,
                    actor.clone(),
                    json!({ "priority": priority }),
                ));
                Ok(())
            }
            Command::SetIncident { incident_project } => {
                self.apply_set_incident(actor, next, incident_project, events)
                    .await
            }
            Command::SetAcceptAt { time } => {
                next.accept_at = *time;
                events.push(Event::new(
                    EventKind::RequestChanged,
                    next.number,
                    actor.clone(),
                    json!({ "accept_at": time }),
                ));
                Ok(())
            }
            Command::Approve => {
                // Idempotent: a second approve is a no-op, not an error.
                if next.approved_by.is_none() {
                    next.approved_by = Some(Approval {
                        who: actor.clone(),
                        approved_at: Utc::now(),
                    });
                    events.push(Event::new(
                        EventKind::RequestChanged,
                        next.number,
                        actor.clone(),
                        json!({ "approved": true }),
                    ));
                }
                Ok(())
            }
            Command::CancelApproval => {
                if next.approved_by.take().is_some() {
                    events.push(Event::new(
                        EventKind::RequestChanged,
                        next.number,
                        actor.clone(),
                        json!({ "approved": false }),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn apply_change_state(
        &self,
        actor: &UserId,
        next: &mut Request,
        state: RequestedState,
        comment: Option<String>,
        superseded_by: Option<RequestNumber>,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let from = next.state;
        match state {
            RequestedState::Accepted => {
                self.accept(next).await?;
            }
            RequestedState::Declined => {
                next.state = RequestState::Declined;
            }
            RequestedState::Revoked => {
                next.state = RequestState::Revoked;
            }
            RequestedState::Superseded => {
                let other = superseded_by.ok_or_else(|| {
                    GreenlightError::ValidationError(
                        "changestate to superseded requires the superseded_by parameter"
                            .to_string(),
                    )
                })?;
                self.validate_superseding(next.number, other).await?;
                next.superseded_by = Some(other);
                next.state = RequestState::Superseded;
            }
        }
        events.push(Event::new(
            EventKind::RequestStateChanged,
            next.number,
            actor.clone(),
            json!({
                "from": from,
                "to": next.state,
                "comment": comment,
                "superseded_by": superseded_by,
            }),
        ));
        Ok(())
    }

    async fn apply_review_resolution(
        &self,
        actor: &UserId,
        next: &mut Request,
        reviewer: &ReviewerRef,
        resolution: ReviewResolution,
        comment: Option<String>,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let index = next
            .find_open_review(reviewer)
            .expect("review existence checked before dispatch");
        next.reviews[index].resolve(resolution.into(), actor.clone(), comment.clone());
        events.push(Event::new(
            EventKind::ReviewChanged,
            next.number,
            actor.clone(),
            json!({ "reviewer": reviewer, "new_state": resolution, "comment": comment }),
        ));

        match resolution {
            ReviewResolution::Declined => {
                // Any single decline blocks the whole request.
                let from = next.state;
                next.state = RequestState::Declined;
                events.push(Event::new(
                    EventKind::RequestStateChanged,
                    next.number,
                    actor.clone(),
                    json!({ "from": from, "to": next.state, "comment": comment }),
                ));
            }
            ReviewResolution::Accepted => {
                if next.has_open_reviews() {
                    return Ok(());
                }
                let deadline_pending = next
                    .accept_at
                    .is_some_and(|at| at > Utc::now());
                if deadline_pending {
                    // The scheduler fires once accept_at elapses.
                    return Ok(());
                }
                // Last open review resolved: attempt acceptance with system
                // authority. A failure leaves the request in review.
                let system_actor = next
                    .approved_by
                    .as_ref()
                    .map(|a| a.who.clone())
                    .unwrap_or_else(UserId::system);
                let from = next.state;
                match self.accept(next).await {
                    Ok(()) => {
                        events.push(Event::new(
                            EventKind::RequestStateChanged,
                            next.number,
                            system_actor,
                            json!({ "from": from, "to": next.state, "auto": true }),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(
                            number = %next.number,
                            error = %e,
                            "Auto-acceptance failed, request stays in review"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_set_incident(
        &self,
        actor: &UserId,
        next: &mut Request,
        incident_project: &str,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        if !self.sources.project_exists(incident_project).await? {
            return Err(GreenlightError::NotFound(format!(
                "incident project {} does not exist",
                incident_project
            )));
        }
        if !self.sources.is_maintenance_incident(incident_project).await? {
            return Err(GreenlightError::ValidationError(format!(
                "project {} is not a maintenance incident",
                incident_project
            )));
        }
        let mut repointed = 0;
        for action in &mut next.actions {
            if action.kind == ActionKind::MaintenanceIncident {
                action.target.project = incident_project.to_string();
                repointed += 1;
            }
        }
        if repointed == 0 {
            return Err(GreenlightError::ValidationError(format!(
                "request {} has no maintenance incident actions",
                next.number
            )));
        }
        events.push(Event::new(
            EventKind::RequestChanged,
            next.number,
            actor.clone(),
            json!({ "incident_project": incident_project, "actions": repointed }),
        ));
        Ok(())
    }

    /// Apply every action in order and record the acceptance. All-or-nothing:
    /// accept_info is only assigned once every application succeeded.
    async fn accept(&self, next: &mut Request) -> Result<()> {
        let mut infos = Vec::with_capacity(next.actions.len());
        for action in &next.actions {
            infos.push(self.sources.apply_action(action).await?);
        }
        for (action, info) in next.actions.iter_mut().zip(infos) {
            action.accept_info = Some(info);
        }
        next.state = RequestState::Accepted;
        Ok(())
    }

    /// Superseding must point at a distinct, existing request and must not
    /// close a cycle back to the request being superseded.
    async fn validate_superseding(&self, number: RequestNumber, other: RequestNumber) -> Result<()> {
        if other == number {
            return Err(GreenlightError::ValidationError(format!(
                "request {} cannot supersede itself",
                number
            )));
        }
        // Existence first, then walk the chain from the superseding request.
        let mut cursor = Some(self.storage.load(other).await?.request);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current.number == number {
                return Err(GreenlightError::ValidationError(format!(
                    "superseding request {} by {} would create a cycle",
                    number, other
                )));
            }
            hops += 1;
            if hops >= self.config.max_supersede_chain {
                break;
            }
            cursor = match current.superseded_by {
                Some(parent) => self.storage.load(parent).await.ok().map(|v| v.request),
                None => None,
            };
        }
        Ok(())
    }

    async fn grants_for(&self, actor: &UserId, request: &Request) -> Grants {
        let is_admin = self
            .authz
            .allows(actor, Capability::Administer, &AuthScope::Global)
            .await;
        let mut writable_targets = Vec::with_capacity(request.actions.len());
        let mut maintained_targets = Vec::with_capacity(request.actions.len());
        let mut can_approve = true;
        for action in &request.actions {
            let scope = AuthScope::target(&action.target);
            writable_targets.push(self.authz.allows(actor, Capability::Write, &scope).await);
            maintained_targets.push(self.authz.allows(actor, Capability::Maintain, &scope).await);
            can_approve &= self.authz.allows(actor, Capability::Approve, &scope).await;
        }
        let mut assignee_of = Vec::with_capacity(request.reviews.len());
        for review in &request.reviews {
            let is_assignee = match &review.reviewer {
                ReviewerRef::User(user) => user == actor,
                ReviewerRef::Group(group) => {
                    self.authz
                        .allows(actor, Capability::Member, &AuthScope::Group(group.clone()))
                        .await
                }
                ReviewerRef::Project(project) => {
                    self.authz
                        .allows(
                            actor,
                            Capability::Maintain,
                            &AuthScope::Project(project.clone()),
                        )
                        .await
                }
                ReviewerRef::Package { project, package } => {
                    self.authz
                        .allows(
                            actor,
                            Capability::Maintain,
                            &AuthScope::Package {
                                project: project.clone(),
                                package: package.clone(),
                            },
                        )
                        .await
                }
            };
            assignee_of.push(is_assignee);
        }
        Grants {
            is_admin,
            is_requester: request.creator == *actor,
            writable_targets,
            maintained_targets,
            can_approve,
            assignee_of,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Load one request.
    pub async fn show(&self, number: RequestNumber) -> Result<Request> {
        Ok(self.storage.load(number).await?.request)
    }

    /// List requests matching a filter. At least one dimension must be set.
    pub async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        if filter.is_empty() {
            return Err(GreenlightError::MissingFilter);
        }
        self.storage.list(filter).await
    }

    /// Bare numbers of matching requests, ascending.
    pub async fn list_numbers(&self, filter: &RequestFilter) -> Result<Vec<RequestNumber>> {
        Ok(self.list(filter).await?.iter().map(|r| r.number).collect())
    }

    // ========================================================================
    // Diff orchestration
    // ========================================================================

    /// Compute the diff for a request, optionally against the matching
    /// actions of a superseded predecessor.
    #[tracing::instrument(skip(self, options), fields(number = %number))]
    pub async fn diff(&self, number: RequestNumber, options: &DiffOptions) -> Result<DiffOutput> {
        let request = self.storage.load(number).await?.request;

        let superseded = match options.diff_to_superseded {
            Some(old_number) => {
                let old = self.storage.load(old_number).await.ok().map(|v| v.request);
                match old {
                    Some(old) if old.superseded_by == Some(number) => Some(old),
                    _ => {
                        return Err(GreenlightError::NotFound(format!(
                            "Request {} does not exist or is not superseded by request {}.",
                            old_number, number
                        )));
                    }
                }
            }
            None => None,
        };

        let mut fragments = Vec::with_capacity(request.actions.len());
        for (index, action) in request.actions.iter().enumerate() {
            let counterpart = superseded
                .as_ref()
                .and_then(|old| old.find_action_with_same_target(action));
            let diff = self
                .diff_backend
                .source_diff(action, options.with_issues, counterpart)
                .await?;
            fragments.push(ActionDiff {
                index,
                kind: action.kind,
                target: action.target.clone(),
                diff,
            });
        }
        Ok(DiffOutput::merge(number, options.format, fragments))
    }

    /// Warm the diff cache for one action. Called by the background worker.
    pub async fn prime_action_diff(&self, job: &DiffJob) -> Result<()> {
        let request = self.storage.load(job.number).await?.request;
        let action = request.actions.get(job.action_index).ok_or_else(|| {
            GreenlightError::NotFound(format!(
                "request {} has no action {}",
                job.number, job.action_index
            ))
        })?;
        self.diff_backend
            .source_diff(action, job.with_issues, None)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Deadline-driven acceptance
    // ========================================================================

    /// Numbers of requests whose accept_at has elapsed with a met quorum.
    pub async fn due_for_acceptance(&self) -> Result<Vec<RequestNumber>> {
        self.storage.due_for_acceptance(Utc::now()).await
    }

    /// Attempt deadline-driven acceptance of one request, with system
    /// authority. Returns whether the request was accepted; conditions that
    /// no longer hold and lost commit races both return `false`.
    pub async fn accept_due(&self, number: RequestNumber) -> Result<bool> {
        let Versioned { request, version } = self.storage.load(number).await?;
        if request.state.is_terminal() || request.has_open_reviews() {
            return Ok(false);
        }
        let elapsed = request.accept_at.is_some_and(|at| at <= Utc::now());
        if !elapsed {
            return Ok(false);
        }

        let mut next = request;
        let from = next.state;
        self.accept(&mut next).await?;
        next.updated_at = Utc::now();

        let system_actor = next
            .approved_by
            .as_ref()
            .map(|a| a.who.clone())
            .unwrap_or_else(UserId::system);
        match self.storage.commit(next, version).await {
            Ok(committed) => {
                self.notifier
                    .publish(Event::new(
                        EventKind::RequestStateChanged,
                        number,
                        system_actor,
                        json!({ "from": from, "to": committed.request.state, "auto": true }),
                    ))
                    .await;
                Ok(true)
            }
            Err(GreenlightError::ConcurrentModification(_)) => {
                // Someone else moved the request; the next poll re-evaluates.
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Administrative surface
    // ========================================================================

    /// Destructively replace a request from a full submitted representation,
    /// keeping its number. One atomic step: a failure leaves the original
    /// intact.
    #[tracing::instrument(skip(self, input), fields(actor = %actor, number = %number))]
    pub async fn update(
        &self,
        actor: &UserId,
        number: RequestNumber,
        input: RequestInput,
    ) -> Result<Request> {
        self.require_admin(actor, "update").await?;
        if input.actions.is_empty() {
            return Err(GreenlightError::ValidationError(
                "a request must contain at least one action".to_string(),
            ));
        }
        self.validate_actions(&input.actions).await?;

        let Versioned { request: old, version } = self.storage.load(number).await?;

        let reviews: Vec<Review> = input
            .reviews
            .into_iter()
            .map(|reviewer| Review::open(reviewer, actor.clone(), None))
            .collect();
        let state = if reviews.iter().any(Review::is_open) {
            RequestState::Review
        } else {
            RequestState::New
        };
        let replacement = Request {
            number,
            state,
            creator: old.creator.clone(),
            description: input.description,
            priority: input.priority.unwrap_or_default(),
            accept_at: None,
            approved_by: None,
            superseded_by: None,
            actions: input
                .actions
                .into_iter()
                .map(|a| Action {
                    kind: a.kind,
                    source: a.source,
                    target: a.target,
                    accept_info: None,
                })
                .collect(),
            reviews,
            created_at: old.created_at,
            updated_at: Utc::now(),
        };

        let committed = self.storage.replace(replacement, version).await?;
        self.notifier
            .publish(Event::new(
                EventKind::RequestChanged,
                number,
                actor.clone(),
                json!({ "replaced": true, "previous_state": old.state }),
            ))
            .await;
        Ok(committed.request)
    }

    /// Hard-delete a request. The deletion event carries a full snapshot of
    /// the prior state for audit purposes.
    #[tracing::instrument(skip(self), fields(actor = %actor, number = %number))]
    pub async fn delete(&self, actor: &UserId, number: RequestNumber) -> Result<Request> {
        self.require_admin(actor, "delete").await?;
        let snapshot = self.storage.remove(number).await?;
        self.notifier
            .publish(Event::new(
                EventKind::RequestDeleted,
                number,
                actor.clone(),
                serde_json::to_value(&snapshot)?,
            ))
            .await;
        tracing::info!(number = %number, "Deleted request");
        Ok(snapshot)
    }

    async fn require_admin(&self, actor: &UserId, command: &str) -> Result<()> {
        if self
            .authz
            .allows(actor, Capability::Administer, &AuthScope::Global)
            .await
        {
            Ok(())
        } else {
            Err(GreenlightError::Forbidden(format!(
                "'{}' requires administrator rights",
                command
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::StaticAuthorizer;
    use crate::diff::MockDiffBackend;
    use crate::jobs::InMemoryJobQueue;
    use crate::notify::RecordingNotifier;
    use crate::sources::MockSourceService;
    use crate::storage::memory::InMemoryStorage;

    struct Harness {
        manager: RequestManager,
        jobs: Arc<InMemoryJobQueue>,
    }

    fn harness(authz: StaticAuthorizer, sources: MockSourceService) -> Harness {
        let jobs = Arc::new(InMemoryJobQueue::new());
        let manager = RequestManager::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(authz),
            Arc::new(sources),
            Arc::new(MockDiffBackend::new()),
            Arc::new(RecordingNotifier::new()),
            jobs.clone(),
        );
        Harness { manager, jobs }
    }

    fn submit_input() -> RequestInput {
        RequestInput::default().with_action(
            ActionKind::Submit,
            Some(Coordinate::package("home:alice", "pkg")),
            Coordinate::package("proj", "pkg"),
        )
    }

    #[tokio::test]
    async fn create_rejects_empty_action_list() {
        let h = harness(StaticAuthorizer::new(), MockSourceService::new());
        let err = h
            .manager
            .create(&UserId::from("alice"), RequestInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GreenlightError::ValidationError(_)));
    }

    #[tokio::test]
    async fn create_validates_targets_before_persisting() {
        let h = harness(
            StaticAuthorizer::new().grant(
                "alice",
                Capability::CreateFor,
                AuthScope::Project("proj".to_string()),
            ),
            // target project not registered
            MockSourceService::new().with_package("home:alice", "pkg"),
        );
        let err = h
            .manager
            .create(&UserId::from("alice"), submit_input())
            .await
            .unwrap_err();
        assert!(matches!(err, GreenlightError::ValidationError(msg) if msg.contains("proj")));
    }

    #[tokio::test]
    async fn create_auto_assigns_maintainer_review_and_enqueues_jobs() {
        let h = harness(
            StaticAuthorizer::new().grant(
                "alice",
                Capability::CreateFor,
                AuthScope::Project("proj".to_string()),
            ),
            MockSourceService::new()
                .with_package("home:alice", "pkg")
                .with_project("proj"),
        );

        let request = h
            .manager
            .create(&UserId::from("alice"), submit_input())
            .await
            .unwrap();

        // Creator has no write permission on the target, so policy opened a
        // package maintainer review and the request starts in review.
        assert_eq!(request.state, RequestState::Review);
        assert_eq!(request.reviews.len(), 1);
        assert!(matches!(
            &request.reviews[0].reviewer,
            ReviewerRef::Package { project, package } if project == "proj" && package == "pkg"
        ));
        assert_eq!(h.jobs.pending().await, 1);
    }

    #[tokio::test]
    async fn create_with_write_permission_starts_new() {
        let h = harness(
            StaticAuthorizer::new()
                .grant(
                    "alice",
                    Capability::CreateFor,
                    AuthScope::Project("proj".to_string()),
                )
                .grant(
                    "alice",
                    Capability::Write,
                    AuthScope::Project("proj".to_string()),
                ),
            MockSourceService::new()
                .with_package("home:alice", "pkg")
                .with_project("proj"),
        );

        let request = h
            .manager
            .create(&UserId::from("alice"), submit_input())
            .await
            .unwrap();
        assert_eq!(request.state, RequestState::New);
        assert!(request.reviews.is_empty());
    }

    #[tokio::test]
    async fn terminal_requests_reject_all_commands() {
        let h = harness(
            StaticAuthorizer::new()
                .grant(
                    "alice",
                    Capability::CreateFor,
                    AuthScope::Project("proj".to_string()),
                )
                .admin("root"),
            MockSourceService::new()
                .with_package("home:alice", "pkg")
                .with_project("proj"),
        );
        let actor = UserId::from("alice");
        let request = h.manager.create(&actor, submit_input()).await.unwrap();

        let declined = h
            .manager
            .command(
                &UserId::from("root"),
                request.number,
                Command::ChangeState {
                    state: RequestedState::Declined,
                    comment: None,
                    superseded_by: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(declined.state, RequestState::Declined);

        let err = h
            .manager
            .command(
                &UserId::from("root"),
                request.number,
                Command::SetPriority {
                    priority: Priority::Critical,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GreenlightError::InvalidStateTransition(number, state, cmd)
                if number == request.number && state == "declined" && cmd == "setpriority"
        ));
    }

    #[tokio::test]
    async fn superseding_cycles_are_rejected() {
        let h = harness(
            StaticAuthorizer::new()
                .grant(
                    "alice",
                    Capability::CreateFor,
                    AuthScope::Project("proj".to_string()),
                )
                .admin("root"),
            MockSourceService::new()
                .with_package("home:alice", "pkg")
                .with_project("proj"),
        );
        let actor = UserId::from("alice");
        let root = UserId::from("root");

        let a = h.manager.create(&actor, submit_input()).await.unwrap();
        let b = h.manager.create(&actor, submit_input()).await.unwrap();

        // a superseded by b
        h.manager
            .command(
                &root,
                a.number,
                Command::ChangeState {
                    state: RequestedState::Superseded,
                    comment: None,
                    superseded_by: Some(b.number),
                },
            )
            .await
            .unwrap();

        // b superseded by a would close the cycle
        let err = h
            .manager
            .command(
                &root,
                b.number,
                Command::ChangeState {
                    state: RequestedState::Superseded,
                    comment: None,
                    superseded_by: Some(a.number),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GreenlightError::ValidationError(msg) if msg.contains("cycle")));

        // self-supersede is malformed outright
        let c = h.manager.create(&actor, submit_input()).await.unwrap();
        let err = h
            .manager
            .command(
                &root,
                c.number,
                Command::ChangeState {
                    state: RequestedState::Superseded,
                    comment: None,
                    superseded_by: Some(c.number),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GreenlightError::ValidationError(msg) if msg.contains("itself")));
    }

    #[tokio::test]
    async fn list_requires_a_filter() {
        let h = harness(StaticAuthorizer::new(), MockSourceService::new());
        let err = h.manager.list(&RequestFilter::default()).await.unwrap_err();
        assert!(matches!(err, GreenlightError::MissingFilter));
    }
}
