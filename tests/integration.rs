use greenlight::{
    ActionKind, AuthScope, Capability, Command, Coordinate, DiffFormat, DiffOptions, DiffOutput,
    EventKind, GreenlightError, InMemoryJobQueue, InMemoryStorage, JobQueue, MockDiffBackend,
    MockSourceService, RecordingNotifier, RequestFilter, RequestInput, RequestManager,
    RequestNumber, RequestState, RequestedState, ReviewResolution, ReviewState, ReviewerRef,
    Scheduler, SchedulerConfig, StaticAuthorizer, UserId,
};
use greenlight::scheduler::SchedulerStatus;
use greenlight::storage::SchedulerStorage;
use std::sync::Arc;
use std::time::Duration;

const PROJECT: &str = "openSUSE:Factory";

/// Full engine wiring over in-memory collaborators.
struct Stack {
    manager: Arc<RequestManager>,
    storage: Arc<InMemoryStorage>,
    diff: Arc<MockDiffBackend>,
    notifier: Arc<RecordingNotifier>,
    jobs: Arc<InMemoryJobQueue>,
    sources: Arc<MockSourceService>,
}

/// Users: `alice` may create against the project but not write; `mia`
/// maintains the project (write/maintain/approve); `root` is an admin.
fn stack() -> Stack {
    let authz = StaticAuthorizer::new()
        .grant(
            "alice",
            Capability::CreateFor,
            AuthScope::Project(PROJECT.to_string()),
        )
        .maintainer("mia", AuthScope::Project(PROJECT.to_string()))
        .grant(
            "mia",
            Capability::CreateFor,
            AuthScope::Project(PROJECT.to_string()),
        )
        .admin("root");
    let sources = Arc::new(
        MockSourceService::new()
            .with_package("home:alice", "pkg")
            .with_package(PROJECT, "pkg")
            .with_incident("openSUSE:Maintenance:1234"),
    );
    let storage = Arc::new(InMemoryStorage::new());
    let diff = Arc::new(MockDiffBackend::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let jobs = Arc::new(InMemoryJobQueue::new());
    let manager = Arc::new(RequestManager::new(
        storage.clone(),
        Arc::new(authz),
        sources.clone(),
        diff.clone(),
        notifier.clone(),
        jobs.clone(),
    ));
    Stack {
        manager,
        storage,
        diff,
        notifier,
        jobs,
        sources,
    }
}

fn submit_input() -> RequestInput {
    RequestInput::default().with_action(
        ActionKind::Submit,
        Some(Coordinate::package("home:alice", "pkg")),
        Coordinate::package(PROJECT, "pkg"),
    )
}

fn package_review() -> ReviewerRef {
    ReviewerRef::Package {
        project: PROJECT.to_string(),
        package: "pkg".to_string(),
    }
}

fn alice() -> UserId {
    UserId::from("alice")
}

fn mia() -> UserId {
    UserId::from("mia")
}

fn root() -> UserId {
    UserId::from("root")
}

#[test_log::test(tokio::test)]
async fn test_review_acceptance_auto_accepts_request() {
    let stack = stack();

    // alice cannot write to the target, so creation opens a maintainer review
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();
    assert_eq!(request.state, RequestState::Review);
    assert_eq!(request.reviews.len(), 1);
    assert_eq!(request.reviews[0].reviewer, package_review());

    // mia maintains the project and therefore matches the package review;
    // hers is the only open review and no accept_at is set
    let accepted = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::ChangeReviewState {
                reviewer: package_review(),
                new_state: ReviewResolution::Accepted,
                comment: Some("builds fine".to_string()),
            },
        )
        .await
        .unwrap();

    // Auto-acceptance happened within the same logical step
    assert_eq!(accepted.state, RequestState::Accepted);
    assert_eq!(accepted.reviews[0].state, ReviewState::Accepted);
    assert!(accepted.actions[0].accept_info.is_some());
    assert_eq!(stack.sources.applied().len(), 1);

    // Review audit trail: opened by alice, resolved by mia
    assert_eq!(accepted.reviews[0].history.len(), 2);
    assert_eq!(accepted.reviews[0].history[1].who, mia());

    // Both the review change and the state change were published
    assert_eq!(
        stack.notifier.events_of(EventKind::ReviewChanged).len(),
        1
    );
    assert_eq!(
        stack
            .notifier
            .events_of(EventKind::RequestStateChanged)
            .len(),
        1
    );
}

#[test_log::test(tokio::test)]
async fn test_single_declined_review_declines_request() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    // A second review so the quorum would not otherwise be met
    stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::AddReview {
                reviewer: ReviewerRef::User(UserId::from("mia")),
                comment: None,
            },
        )
        .await
        .unwrap();

    let declined = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::ChangeReviewState {
                reviewer: package_review(),
                new_state: ReviewResolution::Declined,
                comment: Some("does not build".to_string()),
            },
        )
        .await
        .unwrap();

    // One decline blocks the whole request, open reviews notwithstanding
    assert_eq!(declined.state, RequestState::Declined);
    assert!(declined.actions[0].accept_info.is_none());
}

#[test_log::test(tokio::test)]
async fn test_assignreview_supersedes_and_reopens() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    let reassigned = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::AssignReview {
                from: package_review(),
                to: UserId::from("mia"),
                comment: Some("taking this".to_string()),
            },
        )
        .await
        .unwrap();

    assert_eq!(reassigned.reviews.len(), 2);
    assert_eq!(reassigned.reviews[0].state, ReviewState::Superseded);
    assert_eq!(
        reassigned.reviews[1].reviewer,
        ReviewerRef::User(UserId::from("mia"))
    );
    assert!(reassigned.reviews[1].is_open());
    assert_eq!(reassigned.state, RequestState::Review);

    // The reassigned review resolves like any other
    let accepted = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::ChangeReviewState {
                reviewer: ReviewerRef::User(UserId::from("mia")),
                new_state: ReviewResolution::Accepted,
                comment: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(accepted.state, RequestState::Accepted);
}

#[test_log::test(tokio::test)]
async fn test_approve_is_idempotent_and_reversible() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    let approved = stack
        .manager
        .command(&mia(), request.number, Command::Approve)
        .await
        .unwrap();
    let first_approval = approved.approved_by.clone().unwrap();
    assert_eq!(first_approval.who, mia());
    // Approval does not itself change the state
    assert_eq!(approved.state, RequestState::Review);

    // Second approve is a no-op, not an error
    let again = stack
        .manager
        .command(&mia(), request.number, Command::Approve)
        .await
        .unwrap();
    assert_eq!(
        again.approved_by.unwrap().approved_at,
        first_approval.approved_at
    );

    let cancelled = stack
        .manager
        .command(&mia(), request.number, Command::CancelApproval)
        .await
        .unwrap();
    assert!(cancelled.approved_by.is_none());
    assert_eq!(cancelled.state, RequestState::Review);
}

#[test_log::test(tokio::test)]
async fn test_revoke_by_creator() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    // A stranger to the request cannot revoke it
    let err = stack
        .manager
        .command(
            &UserId::from("mallory"),
            request.number,
            Command::ChangeState {
                state: RequestedState::Revoked,
                comment: None,
                superseded_by: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GreenlightError::Forbidden(_)));

    let revoked = stack
        .manager
        .command(
            &alice(),
            request.number,
            Command::ChangeState {
                state: RequestedState::Revoked,
                comment: Some("nevermind".to_string()),
                superseded_by: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(revoked.state, RequestState::Revoked);
}

#[test_log::test(tokio::test)]
async fn test_superseding_links_without_touching_the_other_request() {
    let stack = stack();
    let old = stack.manager.create(&alice(), submit_input()).await.unwrap();
    let new = stack.manager.create(&alice(), submit_input()).await.unwrap();

    let superseded = stack
        .manager
        .command(
            &alice(),
            old.number,
            Command::ChangeState {
                state: RequestedState::Superseded,
                comment: None,
                superseded_by: Some(new.number),
            },
        )
        .await
        .unwrap();

    assert_eq!(superseded.state, RequestState::Superseded);
    assert_eq!(superseded.superseded_by, Some(new.number));

    // The superseding request's own state is unaffected
    let other = stack.manager.show(new.number).await.unwrap();
    assert_eq!(other.state, RequestState::Review);
    assert!(other.superseded_by.is_none());
}

#[test_log::test(tokio::test)]
async fn test_collection_query_filters_and_orders() {
    let stack = stack();
    let first = stack.manager.create(&alice(), submit_input()).await.unwrap();
    let second = stack.manager.create(&alice(), submit_input()).await.unwrap();
    let third = stack.manager.create(&alice(), submit_input()).await.unwrap();
    assert!(first.number < second.number && second.number < third.number);

    // Accept the second request
    stack
        .manager
        .command(
            &mia(),
            second.number,
            Command::ChangeReviewState {
                reviewer: package_review(),
                new_state: ReviewResolution::Accepted,
                comment: None,
            },
        )
        .await
        .unwrap();

    let accepted = stack
        .manager
        .list(&RequestFilter {
            states: vec![RequestState::Accepted],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].number, second.number);

    // In-review requests come back ordered by number ascending
    let in_review = stack
        .manager
        .list_numbers(&RequestFilter {
            states: vec![RequestState::Review],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(in_review, vec![first.number, third.number]);

    // Unscoped queries are rejected
    let err = stack
        .manager
        .list(&RequestFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GreenlightError::MissingFilter));

    // Creator dimension
    let by_creator = stack
        .manager
        .list(&RequestFilter {
            user: Some(alice()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_creator.len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_diff_merges_in_action_order() {
    let stack = stack();
    let input = submit_input().with_action(
        ActionKind::Delete,
        None,
        Coordinate::package(PROJECT, "pkg"),
    );
    let request = stack.manager.create(&alice(), input).await.unwrap();

    stack.diff.add_diff("submit openSUSE:Factory/pkg", "submit-diff\n");
    stack.diff.add_diff("delete openSUSE:Factory/pkg", "delete-diff\n");

    match stack
        .manager
        .diff(request.number, &DiffOptions::default())
        .await
        .unwrap()
    {
        DiffOutput::Text(text) => assert_eq!(text, "submit-diff\ndelete-diff\n"),
        other => panic!("expected text diff, got {:?}", other),
    }

    stack.diff.set_fallback("fragment\n");
    match stack
        .manager
        .diff(
            request.number,
            &DiffOptions {
                format: DiffFormat::Structured,
                ..Default::default()
            },
        )
        .await
        .unwrap()
    {
        DiffOutput::Structured(doc) => {
            assert_eq!(doc.number, request.number);
            assert_eq!(doc.actions.len(), 2);
            assert_eq!(doc.actions[0].kind, ActionKind::Submit);
            assert_eq!(doc.actions[1].kind, ActionKind::Delete);
        }
        other => panic!("expected structured diff, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn test_diff_against_superseded_predecessor() {
    let stack = stack();
    let old = stack.manager.create(&alice(), submit_input()).await.unwrap();
    let new = stack.manager.create(&alice(), submit_input()).await.unwrap();

    stack
        .manager
        .command(
            &alice(),
            old.number,
            Command::ChangeState {
                state: RequestedState::Superseded,
                comment: None,
                superseded_by: Some(new.number),
            },
        )
        .await
        .unwrap();

    stack.diff.set_fallback("compared\n");
    stack
        .manager
        .diff(
            new.number,
            &DiffOptions {
                diff_to_superseded: Some(old.number),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The backend was handed the matching superseded action as comparison operand
    let calls = stack.diff.get_calls();
    assert!(calls.last().unwrap().compared_against_superseded);

    // Naming a request that is not a superseded predecessor fails with a
    // message identifying both numbers
    let bogus = RequestNumber(9999);
    let err = stack
        .manager
        .diff(
            new.number,
            &DiffOptions {
                diff_to_superseded: Some(bogus),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        GreenlightError::NotFound(msg) => {
            assert!(msg.contains("9999"));
            assert!(msg.contains(&new.number.to_string()));
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn test_update_replaces_atomically() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    // Non-admins cannot update
    let err = stack
        .manager
        .update(&alice(), request.number, submit_input())
        .await
        .unwrap_err();
    assert!(matches!(err, GreenlightError::Forbidden(_)));

    // A failing replacement leaves the original intact
    let bad_input = RequestInput::default().with_action(
        ActionKind::Delete,
        None,
        Coordinate::package("no:such:project", "pkg"),
    );
    assert!(
        stack
            .manager
            .update(&root(), request.number, bad_input)
            .await
            .is_err()
    );
    let untouched = stack.manager.show(request.number).await.unwrap();
    assert_eq!(untouched.actions[0].kind, ActionKind::Submit);

    // A valid replacement keeps number and creator
    let replacement = RequestInput::default().with_action(
        ActionKind::Delete,
        None,
        Coordinate::package(PROJECT, "pkg"),
    );
    let replaced = stack
        .manager
        .update(&root(), request.number, replacement)
        .await
        .unwrap();
    assert_eq!(replaced.number, request.number);
    assert_eq!(replaced.creator, alice());
    assert_eq!(replaced.actions[0].kind, ActionKind::Delete);
    assert_eq!(replaced.state, RequestState::New);
    assert_eq!(stack.notifier.events_of(EventKind::RequestChanged).len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_delete_emits_snapshot_event() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    let err = stack
        .manager
        .delete(&alice(), request.number)
        .await
        .unwrap_err();
    assert!(matches!(err, GreenlightError::Forbidden(_)));

    let snapshot = stack.manager.delete(&root(), request.number).await.unwrap();
    assert_eq!(snapshot.number, request.number);

    // Request is gone
    assert!(matches!(
        stack.manager.show(request.number).await.unwrap_err(),
        GreenlightError::RequestNotFound(_)
    ));

    // The deletion event carries the full prior state for audit
    let events = stack.notifier.events_of(EventKind::RequestDeleted);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor, root());
    assert_eq!(events[0].payload["state"], "review");
    assert_eq!(
        events[0].payload["number"],
        serde_json::json!(request.number.0)
    );
}

#[test_log::test(tokio::test)]
async fn test_future_accept_at_defers_to_scheduler() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::SetAcceptAt {
                time: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            },
        )
        .await
        .unwrap();

    // Resolving the last review does not accept while the deadline is pending
    let resolved = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::ChangeReviewState {
                reviewer: package_review(),
                new_state: ReviewResolution::Accepted,
                comment: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(resolved.state, RequestState::Review);
    assert!(resolved.actions[0].accept_info.is_none());
}

#[test_log::test(tokio::test)]
async fn test_scheduler_accepts_elapsed_deadline_and_drains_jobs() {
    let stack = stack();
    stack.diff.set_fallback("cached\n");

    // mia creates against a target she can write to: no reviews, state new
    let request = stack.manager.create(&mia(), submit_input()).await.unwrap();
    assert_eq!(request.state, RequestState::New);
    assert_eq!(stack.jobs.pending().await, 1);

    stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::SetAcceptAt {
                time: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
            },
        )
        .await
        .unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        stack.manager.clone(),
        stack.storage.clone(),
        stack.jobs.clone(),
        SchedulerConfig {
            accept_poll_interval_ms: 10,
            job_poll_interval_ms: 10,
            status_log_interval_ms: None,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    let handle = scheduler.clone().run().expect("Failed to start scheduler");

    // Poll for the deadline-driven acceptance (with timeout)
    let start = tokio::time::Instant::now();
    let timeout = Duration::from_secs(5);
    let mut accepted = false;
    while start.elapsed() < timeout {
        let current = stack.manager.show(request.number).await.unwrap();
        if current.state == RequestState::Accepted {
            assert!(current.actions[0].accept_info.is_some());
            accepted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(accepted, "Request was not auto-accepted within timeout");

    // The creation-time diff job was drained through the backend
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout && stack.jobs.pending().await > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stack.jobs.pending().await, 0);
    assert!(stack.diff.call_count() >= 1);

    // Graceful shutdown marks the lifecycle record dead
    shutdown.cancel();
    handle.await.unwrap().unwrap();
    let dead = stack
        .storage
        .list_schedulers(Some(SchedulerStatus::Dead))
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_scheduler_parks_exhausted_diff_jobs() {
    let stack = stack();
    // No mock diff configured and no fallback: every attempt fails

    let request = stack.manager.create(&mia(), submit_input()).await.unwrap();
    assert_eq!(stack.jobs.pending().await, 1);

    let shutdown = tokio_util::sync::CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        stack.manager.clone(),
        stack.storage.clone(),
        stack.jobs.clone(),
        SchedulerConfig {
            accept_poll_interval_ms: 10,
            job_poll_interval_ms: 10,
            max_job_attempts: 2,
            status_log_interval_ms: None,
            ..Default::default()
        },
        shutdown.clone(),
    ));
    let handle = scheduler.clone().run().expect("Failed to start scheduler");

    let start = tokio::time::Instant::now();
    let timeout = Duration::from_secs(5);
    while start.elapsed() < timeout && stack.jobs.failed().is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let failed = stack.jobs.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job.number, request.number);
    assert_eq!(failed[0].job.attempts, 2);
    assert!(failed[0].error.contains("diff pre-cache"));
}

#[test_log::test(tokio::test)]
async fn test_failed_acceptance_keeps_request_in_review() {
    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    // The source backend refuses to apply anything
    stack.sources.fail_applications(true);

    let still_in_review = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::ChangeReviewState {
                reviewer: package_review(),
                new_state: ReviewResolution::Accepted,
                comment: None,
            },
        )
        .await
        .unwrap();

    // The review resolution stuck, the auto-acceptance did not
    assert_eq!(still_in_review.state, RequestState::Review);
    assert_eq!(still_in_review.reviews[0].state, ReviewState::Accepted);
    assert!(still_in_review.actions[0].accept_info.is_none());

    // Once the backend recovers, an authorized accept goes through
    stack.sources.fail_applications(false);
    let accepted = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::ChangeState {
                state: RequestedState::Accepted,
                comment: None,
                superseded_by: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(accepted.state, RequestState::Accepted);
}

#[test_log::test(tokio::test)]
async fn test_setincident_repoints_maintenance_actions() {
    let stack = stack();
    let input = RequestInput::default().with_action(
        ActionKind::MaintenanceIncident,
        Some(Coordinate::package("home:alice", "pkg")),
        Coordinate::project(PROJECT),
    );
    let request = stack.manager.create(&alice(), input).await.unwrap();

    // A plain project is not an incident
    let err = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::SetIncident {
                incident_project: PROJECT.to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GreenlightError::ValidationError(_)));

    let repointed = stack
        .manager
        .command(
            &mia(),
            request.number,
            Command::SetIncident {
                incident_project: "openSUSE:Maintenance:1234".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        repointed.actions[0].target.project,
        "openSUSE:Maintenance:1234"
    );
}

#[test_log::test(tokio::test)]
async fn test_stale_commit_fails_concurrent_modification() {
    use greenlight::Storage;

    let stack = stack();
    let request = stack.manager.create(&alice(), submit_input()).await.unwrap();

    // Two callers load the same persisted snapshot
    let first = stack.storage.load(request.number).await.unwrap();
    let second = stack.storage.load(request.number).await.unwrap();

    // The first transition commits
    let mut winning = first.request.clone();
    winning.state = RequestState::Revoked;
    stack
        .storage
        .commit(winning, first.version)
        .await
        .unwrap();

    // The second, validated against the pre-commit snapshot, must fail
    let mut losing = second.request.clone();
    losing.state = RequestState::Declined;
    let err = stack
        .storage
        .commit(losing, second.version)
        .await
        .unwrap_err();
    assert!(matches!(err, GreenlightError::ConcurrentModification(n) if n == request.number));
}
