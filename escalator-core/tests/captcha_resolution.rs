mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use escalator_core::{
    BroadcastEventFeed, CaptchaError, CaptchaStatus, Cookie, ErrorCategory, EscalationOrchestrator,
    EventFeed, EventType, FetchAttempt, FinalState, NewCaptchaTask, ResolutionCoordinator,
    SessionCache, SessionSection, Solution, SqliteCaptchaStore, SqliteEventFeed,
    SqliteSessionStore, TierKind, TierRegistry,
};
use tempfile::TempDir;

use common::{blocked, captcha_required, success, test_config, ScriptedTier};

const URL: &str = "https://example.com/checkout";

struct Harness {
    _dir: TempDir,
    sessions: Arc<SqliteSessionStore>,
    events: Arc<BroadcastEventFeed>,
    coordinator: ResolutionCoordinator,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let (store, sessions) = stores(dir.path());
    let events = Arc::new(BroadcastEventFeed::default());
    let config = test_config();
    let coordinator = ResolutionCoordinator::new(
        store,
        sessions.clone(),
        events.clone(),
        config.captcha.clone(),
        config.session.clone(),
    );
    Harness {
        _dir: dir,
        sessions,
        events,
        coordinator,
    }
}

fn stores(dir: &Path) -> (SqliteCaptchaStore, Arc<SqliteSessionStore>) {
    let path = dir.join("escalator.sqlite");
    let store = SqliteCaptchaStore::builder()
        .path(&path)
        .create_if_missing(true)
        .build()
        .expect("create captcha store");
    store.initialize().expect("initialize captcha store");
    let sessions = SqliteSessionStore::builder()
        .path(&path)
        .create_if_missing(true)
        .build()
        .expect("create session store");
    sessions.initialize().expect("initialize session store");
    (store, Arc::new(sessions))
}

fn new_task(domain: &str) -> NewCaptchaTask {
    NewCaptchaTask {
        url: format!("https://{domain}/"),
        domain: domain.to_string(),
        challenge_type: "turnstile".into(),
        ..Default::default()
    }
}

/// Tier C: challenge until it is handed a session carrying `cf_clearance`.
fn full_browser() -> Arc<ScriptedTier> {
    ScriptedTier::new(TierKind::FullBrowser, |_, session| {
        match session.and_then(|session| session.cookie("cf_clearance")) {
            Some(_) => success(TierKind::FullBrowser),
            None => captcha_required(TierKind::FullBrowser, URL),
        }
    })
}

fn orchestrator(harness: &Harness, tier: Arc<ScriptedTier>) -> EscalationOrchestrator {
    EscalationOrchestrator::new(
        &test_config(),
        TierRegistry::new().with(tier),
        harness.sessions.clone(),
    )
    .with_coordinator(harness.coordinator.clone())
    .with_resolution_timeout(Duration::from_secs(10))
}

#[tokio::test]
async fn operator_solution_resumes_the_suspended_attempt() {
    let harness = harness();
    let tier = full_browser();
    let orchestrator = orchestrator(&harness, tier.clone());

    let operator = harness.coordinator.clone();
    let mut feed = harness.events.subscribe().await.unwrap();
    let solver = tokio::spawn(async move {
        let created = loop {
            let event = feed.next().await.expect("feed open");
            if event.event_type == EventType::TaskCreated {
                break event;
            }
        };
        let uuid = created.uuid.expect("task uuid");
        let task = operator.get(uuid).await.unwrap().unwrap();
        assert_eq!(task.status, CaptchaStatus::Pending);
        assert_eq!(task.challenge_type, "turnstile");
        assert_eq!(task.user_agent.as_deref(), Some("scripted-agent/1.0"));

        operator.assign(uuid, "operator-1", None).await.unwrap();
        operator
            .submit_solution(
                uuid,
                Solution::cookies(vec![Cookie::new("cf_clearance", "X", ".example.com")]),
                None,
            )
            .await
            .unwrap();
        uuid
    });

    let result = orchestrator
        .execute(FetchAttempt::new(URL).unwrap())
        .await
        .unwrap();
    let uuid = solver.await.unwrap();

    assert_eq!(result.state, FinalState::Success);
    assert_eq!(result.tier, Some(TierKind::FullBrowser));
    assert_eq!(result.captcha_task, Some(uuid));
    assert_eq!(tier.calls(), 2);
    assert_eq!(tier.sessions_seen(), vec![None, Some("X".to_string())]);
    assert!(tier.cleanups() >= 1, "executor released before suspending");

    let session = harness.sessions.get("example.com").await.unwrap().unwrap();
    assert!(session.is_valid());
    assert_eq!(session.cookie("cf_clearance").unwrap().value, "X");

    let task = harness.coordinator.get(uuid).await.unwrap().unwrap();
    assert_eq!(task.status, CaptchaStatus::Solved);
    assert!(task.assigned_to.is_none());
    let metrics = orchestrator.metrics();
    assert_eq!(metrics.captcha_handoffs, 1);
    assert_eq!(metrics.resolutions, 1);
}

#[tokio::test]
async fn rejected_operator_session_is_dropped_from_the_cache() {
    let harness = harness();
    let tier = ScriptedTier::new(TierKind::FullBrowser, |_, session| match session {
        Some(_) => blocked(TierKind::FullBrowser),
        None => captcha_required(TierKind::FullBrowser, URL),
    });
    let orchestrator = orchestrator(&harness, tier.clone());

    let operator = harness.coordinator.clone();
    let mut feed = harness.events.subscribe().await.unwrap();
    tokio::spawn(async move {
        while let Some(event) = feed.next().await {
            if event.event_type == EventType::TaskCreated {
                let uuid = event.uuid.unwrap();
                operator.assign(uuid, "operator-1", None).await.unwrap();
                operator
                    .submit_solution(
                        uuid,
                        Solution::cookies(vec![Cookie::new("cf_clearance", "BAD", "")]),
                        None,
                    )
                    .await
                    .unwrap();
                break;
            }
        }
    });
    let mut watcher = harness.events.subscribe().await.unwrap();

    let result = orchestrator
        .execute(FetchAttempt::new(URL).unwrap())
        .await
        .unwrap();

    assert_eq!(result.state, FinalState::Failed);
    assert_eq!(result.category, Some(ErrorCategory::Blocked));
    assert_eq!(tier.sessions_seen(), vec![None, Some("BAD".to_string())]);
    assert!(harness.sessions.get("example.com").await.unwrap().is_none());
    assert_eq!(orchestrator.metrics().session_invalidations, 1);

    let expired = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), watcher.next())
            .await
            .unwrap()
            .unwrap();
        if event.event_type == EventType::SessionExpired {
            break event;
        }
    };
    assert_eq!(expired.domain, "example.com");
}

#[tokio::test]
async fn unsolvable_task_fails_the_attempt() {
    let harness = harness();
    let tier = full_browser();
    let orchestrator = orchestrator(&harness, tier.clone());

    let operator = harness.coordinator.clone();
    let mut feed = harness.events.subscribe().await.unwrap();
    tokio::spawn(async move {
        while let Some(event) = feed.next().await {
            if event.event_type == EventType::TaskCreated {
                let uuid = event.uuid.unwrap();
                operator.mark_unsolvable(uuid, "challenge loops").await.unwrap();
                break;
            }
        }
    });

    let started = Instant::now();
    let result = orchestrator
        .execute(FetchAttempt::new(URL).unwrap())
        .await
        .unwrap();

    assert_eq!(result.state, FinalState::Failed);
    assert_eq!(result.category, Some(ErrorCategory::CaptchaRequired));
    assert_eq!(result.tier, Some(TierKind::FullBrowser));
    assert!(result.captcha_task.is_some());
    assert_eq!(tier.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn resolution_timeout_fails_and_leaves_task_open() {
    let harness = harness();
    let tier = full_browser();
    let orchestrator =
        orchestrator(&harness, tier.clone()).with_resolution_timeout(Duration::from_millis(150));

    let result = orchestrator
        .execute(FetchAttempt::new(URL).unwrap())
        .await
        .unwrap();

    assert_eq!(result.state, FinalState::Failed);
    assert_eq!(result.category, Some(ErrorCategory::CaptchaRequired));
    let uuid = result.captcha_task.unwrap();
    let task = harness.coordinator.get(uuid).await.unwrap().unwrap();
    assert_eq!(task.status, CaptchaStatus::Pending);
}

#[tokio::test]
async fn duplicate_requests_share_one_open_task() {
    let harness = harness();
    let first = harness
        .coordinator
        .create_task(new_task("example.com"))
        .await
        .unwrap();
    harness
        .coordinator
        .assign(first.uuid, "operator-1", None)
        .await
        .unwrap();
    let second = harness
        .coordinator
        .create_task(new_task("example.com"))
        .await
        .unwrap();

    assert_eq!(first.uuid, second.uuid);
    assert_eq!(second.status, CaptchaStatus::InProgress);
    assert_eq!(second.attempts, 2);
    assert_eq!(harness.coordinator.list_pending(10).await.unwrap().len(), 0);
}

#[tokio::test]
async fn concurrent_assignment_has_exactly_one_winner() {
    let harness = harness();
    let task = harness
        .coordinator
        .create_task(new_task("race.test"))
        .await
        .unwrap();

    let left = harness.coordinator.clone();
    let right = harness.coordinator.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { left.assign(task.uuid, "alice", None).await }),
        tokio::spawn(async move { right.assign(task.uuid, "bob", None).await }),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(CaptchaError::Conflict { .. })))
        .count();
    assert_eq!((winners, conflicts), (1, 1));
}

#[tokio::test]
async fn wait_after_submission_returns_from_the_cache() {
    let harness = harness();
    let task = harness
        .coordinator
        .create_task(new_task("example.com"))
        .await
        .unwrap();
    harness
        .coordinator
        .assign(task.uuid, "operator-1", None)
        .await
        .unwrap();
    harness
        .coordinator
        .submit_solution(
            task.uuid,
            Solution::cookies(vec![Cookie::new("cf_clearance", "X", ".example.com")]),
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let started = Instant::now();
    let session = harness
        .coordinator
        .wait_for_solution("example.com", Duration::from_secs(5))
        .await
        .unwrap()
        .expect("cached session");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(session.cookie("cf_clearance").unwrap().value, "X");
}

#[tokio::test]
async fn sqlite_feed_wakes_a_waiter_in_another_coordinator() {
    let dir = TempDir::new().unwrap();
    let (store, sessions) = stores(dir.path());
    let config = test_config();
    let feed = Arc::new(SqliteEventFeed::new(store.clone(), Duration::from_millis(20)));

    // Two coordinators over the same database stand in for two processes.
    let worker = ResolutionCoordinator::new(
        store.clone(),
        sessions.clone(),
        feed.clone(),
        config.captcha.clone(),
        config.session.clone(),
    );
    let operator = ResolutionCoordinator::new(
        store,
        sessions,
        feed,
        config.captcha.clone(),
        SessionSection::default(),
    );

    let task = worker.create_task(new_task("example.com")).await.unwrap();
    let solver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        operator.assign(task.uuid, "operator-1", None).await.unwrap();
        operator
            .submit_solution(task.uuid, Solution::token("bearer-token"), None)
            .await
            .unwrap();
    });

    let session = worker
        .wait_for_solution("example.com", Duration::from_secs(5))
        .await
        .unwrap()
        .expect("session from the other side");
    solver.await.unwrap();
    assert_eq!(session.token.as_deref(), Some("bearer-token"));
}

#[tokio::test]
async fn expired_sessions_are_never_returned() {
    let harness = harness();
    let session = escalator_core::Session::new(
        "example.com",
        vec![
            Cookie::new("cf_clearance", "X", ".example.com"),
            Cookie::new("__cf_bm", "Y", ".example.com"),
        ],
        Duration::from_millis(200),
        escalator_core::SessionSource::Manual,
    );
    harness.sessions.put(session.clone()).await.unwrap();

    let read = harness.sessions.get("example.com").await.unwrap().unwrap();
    assert_eq!(read.cookies, session.cookies);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.sessions.get("example.com").await.unwrap().is_none());
}
