use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CaptchaSection, SessionSection};
use crate::session::{normalize_domain, Session, SessionCache, SessionSource};

use super::error::CaptchaResult;
use super::events::{CaptchaEvent, EventFeed, EventType};
use super::store::{SqliteCaptchaStore, TaskFilter};
use super::task::{CaptchaTask, NewCaptchaTask, Solution, SolutionType};

/// Bridges the task store, the session cache and the event feed.
///
/// Store operations run on the blocking pool; every successful transition is
/// published after it commits.
#[derive(Clone)]
pub struct ResolutionCoordinator {
    store: SqliteCaptchaStore,
    sessions: Arc<dyn SessionCache>,
    events: Arc<dyn EventFeed>,
    config: CaptchaSection,
    session_config: SessionSection,
}

impl ResolutionCoordinator {
    pub fn new(
        store: SqliteCaptchaStore,
        sessions: Arc<dyn SessionCache>,
        events: Arc<dyn EventFeed>,
        config: CaptchaSection,
        session_config: SessionSection,
    ) -> Self {
        Self {
            store,
            sessions,
            events,
            config,
            session_config,
        }
    }

    pub fn store(&self) -> &SqliteCaptchaStore {
        &self.store
    }

    pub fn sessions(&self) -> Arc<dyn SessionCache> {
        Arc::clone(&self.sessions)
    }

    pub fn events(&self) -> Arc<dyn EventFeed> {
        Arc::clone(&self.events)
    }

    /// Returns the open task for the domain when one exists. Only a newly
    /// inserted task publishes `task_created`; lapsed tasks closed on the way
    /// publish `task_expired` first.
    pub async fn create_task(&self, new: NewCaptchaTask) -> CaptchaResult<CaptchaTask> {
        let store = self.store.clone();
        let priority = self.config.default_priority;
        let timeout = Duration::from_secs(self.config.task_timeout_seconds);
        let outcome = tokio::task::spawn_blocking(move || {
            store.create(&new, priority, timeout, Utc::now())
        })
        .await??;
        self.publish_expired(&outcome.expired).await;
        let task = outcome.task;
        if outcome.created {
            info!(uuid = %task.uuid, domain = %task.domain, challenge = %task.challenge_type, "captcha task created");
            self.publish(CaptchaEvent::for_task(EventType::TaskCreated, &task))
                .await;
        } else {
            debug!(uuid = %task.uuid, domain = %task.domain, attempts = task.attempts, "captcha task already open");
        }
        Ok(task)
    }

    /// Locks the task for `operator`. `lock` defaults to the configured TTL.
    pub async fn assign(
        &self,
        uuid: Uuid,
        operator: &str,
        lock: Option<Duration>,
    ) -> CaptchaResult<CaptchaTask> {
        let store = self.store.clone();
        let operator = operator.to_string();
        let lock = lock.unwrap_or_else(|| Duration::from_secs(self.config.lock_ttl_seconds));
        let task =
            tokio::task::spawn_blocking(move || store.assign(uuid, &operator, lock, Utc::now()))
                .await??;
        info!(uuid = %task.uuid, operator = ?task.assigned_to, "captcha task assigned");
        self.publish(CaptchaEvent::for_task(EventType::TaskAssigned, &task))
            .await;
        Ok(task)
    }

    pub async fn start_solving(&self, uuid: Uuid, operator: &str) -> CaptchaResult<CaptchaTask> {
        let store = self.store.clone();
        let operator = operator.to_string();
        let task =
            tokio::task::spawn_blocking(move || store.start_solving(uuid, &operator, Utc::now()))
                .await??;
        self.publish(CaptchaEvent::for_task(EventType::TaskSolving, &task))
            .await;
        Ok(task)
    }

    /// Stores the solution, caches the derived session and publishes
    /// `session_cached` before `task_solved`.
    pub async fn submit_solution(
        &self,
        uuid: Uuid,
        solution: Solution,
        expiry: Option<DateTime<Utc>>,
    ) -> CaptchaResult<CaptchaTask> {
        solution.validate()?;
        let store = self.store.clone();
        let stored = solution.clone();
        let task =
            tokio::task::spawn_blocking(move || store.submit_solution(uuid, &stored, Utc::now()))
                .await??;

        let session = self.session_from_solution(&task.domain, &solution, expiry, Utc::now());
        if !self.sessions.put(session.clone()).await? {
            debug!(domain = %session.domain, "fresher session kept precedence");
        }
        info!(uuid = %task.uuid, domain = %task.domain, solution = solution.solution_type.as_str(), "captcha solved");
        self.publish(CaptchaEvent::for_session(
            EventType::SessionCached,
            &session,
            Some(&task),
        ))
        .await;
        self.publish(CaptchaEvent::for_task(EventType::TaskSolved, &task))
            .await;
        Ok(task)
    }

    pub async fn mark_failed(&self, uuid: Uuid, reason: &str) -> CaptchaResult<CaptchaTask> {
        let store = self.store.clone();
        let reason = reason.to_string();
        let task = tokio::task::spawn_blocking(move || store.mark_failed(uuid, &reason, Utc::now()))
            .await??;
        warn!(uuid = %task.uuid, domain = %task.domain, reason = ?task.error_message, "captcha attempt failed");
        self.publish(CaptchaEvent::for_task(EventType::TaskFailed, &task))
            .await;
        Ok(task)
    }

    pub async fn mark_unsolvable(&self, uuid: Uuid, reason: &str) -> CaptchaResult<CaptchaTask> {
        let store = self.store.clone();
        let reason = reason.to_string();
        let task =
            tokio::task::spawn_blocking(move || store.mark_unsolvable(uuid, &reason, Utc::now()))
                .await??;
        warn!(uuid = %task.uuid, domain = %task.domain, reason = ?task.error_message, "captcha marked unsolvable");
        self.publish(CaptchaEvent::for_task(EventType::TaskUnsolvable, &task))
            .await;
        Ok(task)
    }

    /// Expires lapsed tasks and prunes the event log past its retention.
    /// `list` and `list_pending` run this first.
    pub async fn expire_stale(&self) -> CaptchaResult<Vec<CaptchaTask>> {
        let store = self.store.clone();
        let retention = chrono::Duration::from_std(self.config.event_retention())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let (expired, pruned) = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let expired = store.expire_stale(now)?;
            let pruned = store.prune_events_before(now - retention)?;
            CaptchaResult::Ok((expired, pruned))
        })
        .await??;
        if pruned > 0 {
            debug!(pruned, "captcha events pruned");
        }
        self.publish_expired(&expired).await;
        Ok(expired)
    }

    async fn publish_expired(&self, expired: &[CaptchaTask]) {
        for task in expired {
            info!(uuid = %task.uuid, domain = %task.domain, "captcha task expired");
            self.publish(CaptchaEvent::for_task(EventType::TaskExpired, task))
                .await;
        }
    }

    pub async fn get(&self, uuid: Uuid) -> CaptchaResult<Option<CaptchaTask>> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.get(uuid)).await??)
    }

    pub async fn list(&self, filter: TaskFilter) -> CaptchaResult<Vec<CaptchaTask>> {
        self.expire_stale().await?;
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.list(&filter)).await??)
    }

    pub async fn list_pending(&self, limit: usize) -> CaptchaResult<Vec<CaptchaTask>> {
        self.expire_stale().await?;
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.list_pending(limit)).await??)
    }

    /// Waits for a valid session for `domain`.
    ///
    /// Subscribes first and then checks the cache, so a session cached before
    /// the call is returned at once and one cached between the two steps is
    /// still seen. Returns `None` on timeout or when the domain's task is
    /// closed without a solution.
    pub async fn wait_for_solution(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> CaptchaResult<Option<Session>> {
        let domain = normalize_domain(domain);
        let mut subscription = self.events.subscribe().await?;
        if let Some(session) = self.sessions.get(&domain).await? {
            debug!(domain = %domain, "session already cached");
            return Ok(Some(session));
        }

        let deadline = Instant::now() + timeout;
        let poll = self.config.poll_interval();
        loop {
            let now = Instant::now();
            if now >= deadline {
                info!(domain = %domain, timeout_ms = timeout.as_millis() as u64, "wait for solution timed out");
                return Ok(None);
            }
            let tick = poll.min(deadline - now);
            match tokio::time::timeout(tick, subscription.next()).await {
                Ok(Some(event)) if event.domain == domain => match event.event_type {
                    EventType::TaskUnsolvable | EventType::TaskExpired => {
                        info!(domain = %domain, event = %event.event_type, "captcha closed without a solution");
                        return Ok(None);
                    }
                    EventType::SessionCached => {
                        if let Some(session) = self.sessions.get(&domain).await? {
                            return Ok(Some(session));
                        }
                    }
                    _ => {}
                },
                Ok(Some(_)) => {}
                Ok(None) => {
                    // Feed closed; fall back to polling the cache until the deadline.
                    if let Some(session) = self.sessions.get(&domain).await? {
                        return Ok(Some(session));
                    }
                    tokio::time::sleep(tick).await;
                }
                Err(_) => {
                    if let Some(session) = self.sessions.get(&domain).await? {
                        return Ok(Some(session));
                    }
                }
            }
        }
    }

    /// Waits with the configured default timeout.
    pub async fn wait_for_solution_default(&self, domain: &str) -> CaptchaResult<Option<Session>> {
        self.wait_for_solution(domain, self.config.wait_timeout()).await
    }

    pub(crate) async fn publish(&self, event: CaptchaEvent) {
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "failed to publish captcha event");
        }
    }

    fn session_from_solution(
        &self,
        domain: &str,
        solution: &Solution,
        expiry: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Session {
        let max_ttl = self.session_config.max_ttl();
        let ttl = expiry
            .and_then(|expiry| (expiry - now).to_std().ok())
            .unwrap_or_else(|| self.session_config.ttl())
            .min(max_ttl);
        let cookies = solution
            .cookies
            .iter()
            .cloned()
            .map(|mut cookie| {
                if cookie.domain.trim().is_empty() {
                    cookie.domain = domain.to_string();
                }
                cookie
            })
            .collect();
        let mut session = Session::new(domain, cookies, ttl, SessionSource::Manual);
        session.user_agent = solution.user_agent.clone();
        if solution.solution_type == SolutionType::Token {
            session.token = solution.token.clone();
        }
        session
    }
}
