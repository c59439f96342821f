//! The per-attempt escalation state machine.
//!
//! `INIT -> TRYING(tier) -> {SUCCESS, ESCALATING, FAIL_FAST, AWAITING_RESOLUTION, FAILED}`.
//! Only the orchestrator applies escalation policy; executors report a
//! classified [`TierResult`] and nothing else.

mod metrics;
mod retry;
mod telemetry;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::captcha::{CaptchaEvent, EventType, NewCaptchaTask, ResolutionCoordinator};
use crate::classifier::ErrorCategory;
use crate::config::{EscalatorConfig, OrchestratorSection};
use crate::session::{domain_of, Session, SessionCache};
use crate::tier::{
    FetchOptions, TierExecutor, TierKind, TierOutcome, TierPayload, TierRegistry, TierResult,
};

pub use metrics::{OrchestratorMetrics, TierCounters};
pub use retry::{RetryOutcome, RetryPolicy};
pub use telemetry::{AttemptTelemetry, FailureRecord, RunRecord, TelemetryError, TierAction};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid target url: {0}")]
    InvalidUrl(String),
    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),
    #[error("no tier registered between {start} and {max}")]
    NoTiers { start: TierKind, max: TierKind },
    #[error("tier {0} is not registered")]
    TierUnavailable(TierKind),
    #[error("fetch attempt cancelled")]
    Cancelled,
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Climb the ladder from the configured start tier.
    #[default]
    Auto,
    /// Run exactly one tier and report what it says.
    Forced(TierKind),
    /// Climb the ladder but never below the browser-hybrid tier.
    Browser,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Auto => f.write_str("auto"),
            Strategy::Forced(tier) => write!(f, "forced:{tier}"),
            Strategy::Browser => f.write_str("browser"),
        }
    }
}

impl FromStr for Strategy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "" | "auto" => Ok(Strategy::Auto),
            "browser" => Ok(Strategy::Browser),
            other => other
                .trim_start_matches("forced:")
                .parse::<TierKind>()
                .map(Strategy::Forced)
                .map_err(|_| OrchestratorError::InvalidStrategy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Init,
    Trying(TierKind),
    Escalating,
    AwaitingResolution,
    Success,
    FailFast,
    Failed,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Init => f.write_str("init"),
            AttemptState::Trying(tier) => write!(f, "trying({tier})"),
            AttemptState::Escalating => f.write_str("escalating"),
            AttemptState::AwaitingResolution => f.write_str("awaiting_resolution"),
            AttemptState::Success => f.write_str("success"),
            AttemptState::FailFast => f.write_str("fail_fast"),
            AttemptState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Success,
    Failed,
}

impl FinalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalState::Success => "success",
            FinalState::Failed => "failed",
        }
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One client request, owned by the orchestrator while it runs.
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    url: Url,
    strategy: Strategy,
    options: FetchOptions,
    start_tier: Option<TierKind>,
    max_tier: Option<TierKind>,
    state: AttemptState,
    cursor: usize,
    results: Vec<TierResult>,
}

impl FetchAttempt {
    pub fn new(url: &str) -> OrchestratorResult<Self> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(OrchestratorError::InvalidUrl("empty url".into()));
        }
        let url =
            Url::parse(trimmed).map_err(|err| OrchestratorError::InvalidUrl(format!("{trimmed}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(OrchestratorError::InvalidUrl(trimmed.to_string()));
        }
        Ok(Self {
            url,
            strategy: Strategy::Auto,
            options: FetchOptions::default(),
            start_tier: None,
            max_tier: None,
            state: AttemptState::Init,
            cursor: 0,
            results: Vec::new(),
        })
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the configured ladder bounds for this attempt.
    pub fn with_tier_bounds(mut self, start: Option<TierKind>, max: Option<TierKind>) -> Self {
        self.start_tier = start;
        self.max_tier = max;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn results(&self) -> &[TierResult] {
        &self.results
    }

    fn transition(&mut self, next: AttemptState) {
        debug!(url = %self.url, from = %self.state, to = %next, "attempt state");
        self.state = next;
    }
}

/// Terminal outcome of one attempt. `message` is derived from the category
/// and tier only, never from a backend error.
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub state: FinalState,
    pub tier: Option<TierKind>,
    pub category: Option<ErrorCategory>,
    pub message: String,
    pub status: Option<u16>,
    pub payload: Option<TierPayload>,
    pub results: Vec<TierResult>,
    pub escalations: usize,
    pub captcha_task: Option<Uuid>,
    pub elapsed: Duration,
}

impl FinalResult {
    pub fn is_success(&self) -> bool {
        self.state == FinalState::Success
    }

    pub fn body(&self) -> Option<&str> {
        self.payload.as_ref().map(|payload| payload.body.as_str())
    }

    /// Tiers invoked, in order, counting retries once.
    pub fn tiers_tried(&self) -> Vec<TierKind> {
        let mut tiers: Vec<TierKind> = Vec::new();
        for result in &self.results {
            if tiers.last() != Some(&result.tier) {
                tiers.push(result.tier);
            }
        }
        tiers
    }
}

pub fn describe_outcome(
    state: FinalState,
    tier: Option<TierKind>,
    category: Option<ErrorCategory>,
) -> String {
    match (state, tier, category) {
        (FinalState::Success, Some(tier), _) => {
            format!("fetched with tier {} ({tier})", tier.label())
        }
        (FinalState::Success, None, _) => "fetched".to_string(),
        (FinalState::Failed, Some(tier), category) => format!(
            "{} at tier {} ({tier})",
            category.unwrap_or(ErrorCategory::Unknown).describe(),
            tier.label()
        ),
        (FinalState::Failed, None, category) => category
            .unwrap_or(ErrorCategory::Unknown)
            .describe()
            .to_string(),
    }
}

struct Verdict {
    state: FinalState,
    result: TierResult,
    escalations: usize,
    captcha_task: Option<Uuid>,
}

pub struct EscalationOrchestrator {
    config: OrchestratorSection,
    registry: TierRegistry,
    sessions: Arc<dyn SessionCache>,
    coordinator: Option<ResolutionCoordinator>,
    retry: RetryPolicy,
    resolution_timeout: Duration,
    telemetry: Option<Arc<AttemptTelemetry>>,
    metrics: Arc<Mutex<OrchestratorMetrics>>,
}

impl fmt::Debug for EscalationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationOrchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("resolution_timeout", &self.resolution_timeout)
            .field("coordinator", &self.coordinator.is_some())
            .finish()
    }
}

impl EscalationOrchestrator {
    pub fn new(
        config: &EscalatorConfig,
        registry: TierRegistry,
        sessions: Arc<dyn SessionCache>,
    ) -> Self {
        Self {
            config: config.orchestrator.clone(),
            registry,
            sessions,
            coordinator: None,
            retry: RetryPolicy::new(config.retry.clone()),
            resolution_timeout: config.captcha.wait_timeout(),
            telemetry: None,
            metrics: Arc::new(Mutex::new(OrchestratorMetrics::default())),
        }
    }

    pub fn with_coordinator(mut self, coordinator: ResolutionCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<AttemptTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.resolution_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &TierRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        match self.metrics.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn execute(&self, attempt: FetchAttempt) -> OrchestratorResult<FinalResult> {
        self.execute_with_cancel(attempt, &CancellationToken::new())
            .await
    }

    /// Drives the attempt to a terminal result. Cancelling `cancel` releases
    /// any executor resource and abandons a pending wait; an open captcha
    /// task is left for an operator.
    pub async fn execute_with_cancel(
        &self,
        mut attempt: FetchAttempt,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<FinalResult> {
        let started = Instant::now();
        let domain = domain_of(&attempt.url)
            .ok_or_else(|| OrchestratorError::InvalidUrl(attempt.url.to_string()))?;
        info!(url = %attempt.url, strategy = %attempt.strategy, "fetch attempt started");

        let verdict = match attempt.strategy {
            Strategy::Forced(tier) => self.run_forced(&mut attempt, tier, &domain, cancel).await?,
            Strategy::Auto | Strategy::Browser => {
                self.run_ladder(&mut attempt, &domain, cancel).await?
            }
        };
        Ok(self.finish(attempt, verdict, started.elapsed()))
    }

    /// Releases every executor's resources.
    pub async fn shutdown(&self) {
        self.registry.cleanup_all().await;
    }

    fn bounds(&self, attempt: &FetchAttempt) -> (TierKind, TierKind) {
        let mut start = attempt.start_tier.unwrap_or(self.config.start_tier);
        if attempt.strategy == Strategy::Browser {
            start = start.max(TierKind::BrowserHybrid);
        }
        let max = attempt.max_tier.unwrap_or(self.config.max_tier);
        (start, max)
    }

    async fn run_forced(
        &self,
        attempt: &mut FetchAttempt,
        tier: TierKind,
        domain: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Verdict> {
        let executor = self
            .registry
            .get(tier)
            .ok_or(OrchestratorError::TierUnavailable(tier))?;
        let mut session = self.lookup_session(domain).await;
        attempt.transition(AttemptState::Trying(tier));
        let result = self
            .invoke(&executor, attempt, session.as_ref(), &RetryPolicy::single(), cancel)
            .await?;
        self.drop_blocked_session(&result, &mut session).await;
        let state = if result.is_success() {
            self.store_harvested(&result).await;
            attempt.transition(AttemptState::Success);
            FinalState::Success
        } else {
            self.record_failure(attempt, &result, TierAction::Exhausted);
            attempt.transition(AttemptState::Failed);
            FinalState::Failed
        };
        Ok(Verdict {
            state,
            result,
            escalations: 0,
            captcha_task: None,
        })
    }

    async fn run_ladder(
        &self,
        attempt: &mut FetchAttempt,
        domain: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Verdict> {
        let (start, max) = self.bounds(attempt);
        let ladder = self.registry.ladder(start, max);
        let top = match ladder.len().checked_sub(1) {
            Some(top) => top,
            None => return Err(OrchestratorError::NoTiers { start, max }),
        };

        let mut session = self.lookup_session(domain).await;
        let mut escalations = 0usize;
        let mut server_errors = 0usize;
        let mut last = None;

        for (index, executor) in ladder.iter().enumerate() {
            let tier = executor.kind();
            attempt.cursor = index;
            attempt.transition(AttemptState::Trying(tier));
            session = session.filter(Session::is_valid);
            let result = self
                .invoke(executor, attempt, session.as_ref(), &self.retry, cancel)
                .await?;

            if result.is_success() {
                self.store_harvested(&result).await;
                attempt.transition(AttemptState::Success);
                return Ok(Verdict {
                    state: FinalState::Success,
                    result,
                    escalations,
                    captcha_task: None,
                });
            }

            self.drop_blocked_session(&result, &mut session).await;
            let category = result.category.unwrap_or(ErrorCategory::Unknown);

            if category.is_structural() {
                self.record_failure(attempt, &result, TierAction::FailFast);
                self.metric(|metrics| metrics.record_fail_fast());
                warn!(url = %attempt.url, tier = %tier, category = %category, "fail fast");
                attempt.transition(AttemptState::FailFast);
                return Ok(Verdict {
                    state: FinalState::Failed,
                    result,
                    escalations,
                    captcha_task: None,
                });
            }

            if category == ErrorCategory::CaptchaRequired && index == top {
                return self
                    .await_resolution(attempt, executor, domain, result, escalations, cancel)
                    .await;
            }

            if category == ErrorCategory::ServerError {
                server_errors += 1;
            }
            if index == top || server_errors > 1 {
                self.record_failure(attempt, &result, TierAction::Exhausted);
                last = Some(result);
                break;
            }

            self.record_failure(attempt, &result, TierAction::Escalate);
            self.metric(|metrics| metrics.record_escalation());
            escalations += 1;
            info!(url = %attempt.url, tier = %tier, outcome = result.outcome.as_str(), category = %category, "escalating");
            attempt.transition(AttemptState::Escalating);
            last = Some(result);
        }

        attempt.transition(AttemptState::Failed);
        let result = last.ok_or(OrchestratorError::NoTiers { start, max })?;
        Ok(Verdict {
            state: FinalState::Failed,
            result,
            escalations,
            captcha_task: None,
        })
    }

    /// Hands the challenge to a human, releases the executor, waits for a
    /// session and retries the same tier once with it.
    async fn await_resolution(
        &self,
        attempt: &mut FetchAttempt,
        executor: &Arc<dyn TierExecutor>,
        domain: &str,
        result: TierResult,
        escalations: usize,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Verdict> {
        let coordinator = match (&self.coordinator, self.config.await_resolution) {
            (Some(coordinator), true) => coordinator,
            _ => {
                self.record_failure(attempt, &result, TierAction::Exhausted);
                attempt.transition(AttemptState::Failed);
                return Ok(Verdict {
                    state: FinalState::Failed,
                    result,
                    escalations,
                    captcha_task: None,
                });
            }
        };

        self.record_failure(attempt, &result, TierAction::AwaitResolution);
        attempt.transition(AttemptState::AwaitingResolution);
        executor.cleanup().await;
        self.metric(|metrics| metrics.record_captcha_handoff());

        let request = captcha_request(attempt, domain, &result);
        let task = match coordinator.create_task(request).await {
            Ok(task) => task,
            Err(err) => {
                warn!(url = %attempt.url, domain, error = %err, "could not create captcha task");
                attempt.transition(AttemptState::Failed);
                return Ok(Verdict {
                    state: FinalState::Failed,
                    result,
                    escalations,
                    captcha_task: None,
                });
            }
        };
        info!(url = %attempt.url, domain, uuid = %task.uuid, "awaiting human resolution");

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(domain, uuid = %task.uuid, "cancelled while awaiting resolution");
                return Err(OrchestratorError::Cancelled);
            }
            waited = coordinator.wait_for_solution(domain, self.resolution_timeout) => waited,
        };
        let mut session = match waited {
            Ok(Some(session)) => Some(session),
            Ok(None) => {
                info!(domain, uuid = %task.uuid, "no solution arrived");
                attempt.transition(AttemptState::Failed);
                return Ok(Verdict {
                    state: FinalState::Failed,
                    result,
                    escalations,
                    captcha_task: Some(task.uuid),
                });
            }
            Err(err) => {
                warn!(domain, uuid = %task.uuid, error = %err, "wait for solution failed");
                attempt.transition(AttemptState::Failed);
                return Ok(Verdict {
                    state: FinalState::Failed,
                    result,
                    escalations,
                    captcha_task: Some(task.uuid),
                });
            }
        };

        self.metric(|metrics| metrics.record_resolution());
        attempt.transition(AttemptState::Trying(executor.kind()));
        let retried = self
            .invoke(executor, attempt, session.as_ref(), &RetryPolicy::single(), cancel)
            .await?;
        self.drop_blocked_session(&retried, &mut session).await;
        let state = if retried.is_success() {
            self.store_harvested(&retried).await;
            attempt.transition(AttemptState::Success);
            FinalState::Success
        } else {
            self.record_failure(attempt, &retried, TierAction::Exhausted);
            attempt.transition(AttemptState::Failed);
            FinalState::Failed
        };
        Ok(Verdict {
            state,
            result: retried,
            escalations,
            captcha_task: Some(task.uuid),
        })
    }

    async fn invoke(
        &self,
        executor: &Arc<dyn TierExecutor>,
        attempt: &mut FetchAttempt,
        session: Option<&Session>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<TierResult> {
        let tier = executor.kind();
        let url = attempt.url.clone();
        let options = attempt.options.clone();
        let run = policy.run(
            url.as_str(),
            tier,
            self.telemetry.clone(),
            Arc::clone(&self.metrics),
            |_| executor.execute(&url, &options, session),
        );
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                executor.cleanup().await;
                return Err(OrchestratorError::Cancelled);
            }
            outcome = run => outcome,
        };

        let result = outcome.result;
        self.metric(|metrics| {
            metrics.record_tier(tier, result.is_success());
            if result.outcome == TierOutcome::Skip {
                metrics.record_smart_skip();
            }
        });
        info!(
            url = %attempt.url,
            tier = %tier,
            outcome = result.outcome.as_str(),
            category = result.category.map(|category| category.as_str()).unwrap_or("none"),
            status = result.status,
            elapsed_ms = result.elapsed.as_millis() as u64,
            attempts = outcome.attempts,
            with_session = session.is_some(),
            "tier finished"
        );
        attempt.results.push(result.clone());
        Ok(result)
    }

    async fn lookup_session(&self, domain: &str) -> Option<Session> {
        match self.sessions.get(domain).await {
            Ok(Some(session)) => {
                debug!(domain, expires_at = %session.expires_at, "using cached session");
                self.metric(|metrics| metrics.record_session_hit());
                Some(session)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(domain, error = %err, "session lookup failed");
                None
            }
        }
    }

    async fn store_harvested(&self, result: &TierResult) {
        let Some(session) = result.harvested.clone() else {
            return;
        };
        match self.sessions.put(session.clone()).await {
            Ok(true) => {
                debug!(domain = %session.domain, tier = %result.tier, "harvested session cached");
                self.metric(|metrics| metrics.record_session_harvested());
                if let Some(coordinator) = &self.coordinator {
                    coordinator
                        .publish(CaptchaEvent::for_session(
                            EventType::SessionCached,
                            &session,
                            None,
                        ))
                        .await;
                }
            }
            Ok(false) => debug!(domain = %session.domain, "fresher session kept"),
            Err(err) => warn!(domain = %session.domain, error = %err, "failed to cache harvested session"),
        }
    }

    /// A session that still comes back blocked is worthless; drop it from the
    /// cache so the next attempt does not reuse it.
    async fn drop_blocked_session(&self, result: &TierResult, session: &mut Option<Session>) {
        if result.category != Some(ErrorCategory::Blocked) || !self.config.invalidate_blocked_sessions {
            return;
        }
        if let Some(stale) = session.take() {
            self.invalidate_session(&stale).await;
        }
    }

    async fn invalidate_session(&self, session: &Session) {
        match self.sessions.invalidate(&session.domain).await {
            Ok(_) => {
                info!(domain = %session.domain, "cached session still blocked; invalidated");
                self.metric(|metrics| metrics.record_session_invalidation());
                if let Some(coordinator) = &self.coordinator {
                    coordinator
                        .publish(CaptchaEvent::for_session(
                            EventType::SessionExpired,
                            session,
                            None,
                        ))
                        .await;
                }
            }
            Err(err) => warn!(domain = %session.domain, error = %err, "failed to invalidate session"),
        }
    }

    fn record_failure(&self, attempt: &FetchAttempt, result: &TierResult, action: TierAction) {
        let Some(telemetry) = self.telemetry.as_ref() else {
            return;
        };
        let record = FailureRecord {
            timestamp: Utc::now(),
            url: attempt.url.to_string(),
            tier: result.tier,
            category: result.category.unwrap_or(ErrorCategory::Unknown),
            status: result.status,
            attempt: attempt.results.len(),
            action,
        };
        if let Err(err) = telemetry.record_failure(&record) {
            warn!(error = %err, "failed to record tier failure");
        }
    }

    fn finish(&self, mut attempt: FetchAttempt, verdict: Verdict, elapsed: Duration) -> FinalResult {
        let Verdict {
            state,
            result,
            escalations,
            captcha_task,
        } = verdict;
        let category = match state {
            FinalState::Success => None,
            FinalState::Failed => Some(result.category.unwrap_or(ErrorCategory::Unknown)),
        };
        let tier = Some(result.tier);
        let final_result = FinalResult {
            state,
            tier,
            category,
            message: describe_outcome(state, tier, category),
            status: result.status,
            payload: result.payload,
            results: std::mem::take(&mut attempt.results),
            escalations,
            captcha_task,
            elapsed,
        };

        if let Some(telemetry) = self.telemetry.as_ref() {
            let run = RunRecord {
                timestamp: Utc::now(),
                url: attempt.url.to_string(),
                state,
                tier,
                category,
                duration_ms: elapsed.as_millis() as i64,
                escalations,
            };
            if let Err(err) = telemetry.record_run(&run) {
                warn!(error = %err, "failed to record attempt run");
            }
        }
        info!(
            url = %attempt.url,
            state = %state,
            tier = %result.tier,
            category = category.map(|category| category.as_str()).unwrap_or("none"),
            escalations,
            elapsed_ms = elapsed.as_millis() as u64,
            "fetch attempt finished"
        );
        final_result
    }

    fn metric(&self, record: impl FnOnce(&mut OrchestratorMetrics)) {
        if let Ok(mut guard) = self.metrics.lock() {
            record(&mut guard);
        }
    }
}

fn captcha_request(attempt: &FetchAttempt, domain: &str, result: &TierResult) -> NewCaptchaTask {
    let context = result.captcha.as_ref();
    let challenge_type = context
        .map(|context| context.challenge)
        .or(result.detected_challenge)
        .map(|challenge| challenge.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    NewCaptchaTask {
        url: context
            .map(|context| context.url.clone())
            .unwrap_or_else(|| attempt.url.to_string()),
        domain: domain.to_string(),
        challenge_type,
        priority: None,
        error_message: Some(ErrorCategory::CaptchaRequired.describe().to_string()),
        proxy_url: context
            .and_then(|context| context.proxy.clone())
            .or_else(|| attempt.options.proxy.clone()),
        user_agent: context.and_then(|context| context.user_agent.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse_from_text() {
        assert_eq!("auto".parse::<Strategy>().unwrap(), Strategy::Auto);
        assert_eq!("Browser".parse::<Strategy>().unwrap(), Strategy::Browser);
        assert_eq!(
            "forced:full_browser".parse::<Strategy>().unwrap(),
            Strategy::Forced(TierKind::FullBrowser)
        );
        assert_eq!("a".parse::<Strategy>().unwrap(), Strategy::Forced(TierKind::Lightweight));
        assert!("warp".parse::<Strategy>().is_err());
    }

    #[test]
    fn attempts_need_an_absolute_http_url() {
        assert!(FetchAttempt::new("  ").is_err());
        assert!(FetchAttempt::new("ftp://example.com/file").is_err());
        assert!(FetchAttempt::new("not a url").is_err());
        let attempt = FetchAttempt::new("https://example.com/page").unwrap();
        assert_eq!(attempt.state(), AttemptState::Init);
        assert!(attempt.results().is_empty());
    }

    #[test]
    fn messages_never_carry_backend_text() {
        assert_eq!(
            describe_outcome(
                FinalState::Failed,
                Some(TierKind::Lightweight),
                Some(ErrorCategory::DnsError)
            ),
            "the target host could not be resolved at tier A (lightweight)"
        );
        assert_eq!(
            describe_outcome(FinalState::Success, Some(TierKind::FullBrowser), None),
            "fetched with tier C (full_browser)"
        );
    }
}
