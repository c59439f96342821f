#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use escalator_core::{
    CaptchaContext, ChallengeKind, ErrorClassifier, EscalatorConfig, FetchOptions, RawOutcome,
    Session, TierExecutor, TierKind, TierResult, TransportFailure,
};
use url::Url;

type Behavior = dyn Fn(usize, Option<&Session>) -> TierResult + Send + Sync;

/// Tier executor that answers from a script instead of a backend.
pub struct ScriptedTier {
    kind: TierKind,
    behavior: Box<Behavior>,
    delay: Duration,
    calls: AtomicUsize,
    cleanups: AtomicUsize,
    sessions_seen: Mutex<Vec<Option<String>>>,
}

impl ScriptedTier {
    pub fn new(
        kind: TierKind,
        behavior: impl Fn(usize, Option<&Session>) -> TierResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behavior: Box::new(behavior),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            sessions_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(
        kind: TierKind,
        delay: Duration,
        behavior: impl Fn(usize, Option<&Session>) -> TierResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behavior: Box::new(behavior),
            delay,
            calls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            sessions_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// The `cf_clearance` value of the session each call received.
    pub fn sessions_seen(&self) -> Vec<Option<String>> {
        self.sessions_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TierExecutor for ScriptedTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn execute(
        &self,
        _url: &Url,
        _options: &FetchOptions,
        session: Option<&Session>,
    ) -> TierResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.sessions_seen.lock().unwrap().push(
            session
                .and_then(|session| session.cookie("cf_clearance"))
                .map(|cookie| cookie.value.clone()),
        );
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.behavior)(call, session)
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn classified(kind: TierKind, raw: RawOutcome) -> TierResult {
    TierResult::classified(
        kind,
        &ErrorClassifier::default(),
        raw,
        Vec::new(),
        Vec::new(),
        Duration::from_millis(10),
    )
}

pub fn success(kind: TierKind) -> TierResult {
    classified(kind, RawOutcome::response(200, "<html><h1>Product page</h1></html>"))
}

pub fn blocked(kind: TierKind) -> TierResult {
    classified(kind, RawOutcome::response(403, "<html>Access denied</html>"))
}

pub fn bot_wall(kind: TierKind) -> TierResult {
    classified(
        kind,
        RawOutcome::response(200, "<html><p>Please verify you are human to continue</p></html>"),
    )
}

pub fn transport(kind: TierKind, failure: TransportFailure) -> TierResult {
    classified(kind, RawOutcome::transport(failure))
}

pub fn server_error(kind: TierKind) -> TierResult {
    classified(kind, RawOutcome::response(502, "bad gateway"))
}

pub fn skip(kind: TierKind) -> TierResult {
    TierResult::skip(kind, ChallengeKind::Cloudflare, Duration::from_millis(120))
}

pub fn captcha_required(kind: TierKind, url: &str) -> TierResult {
    classified(
        kind,
        RawOutcome {
            status: Some(200),
            body: Some("<div class=\"cf-turnstile\"></div>".into()),
            interactive_challenge: Some(ChallengeKind::Turnstile),
            ..Default::default()
        },
    )
    .with_captcha(CaptchaContext {
        url: url.to_string(),
        challenge: ChallengeKind::Turnstile,
        proxy: None,
        user_agent: Some("scripted-agent/1.0".into()),
    })
}

/// Defaults with instant retries so tests never sleep on the schedule.
pub fn test_config() -> EscalatorConfig {
    let mut config = EscalatorConfig::default();
    config.retry.schedule_ms = vec![0];
    config.retry.jitter_ms = 0;
    config.captcha.poll_interval_ms = 20;
    config
}
