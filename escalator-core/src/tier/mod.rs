mod browser_hybrid;
mod error;
mod full_browser;
mod human;
mod launcher;
mod lightweight;
mod registry;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::classifier::{ChallengeKind, ErrorCategory, ErrorClassifier, RawOutcome};
use crate::session::{Cookie, Session};

pub use browser_hybrid::BrowserHybridFetch;
pub(crate) use error::error_chain;
pub use error::{BackendResult, TierError};
pub use full_browser::FullBrowserFetch;
pub use human::{HumanMotionController, HumanMotionPlan, MotionEvent};
pub use launcher::{BrowserAutomation, BrowserLauncher, LaunchOptions, LiveBrowsers, ViewportSpec};
pub use lightweight::LightweightFetch;
pub use registry::TierRegistry;

/// Escalation ladder, ordered cheapest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Lightweight,
    BrowserHybrid,
    FullBrowser,
}

impl TierKind {
    pub const ALL: [TierKind; 3] = [
        TierKind::Lightweight,
        TierKind::BrowserHybrid,
        TierKind::FullBrowser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Lightweight => "lightweight",
            TierKind::BrowserHybrid => "browser_hybrid",
            TierKind::FullBrowser => "full_browser",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TierKind::Lightweight => "A",
            TierKind::BrowserHybrid => "B",
            TierKind::FullBrowser => "C",
        }
    }

    pub fn next(&self) -> Option<TierKind> {
        match self {
            TierKind::Lightweight => Some(TierKind::BrowserHybrid),
            TierKind::BrowserHybrid => Some(TierKind::FullBrowser),
            TierKind::FullBrowser => None,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "lightweight" | "a" => Ok(Self::Lightweight),
            "browser_hybrid" | "hybrid" | "b" => Ok(Self::BrowserHybrid),
            "full_browser" | "browser" | "c" => Ok(Self::FullBrowser),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierOutcome {
    Success,
    Blocked,
    Skip,
    Error,
}

impl TierOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierOutcome::Success => "success",
            TierOutcome::Blocked => "blocked",
            TierOutcome::Skip => "skip",
            TierOutcome::Error => "error",
        }
    }
}

/// Per-attempt knobs. Variants read what they understand and ignore the rest.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub timeout: Option<Duration>,
    pub proxy: Option<String>,
    pub headers: Vec<(String, String)>,
    pub block_assets: Option<bool>,
    pub human_simulation: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierPayload {
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<Cookie>,
}

/// What a human needs to reproduce the challenge a tier gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptchaContext {
    pub url: String,
    pub challenge: ChallengeKind,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TierResult {
    pub tier: TierKind,
    pub outcome: TierOutcome,
    pub status: Option<u16>,
    pub category: Option<ErrorCategory>,
    pub payload: Option<TierPayload>,
    pub elapsed: Duration,
    pub size: usize,
    pub detected_challenge: Option<ChallengeKind>,
    /// Clearance cookies picked up on success, worth caching for the domain.
    pub harvested: Option<Session>,
    pub captcha: Option<CaptchaContext>,
}

impl TierResult {
    /// Runs the classifier over what the backend saw.
    pub fn classified(
        tier: TierKind,
        classifier: &ErrorClassifier,
        raw: RawOutcome,
        headers: Vec<(String, String)>,
        cookies: Vec<Cookie>,
        elapsed: Duration,
    ) -> Self {
        let category = classifier.classify(&raw);
        let detected_challenge = raw
            .interactive_challenge
            .or_else(|| raw.body.as_deref().and_then(|body| classifier.detect_challenge(body)));
        let size = raw.body.as_ref().map(String::len).unwrap_or_default();
        let outcome = match category {
            None => TierOutcome::Success,
            Some(category)
                if category.is_defensive_block() || category == ErrorCategory::CaptchaRequired =>
            {
                TierOutcome::Blocked
            }
            Some(_) => TierOutcome::Error,
        };
        let payload = match (outcome, raw.body) {
            (TierOutcome::Success, Some(body)) => Some(TierPayload {
                body,
                headers,
                cookies,
            }),
            _ => None,
        };
        Self {
            tier,
            outcome,
            status: raw.status,
            category,
            payload,
            elapsed,
            size,
            detected_challenge: if outcome == TierOutcome::Success {
                None
            } else {
                detected_challenge
            },
            harvested: None,
            captcha: None,
        }
    }

    /// Early exit on a challenge this tier cannot pass. Escalates like `blocked`.
    pub fn skip(tier: TierKind, challenge: ChallengeKind, elapsed: Duration) -> Self {
        Self {
            tier,
            outcome: TierOutcome::Skip,
            status: None,
            category: Some(ErrorCategory::Blocked),
            payload: None,
            elapsed,
            size: 0,
            detected_challenge: Some(challenge),
            harvested: None,
            captcha: None,
        }
    }

    pub fn from_error(
        tier: TierKind,
        classifier: &ErrorClassifier,
        error: TierError,
        elapsed: Duration,
    ) -> Self {
        Self::classified(tier, classifier, error.into_raw(), Vec::new(), Vec::new(), elapsed)
    }

    pub fn with_harvested(mut self, session: Option<Session>) -> Self {
        if self.outcome == TierOutcome::Success {
            self.harvested = session;
        }
        self
    }

    pub fn with_captcha(mut self, context: CaptchaContext) -> Self {
        if self.category == Some(ErrorCategory::CaptchaRequired) {
            self.captcha = Some(context);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TierOutcome::Success
    }

    pub fn body(&self) -> Option<&str> {
        self.payload.as_ref().map(|payload| payload.body.as_str())
    }
}

/// One fetch strategy on the escalation ladder.
///
/// `execute` always returns a result, never blocks past its timeout, and can
/// be invoked again for a retry. Anything it allocates is released before it
/// returns; `cleanup` releases whatever a cancelled call left behind.
#[async_trait]
pub trait TierExecutor: Send + Sync {
    fn kind(&self) -> TierKind;

    async fn execute(
        &self,
        url: &Url,
        options: &FetchOptions,
        session: Option<&Session>,
    ) -> TierResult;

    async fn cleanup(&self);
}
