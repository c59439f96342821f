use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::classifier::{detect_challenge, ErrorClassifier, RawOutcome, TransportFailure};
use crate::config::{FullBrowserSection, SessionSection};
use crate::session::{domain_of, harvest_session, Session};

use super::error::BackendResult;
use super::human::HumanMotionController;
use super::launcher::{
    landed_on_error_page, navigate, navigation_status, page_cookies, BrowserAutomation,
    BrowserLauncher, LaunchOptions, LiveBrowsers,
};
use super::{CaptchaContext, FetchOptions, TierExecutor, TierKind, TierResult};

const CHALLENGE_POLL: Duration = Duration::from_secs(1);

/// Tier C: full rendering with human-like motion, arriving from a referrer.
/// Anything still challenging after the wait window goes to a human.
#[derive(Debug)]
pub struct FullBrowserFetch {
    config: FullBrowserSection,
    session_config: SessionSection,
    launcher: BrowserLauncher,
    classifier: Arc<ErrorClassifier>,
    live: LiveBrowsers,
}

impl FullBrowserFetch {
    pub fn new(
        config: FullBrowserSection,
        session_config: SessionSection,
        launcher: BrowserLauncher,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            config,
            session_config,
            launcher,
            classifier,
            live: LiveBrowsers::default(),
        }
    }

    fn timeout(&self, options: &FetchOptions) -> Duration {
        options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.timeout_seconds))
    }

    async fn run(
        &self,
        automation: &BrowserAutomation,
        url: &Url,
        options: &FetchOptions,
        session: Option<&Session>,
        started: Instant,
    ) -> BackendResult<TierResult> {
        let page = automation.open_page(session).await?;
        navigate(&page, url.as_str(), self.config.referrer.as_deref()).await?;
        if landed_on_error_page(&page).await? {
            return Ok(TierResult::classified(
                self.kind(),
                &self.classifier,
                RawOutcome::transport(TransportFailure::Dns(format!("chrome error page for {url}"))),
                Vec::new(),
                Vec::new(),
                started.elapsed(),
            ));
        }

        if options.human_simulation.unwrap_or(self.config.human_simulation) {
            let mut motion = HumanMotionController::new(self.config.human.clone());
            if let Err(err) = motion.browse(&page, automation.viewport()).await {
                warn!(url = %url, error = %err, "human simulation interrupted");
            }
        }

        // Non-interactive interstitials usually clear by themselves; puzzles never do.
        let deadline = Instant::now() + Duration::from_secs(self.config.challenge_wait_seconds);
        let mut content = page.content().await?;
        let mut challenge = detect_challenge(&content);
        while let Some(kind) = challenge {
            if kind.is_interactive() || Instant::now() >= deadline {
                break;
            }
            debug!(url = %url, challenge = %kind, "waiting for interstitial to clear");
            sleep(CHALLENGE_POLL).await;
            content = page.content().await?;
            challenge = detect_challenge(&content);
        }

        let status = navigation_status(&page).await?;
        let cookies = page_cookies(&page).await?;
        let harvested = domain_of(url).and_then(|domain| {
            harvest_session(
                &domain,
                &cookies,
                &self.session_config,
                Some(automation.user_agent()),
            )
        });
        let raw = RawOutcome {
            status: Some(status),
            transport: None,
            body: Some(content),
            interactive_challenge: challenge,
        };
        let mut result = TierResult::classified(
            self.kind(),
            &self.classifier,
            raw,
            Vec::new(),
            cookies,
            started.elapsed(),
        )
        .with_harvested(harvested);
        if let Some(challenge) = challenge {
            info!(url = %url, challenge = %challenge, "full browser needs human resolution");
            result = result.with_captcha(CaptchaContext {
                url: url.to_string(),
                challenge,
                proxy: automation.proxy().map(str::to_string),
                user_agent: Some(automation.user_agent().to_string()),
            });
        }
        Ok(result)
    }
}

#[async_trait]
impl TierExecutor for FullBrowserFetch {
    fn kind(&self) -> TierKind {
        TierKind::FullBrowser
    }

    async fn execute(
        &self,
        url: &Url,
        options: &FetchOptions,
        session: Option<&Session>,
    ) -> TierResult {
        let started = Instant::now();
        let timeout = self.timeout(options);
        let launch = LaunchOptions {
            proxy: options.proxy.clone(),
            block_assets: options.block_assets.unwrap_or(false),
            timeout: Some(timeout),
        };
        let automation = match self.launcher.launch(&launch).await {
            Ok(automation) => self.live.track(automation).await,
            Err(err) => {
                return TierResult::from_error(self.kind(), &self.classifier, err, started.elapsed())
            }
        };

        let outcome =
            tokio::time::timeout(timeout, self.run(&automation, url, options, session, started)).await;
        self.live.release(&automation).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                debug!(url = %url, error = %err, "full browser fetch failed");
                TierResult::from_error(self.kind(), &self.classifier, err, started.elapsed())
            }
            Err(_) => TierResult::classified(
                self.kind(),
                &self.classifier,
                RawOutcome::transport(TransportFailure::Timeout),
                Vec::new(),
                Vec::new(),
                started.elapsed(),
            ),
        }
    }

    async fn cleanup(&self) {
        let closed = self.live.shutdown_all().await;
        if closed > 0 {
            info!(tier = %self.kind(), closed, "released browsers left by cancelled fetches");
        }
    }
}
