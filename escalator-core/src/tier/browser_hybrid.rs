use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::page::Page;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info};
use url::Url;

use crate::classifier::{ErrorClassifier, RawOutcome, TransportFailure};
use crate::config::{BrowserHybridSection, SessionSection};
use crate::session::{domain_of, harvest_session, Session};

use super::error::{BackendResult, TierError};
use super::launcher::{
    evaluate_json, landed_on_error_page, navigate, page_cookies, BrowserAutomation,
    BrowserLauncher, LaunchOptions, LiveBrowsers,
};
use super::{FetchOptions, TierExecutor, TierKind, TierResult};

const READY_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
struct InPageResponse {
    status: u16,
    body: String,
    headers: Vec<(String, String)>,
}

/// Tier B: warms a real browser session on the target origin, then pulls the
/// target with an in-page `fetch` so only one document is rendered.
#[derive(Debug)]
pub struct BrowserHybridFetch {
    config: BrowserHybridSection,
    session_config: SessionSection,
    launcher: BrowserLauncher,
    classifier: Arc<ErrorClassifier>,
    live: LiveBrowsers,
}

impl BrowserHybridFetch {
    pub fn new(
        config: BrowserHybridSection,
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
        session: Option<&Session>,
        started: Instant,
    ) -> BackendResult<TierResult> {
        let page = automation.open_page(session).await?;
        let warmup = url
            .join(&self.config.warmup_path)
            .map_err(|err| TierError::InvalidUrl(err.to_string()))?;
        navigate(&page, warmup.as_str(), None).await?;
        if landed_on_error_page(&page).await? {
            return Ok(self.transport_failure(
                TransportFailure::Dns(format!("chrome error page for {warmup}")),
                started,
            ));
        }

        // Smart skip: give up inside the detection window on anything this
        // tier cannot pass instead of failing slowly.
        let window = Duration::from_millis(self.config.skip_window_ms);
        let detection_started = Instant::now();
        loop {
            let content = page.content().await?;
            if let Some(challenge) = self.classifier.detect_challenge(&content) {
                info!(
                    url = %url,
                    challenge = %challenge,
                    elapsed_ms = detection_started.elapsed().as_millis() as u64,
                    "hybrid tier recognized a challenge, skipping"
                );
                return Ok(TierResult::skip(self.kind(), challenge, started.elapsed()));
            }
            if document_ready(&page).await? || detection_started.elapsed() >= window {
                break;
            }
            sleep(READY_POLL).await;
        }

        let script = format!(
            r#"(async () => {{
    const response = await fetch({target}, {{ credentials: 'include', redirect: 'follow' }});
    const headers = [];
    response.headers.forEach((value, name) => headers.push([name, value]));
    return {{ status: response.status, body: await response.text(), headers }};
}})()"#,
            target = serde_json::to_string(url.as_str())
                .map_err(|err| TierError::Unexpected(err.to_string()))?
        );
        let response: InPageResponse = evaluate_json(&page, &script).await?;
        let cookies = page_cookies(&page).await?;
        let harvested = domain_of(url).and_then(|domain| {
            harvest_session(
                &domain,
                &cookies,
                &self.session_config,
                Some(automation.user_agent()),
            )
        });
        debug!(url = %url, status = response.status, "in-session fetch finished");
        Ok(TierResult::classified(
            self.kind(),
            &self.classifier,
            RawOutcome::response(response.status, response.body),
            response.headers,
            cookies,
            started.elapsed(),
        )
        .with_harvested(harvested))
    }

    fn transport_failure(&self, failure: TransportFailure, started: Instant) -> TierResult {
        TierResult::classified(
            self.kind(),
            &self.classifier,
            RawOutcome::transport(failure),
            Vec::new(),
            Vec::new(),
            started.elapsed(),
        )
    }
}

async fn document_ready(page: &Page) -> BackendResult<bool> {
    let state: String = evaluate_json(page, "document.readyState").await?;
    Ok(state == "complete")
}

#[async_trait]
impl TierExecutor for BrowserHybridFetch {
    fn kind(&self) -> TierKind {
        TierKind::BrowserHybrid
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
            block_assets: options.block_assets.unwrap_or(self.config.block_assets),
            timeout: Some(timeout),
        };
        let automation = match self.launcher.launch(&launch).await {
            Ok(automation) => self.live.track(automation).await,
            Err(err) => {
                return TierResult::from_error(self.kind(), &self.classifier, err, started.elapsed())
            }
        };

        let outcome = tokio::time::timeout(timeout, self.run(&automation, url, session, started)).await;
        self.live.release(&automation).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                debug!(url = %url, error = %err, "hybrid fetch failed");
                TierResult::from_error(self.kind(), &self.classifier, err, started.elapsed())
            }
            Err(_) => self.transport_failure(TransportFailure::Timeout, started),
        }
    }

    async fn cleanup(&self) {
        let closed = self.live.shutdown_all().await;
        if closed > 0 {
            info!(tier = %self.kind(), closed, "released browsers left by cancelled fetches");
        }
    }
}
