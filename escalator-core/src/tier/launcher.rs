use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ChromiumSection, DEFAULT_USER_AGENT};
use crate::session::{Cookie, Session};

use super::error::{BackendResult, TierError};

#[derive(Debug, Clone)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub proxy: Option<String>,
    pub block_assets: bool,
    pub timeout: Option<Duration>,
}

/// Starts disposable Chromium instances for the browser tiers.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<ChromiumSection>,
}

impl BrowserLauncher {
    pub fn new(config: ChromiumSection) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ChromiumSection {
        &self.config
    }

    pub async fn launch(&self, options: &LaunchOptions) -> BackendResult<BrowserAutomation> {
        let mut rng = StdRng::from_entropy();
        let viewport = self.select_viewport(&mut rng);
        let user_agent = self.select_user_agent(&mut rng);
        let profile_dir = std::env::temp_dir().join(format!("escalator-profile-{}", Uuid::new_v4()));
        let chromium_config =
            self.build_chromium_config(&profile_dir, &viewport, &user_agent, options)?;
        info!(
            ua = %user_agent,
            width = viewport.width,
            height = viewport.height,
            headless = self.config.headless,
            proxy = options.proxy.as_deref().unwrap_or("none"),
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| TierError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(BrowserAutomation {
            browser: AsyncMutex::new(browser),
            handler_task: Mutex::new(Some(handler_task)),
            closed: AtomicBool::new(false),
            config: Arc::clone(&self.config),
            profile_dir,
            viewport,
            user_agent,
            proxy: options.proxy.clone(),
        })
    }

    fn select_viewport(&self, rng: &mut StdRng) -> ViewportSpec {
        let base = self
            .config
            .resolutions
            .choose(rng)
            .cloned()
            .unwrap_or([1366, 768]);
        let jitter = self.config.jitter_pixels as i32;
        let width = (base[0] as i32 + rng.gen_range(-jitter..=jitter)).clamp(640, 2560) as u32;
        let height = (base[1] as i32 + rng.gen_range(-jitter..=jitter)).clamp(480, 1600) as u32;
        ViewportSpec { width, height }
    }

    fn select_user_agent(&self, rng: &mut StdRng) -> String {
        self.config
            .user_agents
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    fn build_chromium_config(
        &self,
        profile_dir: &Path,
        viewport: &ViewportSpec,
        user_agent: &str,
        options: &LaunchOptions,
    ) -> BackendResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir)
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            });

        if let Some(path) = &self.config.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = options.timeout {
            builder = builder.request_timeout(timeout);
        }

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!("--window-size={},{}", viewport.width, viewport.height),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-features=AutomationControlled".to_string(),
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
        ];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(lang) = &self.config.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(accept) = &self.config.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        if let Some(proxy) = &options.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        if options.block_assets {
            args.push("--blink-settings=imagesEnabled=false".into());
            args.push("--disable-remote-fonts".into());
        }

        builder = builder.args(args);
        builder.build().map_err(TierError::Configuration)
    }
}

#[derive(Debug)]
pub struct BrowserAutomation {
    browser: AsyncMutex<Browser>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    config: Arc<ChromiumSection>,
    profile_dir: PathBuf,
    viewport: ViewportSpec,
    user_agent: String,
    proxy: Option<String>,
}

impl BrowserAutomation {
    pub fn viewport(&self) -> &ViewportSpec {
        &self.viewport
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Opens a stealth-configured tab carrying the cached credential, if any.
    pub async fn open_page(&self, session: Option<&Session>) -> BackendResult<Page> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page(CreateTargetParams::new("about:blank"))
                .await?
        };
        let user_agent = session
            .and_then(|session| session.user_agent.clone())
            .unwrap_or_else(|| self.user_agent.clone());
        page.enable_stealth_mode_with_agent(&user_agent).await?;

        let mut params_builder = SetUserAgentOverrideParams::builder().user_agent(user_agent);
        if let Some(accept) = &self.config.accept_language {
            params_builder = params_builder.accept_language(accept.clone());
        }
        let params = params_builder.build().map_err(TierError::Configuration)?;
        page.set_user_agent(params).await?;

        if let Some(lang) = &self.config.lang {
            let languages_script = format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\nObject.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en'] }});"
            );
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(languages_script)
                    .build()
                    .map_err(TierError::Configuration)?,
            )
            .await?;
        }

        if let Some(session) = session {
            let cookies = session
                .cookies
                .iter()
                .map(cookie_param)
                .collect::<BackendResult<Vec<_>>>()?;
            if !cookies.is_empty() {
                page.set_cookies(cookies).await?;
            }
        }
        Ok(page)
    }

    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut browser = self.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close browser gracefully");
            }
        }
        let handle = self
            .handler_task
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        if let Err(err) = std::fs::remove_dir_all(&self.profile_dir) {
            debug!(error = %err, path = %self.profile_dir.display(), "profile directory not removed");
        }
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(
                profile = %self.profile_dir.display(),
                "browser dropped without explicit shutdown"
            );
        }
    }
}

/// Instances a tier has launched and not yet shut down. A cancelled `execute`
/// leaves its browser here for `cleanup` to reap.
#[derive(Debug, Default)]
pub struct LiveBrowsers {
    entries: AsyncMutex<Vec<Arc<BrowserAutomation>>>,
}

impl LiveBrowsers {
    pub async fn track(&self, automation: BrowserAutomation) -> Arc<BrowserAutomation> {
        let automation = Arc::new(automation);
        self.entries.lock().await.push(Arc::clone(&automation));
        automation
    }

    pub async fn release(&self, automation: &Arc<BrowserAutomation>) {
        automation.shutdown().await;
        self.entries
            .lock()
            .await
            .retain(|entry| !Arc::ptr_eq(entry, automation));
    }

    pub async fn shutdown_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.entries.lock().await);
        let count = drained.len();
        for automation in drained {
            automation.shutdown().await;
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn cookie_param(cookie: &Cookie) -> BackendResult<CookieParam> {
    CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only)
        .build()
        .map_err(TierError::Configuration)
}

pub(crate) async fn navigate(page: &Page, url: &str, referrer: Option<&str>) -> BackendResult<()> {
    let mut builder = NavigateParams::builder().url(url);
    if let Some(referrer) = referrer {
        builder = builder.referrer(referrer);
    }
    let params = builder.build().map_err(TierError::Configuration)?;
    page.goto(params).await?;
    page.wait_for_navigation().await?;
    Ok(())
}

pub(crate) async fn evaluate_json<T: DeserializeOwned>(page: &Page, script: &str) -> BackendResult<T> {
    let params = EvaluateParams::builder()
        .expression(script)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(TierError::Configuration)?;
    page.evaluate_expression(params)
        .await?
        .into_value::<T>()
        .map_err(|err| TierError::Unexpected(format!("failed to decode script result: {err}")))
}

/// Chromium parks failed navigations on an internal error page.
pub(crate) async fn landed_on_error_page(page: &Page) -> BackendResult<bool> {
    Ok(page
        .url()
        .await?
        .map(|url| url.starts_with("chrome-error://"))
        .unwrap_or(false))
}

/// Status of the main document; Chromium exposes it through the navigation timing entry.
pub(crate) async fn navigation_status(page: &Page) -> BackendResult<u16> {
    let status: Option<u16> = evaluate_json(
        page,
        "(() => { const nav = performance.getEntriesByType('navigation')[0]; return nav && nav.responseStatus ? nav.responseStatus : null; })()",
    )
    .await?;
    Ok(status.unwrap_or(200))
}

pub(crate) async fn page_cookies(page: &Page) -> BackendResult<Vec<Cookie>> {
    Ok(page
        .get_cookies()
        .await?
        .into_iter()
        .map(|cookie| Cookie {
            name: cookie.name,
            value: cookie.value,
            domain: cookie.domain,
            path: cookie.path,
            secure: cookie.secure,
            http_only: cookie.http_only,
        })
        .collect())
}
