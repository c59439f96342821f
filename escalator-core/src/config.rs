use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::tier::TierKind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EscalatorConfig {
    pub orchestrator: OrchestratorSection,
    pub retry: RetrySection,
    pub tiers: TiersSection,
    pub chromium: ChromiumSection,
    pub classifier: ClassifierSection,
    pub session: SessionSection,
    pub captcha: CaptchaSection,
    pub tunnel: TunnelSection,
    pub storage: StorageSection,
    pub observability: ObservabilitySection,
}

impl EscalatorConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.storage.base_dir).join(path)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.start_tier > self.orchestrator.max_tier {
            return Err(ConfigError::Invalid {
                field: "orchestrator.start_tier",
                reason: format!(
                    "start tier {} is above max tier {}",
                    self.orchestrator.start_tier, self.orchestrator.max_tier
                ),
            });
        }
        if self.session.ttl_seconds > self.session.max_ttl_seconds {
            return Err(ConfigError::Invalid {
                field: "session.ttl_seconds",
                reason: "default ttl exceeds max_ttl_seconds".to_string(),
            });
        }
        if !(1..=10).contains(&self.captcha.default_priority) {
            return Err(ConfigError::Invalid {
                field: "captcha.default_priority",
                reason: format!("{} is outside 1..=10", self.captcha.default_priority),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub start_tier: TierKind,
    pub max_tier: TierKind,
    /// Hand `captcha_required` from the top tier to a human instead of failing.
    pub await_resolution: bool,
    pub invalidate_blocked_sessions: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            start_tier: TierKind::Lightweight,
            max_tier: TierKind::FullBrowser,
            await_resolution: true,
            invalidate_blocked_sessions: true,
        }
    }
}

/// In-tier retry for transient categories only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub schedule_ms: Vec<u64>,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            schedule_ms: vec![500, 1500],
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TiersSection {
    pub lightweight: LightweightSection,
    pub browser_hybrid: BrowserHybridSection,
    pub full_browser: FullBrowserSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightweightSection {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub accept_language: String,
}

impl Default for LightweightSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 90,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserHybridSection {
    pub enabled: bool,
    pub timeout_seconds: u64,
    /// Budget for recognizing a challenge it cannot pass before reporting `skip`.
    pub skip_window_ms: u64,
    pub warmup_path: String,
    pub block_assets: bool,
}

impl Default for BrowserHybridSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 120,
            skip_window_ms: 500,
            warmup_path: "/".to_string(),
            block_assets: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FullBrowserSection {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub referrer: Option<String>,
    pub human_simulation: bool,
    pub challenge_wait_seconds: u64,
    pub human: HumanSimulationSection,
}

impl Default for FullBrowserSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 120,
            referrer: Some("https://www.google.com/".to_string()),
            human_simulation: true,
            challenge_wait_seconds: 8,
            human: HumanSimulationSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HumanSimulationSection {
    pub mouse_speed_min_px_s: u32,
    pub mouse_speed_max_px_s: u32,
    pub mouse_jitter_px: u32,
    pub scroll_burst_px: [u32; 2],
    pub scroll_pause_ms: [u32; 2],
    pub idle_duration_ms: [u32; 2],
    pub scroll_bursts: u32,
}

impl Default for HumanSimulationSection {
    fn default() -> Self {
        Self {
            mouse_speed_min_px_s: 600,
            mouse_speed_max_px_s: 1400,
            mouse_jitter_px: 3,
            scroll_burst_px: [180, 520],
            scroll_pause_ms: [250, 900],
            idle_duration_ms: [400, 1600],
            scroll_bursts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_agents: Vec<String>,
    pub resolutions: Vec<[u32; 2]>,
    pub jitter_pixels: u32,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            disable_gpu: true,
            user_agents: vec![DEFAULT_USER_AGENT.to_string()],
            resolutions: vec![[1366, 768], [1440, 900], [1920, 1080]],
            jitter_pixels: 12,
            lang: Some("en-US".to_string()),
            accept_language: Some("en-US,en;q=0.9".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    /// Appended to the built-in bot-wall marker list.
    pub extra_markers: Vec<String>,
    pub scan_limit_chars: usize,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            extra_markers: Vec::new(),
            scan_limit_chars: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    /// Cookie names that make a response worth caching as a Session.
    pub credential_cookies: Vec<String>,
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_seconds)
    }

    pub fn is_credential_cookie(&self, name: &str) -> bool {
        self.credential_cookies
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(name))
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_seconds: 900,
            max_ttl_seconds: 3600,
            credential_cookies: vec![
                "cf_clearance".to_string(),
                "__cf_bm".to_string(),
                "cf_chl_rc_m".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaSection {
    pub task_timeout_seconds: u64,
    pub lock_ttl_seconds: u64,
    pub default_priority: u8,
    pub wait_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    /// Event log rows older than this are pruned by the expiry sweep.
    pub event_retention_seconds: u64,
}

impl CaptchaSection {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_seconds)
    }
}

impl Default for CaptchaSection {
    fn default() -> Self {
        Self {
            task_timeout_seconds: 600,
            lock_ttl_seconds: 1800,
            default_priority: 5,
            wait_timeout_seconds: 900,
            poll_interval_ms: 250,
            event_retention_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub strip_headers: Vec<String>,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            strip_headers: [
                "x-frame-options",
                "content-security-policy",
                "content-security-policy-report-only",
                "x-content-type-options",
                "transfer-encoding",
                "content-encoding",
            ]
            .iter()
            .map(|value| value.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub base_dir: String,
    pub database: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            database: "data/escalator.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub enabled: bool,
    pub failure_log: String,
    pub metrics_db: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_log: "logs/tier_failures.jsonl".to_string(),
            metrics_db: "data/metrics.sqlite".to_string(),
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub fn load_escalator_config<P: AsRef<Path>>(path: P) -> Result<EscalatorConfig> {
    let config: EscalatorConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/escalator.toml");
        let config = load_escalator_config(path).expect("config should parse");
        assert_eq!(config.orchestrator.start_tier, TierKind::Lightweight);
        assert_eq!(config.orchestrator.max_tier, TierKind::FullBrowser);
        assert_eq!(config.tiers.browser_hybrid.skip_window_ms, 500);
        assert_eq!(config.session.ttl_seconds, 900);
        assert!(config.session.is_credential_cookie("CF_CLEARANCE"));
        assert!(config.chromium.user_agents.len() >= 2);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: EscalatorConfig = toml::from_str("[captcha]\nlock_ttl_seconds = 60\n").unwrap();
        assert_eq!(config.captcha.lock_ttl_seconds, 60);
        assert_eq!(config.captcha.task_timeout_seconds, 600);
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn inverted_tier_range_is_rejected() {
        let config: EscalatorConfig = toml::from_str(
            "[orchestrator]\nstart_tier = \"full_browser\"\nmax_tier = \"lightweight\"\n",
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "orchestrator.start_tier", .. })
        ));
    }
}
