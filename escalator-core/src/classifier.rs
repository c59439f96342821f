//! Maps raw fetch observations to a canonical [`ErrorCategory`].
//!
//! Classification happens in two stages: transport signals first (connection
//! failures, non-2xx status), then a content scan for strong bot-wall markers
//! that overrides an otherwise successful status. Executors never pick a
//! category themselves; they hand a [`RawOutcome`] to [`ErrorClassifier`].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ClassifierSection;

/// Bumped whenever [`STRONG_BOT_MARKERS`] changes so telemetry can be compared
/// across marker revisions.
pub const MARKER_LIST_VERSION: u32 = 3;

/// Phrases that only appear on bot-challenge pages. Weak words such as
/// "blocked" or "forbidden" are excluded on purpose: they show up in ordinary
/// articles and produced false escalations.
pub const STRONG_BOT_MARKERS: &[&str] = &[
    "bot detected",
    "unusual traffic",
    "verify you are human",
    "verify that you are human",
    "automated access",
    "checking your browser before accessing",
    "cf-browser-verification",
    "challenge-running",
];

const TURNSTILE_MARKERS: &[&str] = &["cf-turnstile", "challenges.cloudflare.com/turnstile"];
const RECAPTCHA_MARKERS: &[&str] = &["g-recaptcha", "www.google.com/recaptcha/api"];
const HCAPTCHA_MARKERS: &[&str] = &["h-captcha", "hcaptcha.com/1/api.js"];
const CLOUDFLARE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "_cf_chl_opt",
    "challenge-platform",
    "checking your browser",
    "just a moment...",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    DnsError,
    ConnectionRefused,
    Timeout,
    Blocked,
    RateLimited,
    ServerError,
    NetworkError,
    CaptchaRequired,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DnsError => "dns_error",
            ErrorCategory::ConnectionRefused => "connection_refused",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Blocked => "blocked",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::CaptchaRequired => "captcha_required",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Retried in place at the same tier.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCategory::Timeout | ErrorCategory::NetworkError)
    }

    /// No tier can change DNS resolution or reachability.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ErrorCategory::DnsError | ErrorCategory::ConnectionRefused
        )
    }

    pub fn is_defensive_block(&self) -> bool {
        matches!(self, ErrorCategory::Blocked | ErrorCategory::RateLimited)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ErrorCategory::DnsError => "the target host could not be resolved",
            ErrorCategory::ConnectionRefused => "the target refused the connection",
            ErrorCategory::Timeout => "the target did not answer in time",
            ErrorCategory::Blocked => "the target blocked automated access",
            ErrorCategory::RateLimited => "the target rate limited the request",
            ErrorCategory::ServerError => "the target answered with a server error",
            ErrorCategory::NetworkError => "the connection to the target failed",
            ErrorCategory::CaptchaRequired => "the target requires a human-solved challenge",
            ErrorCategory::Unknown => "the fetch failed for an unrecognized reason",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dns_error" => Ok(Self::DnsError),
            "connection_refused" => Ok(Self::ConnectionRefused),
            "timeout" => Ok(Self::Timeout),
            "blocked" => Ok(Self::Blocked),
            "rate_limited" => Ok(Self::RateLimited),
            "server_error" => Ok(Self::ServerError),
            "network_error" => Ok(Self::NetworkError),
            "captcha_required" => Ok(Self::CaptchaRequired),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown error category: {other}")),
        }
    }
}

/// Connection-level failure observed by an executor before any response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    Dns(String),
    ConnectionRefused(String),
    Timeout,
    Other(String),
}

impl TransportFailure {
    /// Sorts an error message from an HTTP client or browser into a failure kind.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("dns error")
            || lower.contains("failed to lookup address")
            || lower.contains("name or service not known")
            || lower.contains("no such host")
            || lower.contains("err_name_not_resolved")
        {
            TransportFailure::Dns(message.to_string())
        } else if lower.contains("connection refused") || lower.contains("err_connection_refused") {
            TransportFailure::ConnectionRefused(message.to_string())
        } else if lower.contains("timed out") || lower.contains("timeout") {
            TransportFailure::Timeout
        } else {
            TransportFailure::Other(message.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Cloudflare,
    Turnstile,
    Recaptcha,
    Hcaptcha,
    BotWall,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Cloudflare => "cloudflare",
            ChallengeKind::Turnstile => "turnstile",
            ChallengeKind::Recaptcha => "recaptcha",
            ChallengeKind::Hcaptcha => "hcaptcha",
            ChallengeKind::BotWall => "bot_wall",
        }
    }

    /// Puzzle widgets that no automated tier can pass.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            ChallengeKind::Turnstile | ChallengeKind::Recaptcha | ChallengeKind::Hcaptcha
        )
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an executor observed about one fetch, before interpretation.
#[derive(Debug, Clone, Default)]
pub struct RawOutcome {
    pub status: Option<u16>,
    pub transport: Option<TransportFailure>,
    pub body: Option<String>,
    /// Set by browser tiers that saw a puzzle widget they cannot solve.
    pub interactive_challenge: Option<ChallengeKind>,
}

impl RawOutcome {
    pub fn response(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn transport(failure: TransportFailure) -> Self {
        Self {
            transport: Some(failure),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    markers: Vec<String>,
    scan_limit: usize,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&ClassifierSection::default())
    }
}

impl ErrorClassifier {
    pub fn new(config: &ClassifierSection) -> Self {
        let mut markers = STRONG_BOT_MARKERS
            .iter()
            .map(|marker| marker.to_string())
            .collect::<Vec<_>>();
        markers.extend(
            config
                .extra_markers
                .iter()
                .map(|marker| marker.trim().to_lowercase())
                .filter(|marker| !marker.is_empty()),
        );
        Self {
            markers,
            scan_limit: config.scan_limit_chars.max(1),
        }
    }

    /// Returns `None` when the outcome is a genuine success.
    pub fn classify(&self, raw: &RawOutcome) -> Option<ErrorCategory> {
        if let Some(failure) = &raw.transport {
            return Some(match failure {
                TransportFailure::Dns(_) => ErrorCategory::DnsError,
                TransportFailure::ConnectionRefused(_) => ErrorCategory::ConnectionRefused,
                TransportFailure::Timeout => ErrorCategory::Timeout,
                TransportFailure::Other(_) => ErrorCategory::NetworkError,
            });
        }
        if raw.interactive_challenge.is_some() {
            return Some(ErrorCategory::CaptchaRequired);
        }

        let head = raw.body.as_deref().map(|body| self.head(body));
        match raw.status {
            Some(429) => return Some(ErrorCategory::RateLimited),
            Some(status) if !(200..400).contains(&status) => {
                let head = head.as_deref().unwrap_or_default();
                if rate_limit_regex().is_match(head) {
                    return Some(ErrorCategory::RateLimited);
                }
                return Some(match status {
                    401 | 403 | 407 => ErrorCategory::Blocked,
                    503 if detect_challenge(head).is_some() => ErrorCategory::Blocked,
                    500..=599 => ErrorCategory::ServerError,
                    _ => ErrorCategory::Unknown,
                });
            }
            _ => {}
        }

        match head {
            Some(head) if self.has_bot_marker(&head) => Some(ErrorCategory::Blocked),
            _ => None,
        }
    }

    pub fn has_bot_marker(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.markers.iter().any(|marker| lower.contains(marker.as_str()))
    }

    pub fn detect_challenge(&self, body: &str) -> Option<ChallengeKind> {
        let head = self.head(body);
        detect_challenge(&head).or_else(|| {
            if self.has_bot_marker(&head) {
                Some(ChallengeKind::BotWall)
            } else {
                None
            }
        })
    }

    fn head(&self, body: &str) -> String {
        body.chars().take(self.scan_limit).collect::<String>().to_lowercase()
    }
}

/// Convenience wrapper around the default marker list.
pub fn classify(raw: &RawOutcome) -> Option<ErrorCategory> {
    ErrorClassifier::default().classify(raw)
}

/// Names the challenge family a page belongs to, interactive widgets first.
pub fn detect_challenge(content: &str) -> Option<ChallengeKind> {
    let lower = content.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|marker| lower.contains(marker));
    if contains_any(TURNSTILE_MARKERS) {
        Some(ChallengeKind::Turnstile)
    } else if contains_any(HCAPTCHA_MARKERS) {
        Some(ChallengeKind::Hcaptcha)
    } else if contains_any(RECAPTCHA_MARKERS) {
        Some(ChallengeKind::Recaptcha)
    } else if contains_any(CLOUDFLARE_MARKERS) {
        Some(ChallengeKind::Cloudflare)
    } else {
        None
    }
}

fn rate_limit_regex() -> &'static Regex {
    static RATE_LIMIT: OnceLock<Regex> = OnceLock::new();
    RATE_LIMIT.get_or_init(|| {
        Regex::new(r"(?i)too many requests|rate[ -]?limit(ed)?\b|\berror 1015\b")
            .expect("rate limit pattern is valid")
    })
}
