mod memory;
mod store;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::SessionSection;

pub use memory::MemorySessionCache;
pub use store::{SqliteSessionStore, SqliteSessionStoreBuilder};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open session database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on session database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("session path not configured")]
    MissingStore,
    #[error("failed to encode session cookies: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid session source: {0}")]
    InvalidSource(String),
    #[error("session task join error: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::Join(err.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            secure: true,
            http_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Harvested,
    Manual,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Harvested => "harvested",
            SessionSource::Manual => "manual",
        }
    }
}

impl fmt::Display for SessionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionSource {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "harvested" => Ok(Self::Harvested),
            "manual" => Ok(Self::Manual),
            other => Err(SessionError::InvalidSource(other.to_string())),
        }
    }
}

/// Credential bundle cached per domain. Only trust it while `now < expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub domain: String,
    pub cookies: Vec<Cookie>,
    pub user_agent: Option<String>,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: SessionSource,
}

impl Session {
    pub fn new(
        domain: impl AsRef<str>,
        cookies: Vec<Cookie>,
        ttl: Duration,
        source: SessionSource,
    ) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            domain: normalize_domain(domain.as_ref()),
            cookies,
            user_agent: None,
            token: None,
            created_at,
            expires_at: created_at + ttl,
            source,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }

    /// `Cookie` request header value, or `None` when the bundle has no cookies.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|cookie| cookie.name == name)
    }
}

/// Shared credential store keyed by domain.
///
/// Writes follow last-write-wins with expiry as the tie breaker: a write whose
/// expiry is earlier than a still-valid stored entry is ignored.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Returns the session only while it is still valid.
    async fn get(&self, domain: &str) -> SessionResult<Option<Session>>;

    /// Returns `false` when a fresher entry kept precedence.
    async fn put(&self, session: Session) -> SessionResult<bool>;

    async fn invalidate(&self, domain: &str) -> SessionResult<bool>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> SessionResult<usize>;
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Host plus explicit port, the key every store uses.
pub fn domain_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let domain = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Some(normalize_domain(&domain))
}

/// Builds a harvested session from the credential cookies among `cookies`,
/// or `None` when none of them is a credential.
pub fn harvest_session(
    domain: &str,
    cookies: &[Cookie],
    config: &SessionSection,
    user_agent: Option<&str>,
) -> Option<Session> {
    let credentials = cookies
        .iter()
        .filter(|cookie| config.is_credential_cookie(&cookie.name))
        .cloned()
        .collect::<Vec<_>>();
    if credentials.is_empty() {
        return None;
    }
    let ttl = config.ttl().min(config.max_ttl());
    let mut session = Session::new(domain, credentials, ttl, SessionSource::Harvested);
    session.user_agent = user_agent.map(str::to_string);
    Some(session)
}

/// Parses one `Set-Cookie` header. Cookies without a `Domain` attribute are
/// scoped to `default_domain`.
pub fn parse_set_cookie(header: &str, default_domain: &str) -> Option<Cookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut cookie = Cookie {
        name: name.to_string(),
        value: value.trim().trim_matches('"').to_string(),
        domain: default_domain.to_string(),
        path: default_cookie_path(),
        secure: false,
        http_only: false,
    };
    for attribute in parts {
        let (key, val) = match attribute.split_once('=') {
            Some((key, val)) => (key.trim(), val.trim()),
            None => (attribute.trim(), ""),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" if !val.is_empty() => cookie.domain = val.to_string(),
            "path" if !val.is_empty() => cookie.path = val.to_string(),
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            _ => {}
        }
    }
    Some(cookie)
}
