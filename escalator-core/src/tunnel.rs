use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE, USER_AGENT};
use reqwest::{redirect, Client, Method};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::captcha::{CaptchaEvent, EventFeed, EventType};
use crate::config::{SessionSection, TunnelSection};
use crate::session::{
    domain_of, parse_set_cookie, Cookie, Session, SessionCache, SessionError, SessionSource,
};
use crate::tier::error_chain;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel target: {0}")]
    InvalidUrl(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("session cache error: {0}")]
    Session(#[from] SessionError),
}

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        TunnelError::Upstream(error_chain(&err))
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: u16,
    /// Upstream headers minus the framing restrictions.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Session written to the cache from this response, if any.
    pub captured: Option<Session>,
}

/// Pass-through fetch for an operator viewing the live target. Credential
/// cookies in upstream responses go straight into the session cache.
#[derive(Clone)]
pub struct ProxyTunnel {
    config: TunnelSection,
    session_config: SessionSection,
    sessions: Arc<dyn SessionCache>,
    events: Arc<dyn EventFeed>,
    client: Client,
}

impl ProxyTunnel {
    pub fn new(
        config: TunnelSection,
        session_config: SessionSection,
        sessions: Arc<dyn SessionCache>,
        events: Arc<dyn EventFeed>,
    ) -> TunnelResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            config,
            session_config,
            sessions,
            events,
            client,
        })
    }

    pub async fn fetch(&self, url: &str, headers: &[(String, String)]) -> TunnelResult<TunnelResponse> {
        self.request(Method::GET, url, headers, None).await
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> TunnelResult<TunnelResponse> {
        let target = Url::parse(url).map_err(|err| TunnelError::InvalidUrl(format!("{url}: {err}")))?;
        let domain = domain_of(&target)
            .ok_or_else(|| TunnelError::InvalidUrl(format!("{url}: missing host")))?;

        let mut request = self
            .client
            .request(method, target.clone())
            .headers(self.upstream_headers(headers));
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect::<Vec<_>>();
        let headers = strip_framing_headers(response.headers(), &self.config.strip_headers);
        let body = response.bytes().await?.to_vec();

        let captured = self.capture(&domain, &set_cookies).await?;
        debug!(url = %target, status, bytes = body.len(), "tunnel response");
        Ok(TunnelResponse {
            status,
            headers,
            body,
            captured,
        })
    }

    /// Merges credential cookies from `set_cookies` into the domain's session
    /// and publishes `session_cached`. Non-credential cookies are ignored.
    pub async fn capture(&self, domain: &str, set_cookies: &[String]) -> TunnelResult<Option<Session>> {
        let credentials = set_cookies
            .iter()
            .filter_map(|header| parse_set_cookie(header, domain))
            .filter(|cookie| self.session_config.is_credential_cookie(&cookie.name))
            .collect::<Vec<_>>();
        if credentials.is_empty() {
            return Ok(None);
        }

        let existing = self.sessions.get(domain).await?;
        let session = merge_credentials(
            domain,
            existing.as_ref(),
            credentials,
            self.session_config.ttl().min(self.session_config.max_ttl()),
            &self.config.user_agent,
        );
        self.sessions.put(session.clone()).await?;
        info!(domain = %session.domain, cookies = session.cookies.len(), "credential captured through tunnel");
        let event = CaptchaEvent::for_session(EventType::SessionCached, &session, None);
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "failed to publish tunnel capture");
        }
        Ok(Some(session))
    }

    fn upstream_headers(&self, headers: &[(String, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
            map.insert(USER_AGENT, value);
        }
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => debug!(header = %name, "dropping malformed tunnel header"),
            }
        }
        map
    }
}

/// Upstream headers without the ones that stop the page rendering inside the
/// operator's frame.
pub fn strip_framing_headers(headers: &HeaderMap, strip: &[String]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !strip
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(name.as_str()))
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn merge_credentials(
    domain: &str,
    existing: Option<&Session>,
    credentials: Vec<Cookie>,
    ttl: Duration,
    user_agent: &str,
) -> Session {
    let mut cookies = existing
        .map(|session| session.cookies.clone())
        .unwrap_or_default();
    for cookie in credentials {
        match cookies.iter_mut().find(|current| current.name == cookie.name) {
            Some(current) => *current = cookie,
            None => cookies.push(cookie),
        }
    }
    let mut session = Session::new(domain, cookies, ttl, SessionSource::Harvested);
    session.user_agent = existing
        .and_then(|session| session.user_agent.clone())
        .or_else(|| Some(user_agent.to_string()));
    session.token = existing.and_then(|session| session.token.clone());
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::BroadcastEventFeed;
    use crate::session::MemorySessionCache;

    fn tunnel() -> (ProxyTunnel, Arc<MemorySessionCache>, Arc<BroadcastEventFeed>) {
        let sessions = Arc::new(MemorySessionCache::new());
        let events = Arc::new(BroadcastEventFeed::default());
        let tunnel = ProxyTunnel::new(
            TunnelSection::default(),
            SessionSection::default(),
            sessions.clone(),
            events.clone(),
        )
        .unwrap();
        (tunnel, sessions, events)
    }

    #[test]
    fn framing_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert("content-security-policy", HeaderValue::from_static("frame-ancestors 'none'"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        let kept = strip_framing_headers(&headers, &TunnelSection::default().strip_headers);
        assert_eq!(kept, vec![("content-type".to_string(), "text/html".to_string())]);
    }

    #[tokio::test]
    async fn credential_cookies_are_cached_and_announced() {
        let (tunnel, sessions, events) = tunnel();
        let mut subscription = events.subscribe().await.unwrap();
        let captured = tunnel
            .capture(
                "example.com",
                &[
                    "theme=dark; Path=/".to_string(),
                    "cf_clearance=abc; Domain=.example.com; Secure; HttpOnly".to_string(),
                ],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(captured.cookies.len(), 1);

        let cached = sessions.get("example.com").await.unwrap().unwrap();
        assert_eq!(cached.cookie("cf_clearance").unwrap().value, "abc");
        assert!(cached.cookie("theme").is_none());
        assert_eq!(cached.source, SessionSource::Harvested);

        let event = subscription.next().await.unwrap();
        assert!(event.is(EventType::SessionCached, "example.com"));
        assert!(event.uuid.is_none());
    }

    #[tokio::test]
    async fn later_cookies_merge_into_the_cached_session() {
        let (tunnel, sessions, _) = tunnel();
        tunnel
            .capture("example.com", &["__cf_bm=one".to_string()])
            .await
            .unwrap();
        tunnel
            .capture("example.com", &["cf_clearance=two".to_string()])
            .await
            .unwrap();
        let cached = sessions.get("example.com").await.unwrap().unwrap();
        assert_eq!(cached.cookies.len(), 2);
        assert!(tunnel
            .capture("example.com", &["theme=dark".to_string()])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn relative_targets_are_rejected() {
        let (tunnel, _, _) = tunnel();
        assert!(matches!(
            tunnel.fetch("/not-absolute", &[]).await,
            Err(TunnelError::InvalidUrl(_))
        ));
    }
}
