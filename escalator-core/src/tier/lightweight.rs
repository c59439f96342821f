use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE,
    SET_COOKIE, USER_AGENT,
};
use reqwest::{redirect, Client};
use tracing::debug;
use url::Url;

use crate::classifier::{ErrorClassifier, RawOutcome, TransportFailure};
use crate::config::{LightweightSection, SessionSection};
use crate::session::{domain_of, harvest_session, parse_set_cookie, Cookie, Session};

use super::error::BackendResult;
use super::{FetchOptions, TierExecutor, TierKind, TierResult};

const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

struct FetchedParts {
    raw: RawOutcome,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    user_agent: String,
}

/// Tier A: one plain HTTP request with browser-like headers, no JavaScript.
#[derive(Debug, Clone)]
pub struct LightweightFetch {
    config: LightweightSection,
    session_config: SessionSection,
    classifier: Arc<ErrorClassifier>,
}

impl LightweightFetch {
    pub fn new(
        config: LightweightSection,
        session_config: SessionSection,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            config,
            session_config,
            classifier,
        }
    }

    fn timeout(&self, options: &FetchOptions) -> Duration {
        options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.timeout_seconds))
    }

    fn build_client(&self, options: &FetchOptions) -> BackendResult<Client> {
        let mut builder = Client::builder()
            .timeout(self.timeout(options))
            .redirect(redirect::Policy::limited(10));
        if let Some(proxy) = &options.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(builder.build()?)
    }

    fn request_headers(&self, options: &FetchOptions, session: Option<&Session>) -> (HeaderMap, String) {
        let user_agent = session
            .and_then(|session| session.user_agent.clone())
            .unwrap_or_else(|| self.config.user_agent.clone());
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
        if let Ok(value) = HeaderValue::from_str(&self.config.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Some(session) = session {
            if let Some(cookie) = session.cookie_header() {
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    headers.insert(COOKIE, value);
                }
            }
            if let Some(token) = &session.token {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }
        for (name, value) in &options.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = %name, "ignoring malformed request header"),
            }
        }
        (headers, user_agent)
    }

    async fn fetch(
        &self,
        url: &Url,
        options: &FetchOptions,
        session: Option<&Session>,
    ) -> BackendResult<FetchedParts> {
        let client = self.build_client(options)?;
        let (headers, user_agent) = self.request_headers(options, session);
        let domain = domain_of(url).unwrap_or_default();
        let response = client.get(url.clone()).headers(headers).send().await?;
        let status = response.status().as_u16();
        let cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| parse_set_cookie(value, &domain))
            .collect::<Vec<_>>();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect::<Vec<_>>();
        let body = response.text().await?;
        Ok(FetchedParts {
            raw: RawOutcome::response(status, body),
            headers,
            cookies,
            user_agent,
        })
    }
}

#[async_trait]
impl TierExecutor for LightweightFetch {
    fn kind(&self) -> TierKind {
        TierKind::Lightweight
    }

    async fn execute(
        &self,
        url: &Url,
        options: &FetchOptions,
        session: Option<&Session>,
    ) -> TierResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout(options), self.fetch(url, options, session)).await;
        match outcome {
            Ok(Ok(parts)) => {
                let harvested = domain_of(url).and_then(|domain| {
                    harvest_session(
                        &domain,
                        &parts.cookies,
                        &self.session_config,
                        Some(&parts.user_agent),
                    )
                });
                TierResult::classified(
                    self.kind(),
                    &self.classifier,
                    parts.raw,
                    parts.headers,
                    parts.cookies,
                    started.elapsed(),
                )
                .with_harvested(harvested)
            }
            Ok(Err(err)) => {
                debug!(url = %url, error = %err, "lightweight fetch failed");
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

    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSource;

    fn executor() -> LightweightFetch {
        LightweightFetch::new(
            LightweightSection::default(),
            SessionSection::default(),
            Arc::new(ErrorClassifier::default()),
        )
    }

    #[test]
    fn session_credentials_become_request_headers() {
        let session = Session::new(
            "example.com",
            vec![
                Cookie::new("cf_clearance", "X", ".example.com"),
                Cookie::new("__cf_bm", "Y", ".example.com"),
            ],
            Duration::from_secs(60),
            SessionSource::Manual,
        )
        .with_user_agent("solver-agent/2.0")
        .with_token("abc");
        let options = FetchOptions {
            headers: vec![
                ("X-Trace".into(), "1".into()),
                ("bad header".into(), "ignored".into()),
            ],
            ..Default::default()
        };
        let (headers, user_agent) = executor().request_headers(&options, Some(&session));
        assert_eq!(user_agent, "solver-agent/2.0");
        assert_eq!(headers.get(COOKIE).unwrap(), "cf_clearance=X; __cf_bm=Y");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
        assert_eq!(headers.get("x-trace").unwrap(), "1");
        assert_eq!(headers.len(), 6);
    }

    #[tokio::test]
    async fn unresolvable_host_is_classified_as_transport_failure() {
        let url = Url::parse("http://escalator-test.invalid/").unwrap();
        let options = FetchOptions {
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let result = executor().execute(&url, &options, None).await;
        assert!(!result.is_success());
        assert!(result.category.is_some());
    }
}
