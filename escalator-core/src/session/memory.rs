use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{normalize_domain, Session, SessionCache, SessionResult};

/// In-process cache for single-worker deployments and tests.
#[derive(Debug, Default)]
pub struct MemorySessionCache {
    entries: RwLock<HashMap<String, Session>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn get(&self, domain: &str) -> SessionResult<Option<Session>> {
        let now = Utc::now();
        let guard = self.entries.read().await;
        Ok(guard
            .get(&normalize_domain(domain))
            .filter(|session| session.is_valid_at(now))
            .cloned())
    }

    async fn put(&self, mut session: Session) -> SessionResult<bool> {
        let now = Utc::now();
        session.domain = normalize_domain(&session.domain);
        let mut guard = self.entries.write().await;
        if let Some(existing) = guard.get(&session.domain) {
            if existing.is_valid_at(now) && existing.expires_at > session.expires_at {
                return Ok(false);
            }
        }
        guard.insert(session.domain.clone(), session);
        Ok(true)
    }

    async fn invalidate(&self, domain: &str) -> SessionResult<bool> {
        let mut guard = self.entries.write().await;
        Ok(guard.remove(&normalize_domain(domain)).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> SessionResult<usize> {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, session| session.is_valid_at(now));
        Ok(before - guard.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::{Cookie, SessionSource};

    #[tokio::test]
    async fn fresher_write_supersedes() {
        let cache = MemorySessionCache::new();
        let short = Session::new(
            "example.com",
            vec![Cookie::new("cf_clearance", "a", "example.com")],
            Duration::from_secs(30),
            SessionSource::Harvested,
        );
        let long = Session::new(
            "example.com",
            vec![Cookie::new("cf_clearance", "b", "example.com")],
            Duration::from_secs(300),
            SessionSource::Manual,
        );
        assert!(cache.put(short.clone()).await.unwrap());
        assert!(cache.put(long).await.unwrap());
        assert!(!cache.put(short).await.unwrap());
        let current = cache.get("EXAMPLE.com").await.unwrap().unwrap();
        assert_eq!(current.cookies[0].value, "b");
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let cache = MemorySessionCache::new();
        let session = Session::new("a.test", Vec::new(), Duration::from_secs(10), SessionSource::Manual);
        let expiry = session.expires_at;
        cache.put(session).await.unwrap();
        cache
            .put(Session::new("b.test", Vec::new(), Duration::from_secs(600), SessionSource::Manual))
            .await
            .unwrap();
        assert_eq!(cache.purge_expired(expiry).await.unwrap(), 1);
        assert_eq!(cache.len().await, 1);
    }
}
