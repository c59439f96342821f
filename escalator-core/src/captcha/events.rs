use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

use crate::session::Session;
use crate::sqlite::{from_millis, millis};

use super::error::{CaptchaError, CaptchaResult};
use super::store::SqliteCaptchaStore;
use super::task::CaptchaTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskAssigned,
    TaskSolving,
    TaskSolved,
    TaskFailed,
    TaskUnsolvable,
    TaskExpired,
    SessionCached,
    SessionExpired,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "task_created",
            EventType::TaskAssigned => "task_assigned",
            EventType::TaskSolving => "task_solving",
            EventType::TaskSolved => "task_solved",
            EventType::TaskFailed => "task_failed",
            EventType::TaskUnsolvable => "task_unsolvable",
            EventType::TaskExpired => "task_expired",
            EventType::SessionCached => "session_cached",
            EventType::SessionExpired => "session_expired",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CaptchaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_created" => Ok(Self::TaskCreated),
            "task_assigned" => Ok(Self::TaskAssigned),
            "task_solving" => Ok(Self::TaskSolving),
            "task_solved" => Ok(Self::TaskSolved),
            "task_failed" => Ok(Self::TaskFailed),
            "task_unsolvable" => Ok(Self::TaskUnsolvable),
            "task_expired" => Ok(Self::TaskExpired),
            "session_cached" => Ok(Self::SessionCached),
            "session_expired" => Ok(Self::SessionExpired),
            other => Err(CaptchaError::InvalidStatus(format!("unknown event {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<i64>,
    pub uuid: Option<Uuid>,
    pub domain: String,
    #[serde(default)]
    pub payload: Value,
}

impl CaptchaEvent {
    pub fn for_task(event_type: EventType, task: &CaptchaTask) -> Self {
        let payload = match event_type {
            EventType::TaskCreated => json!({
                "url": task.url,
                "challenge_type": task.challenge_type,
                "priority": task.priority,
            }),
            EventType::TaskAssigned | EventType::TaskSolving => json!({
                "assigned_to": task.assigned_to,
                "lock_expires_at": task.lock_expires_at,
            }),
            EventType::TaskSolved => json!({
                "solution_type": task.solution.as_ref().map(|solution| solution.solution_type.as_str()),
            }),
            EventType::TaskFailed | EventType::TaskUnsolvable => json!({
                "reason": task.error_message,
            }),
            _ => json!({}),
        };
        Self {
            event_type,
            timestamp: Utc::now(),
            task_id: Some(task.id),
            uuid: Some(task.uuid),
            domain: task.domain.clone(),
            payload,
        }
    }

    /// `task` is `None` when the session arrived through the tunnel or a tier.
    pub fn for_session(
        event_type: EventType,
        session: &Session,
        task: Option<&CaptchaTask>,
    ) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            task_id: task.map(|task| task.id),
            uuid: task.map(|task| task.uuid),
            domain: session.domain.clone(),
            payload: json!({
                "source": session.source.as_str(),
                "cookies": session.cookies.iter().map(|cookie| cookie.name.as_str()).collect::<Vec<_>>(),
                "expires_at": session.expires_at,
            }),
        }
    }

    pub fn is(&self, event_type: EventType, domain: &str) -> bool {
        self.event_type == event_type && self.domain == domain
    }
}

pub struct EventSubscription {
    inner: Pin<Box<dyn Stream<Item = CaptchaEvent> + Send>>,
}

impl EventSubscription {
    pub fn new(stream: impl Stream<Item = CaptchaEvent> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<CaptchaEvent> {
        self.inner.next().await
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription").finish_non_exhaustive()
    }
}

/// Lifecycle events for tasks and sessions. Subscribers only see events
/// published after they subscribed.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn publish(&self, event: CaptchaEvent) -> CaptchaResult<()>;

    async fn subscribe(&self) -> CaptchaResult<EventSubscription>;
}

/// Single-process feed over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventFeed {
    sender: broadcast::Sender<CaptchaEvent>,
}

impl BroadcastEventFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastEventFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventFeed for BroadcastEventFeed {
    async fn publish(&self, event: CaptchaEvent) -> CaptchaResult<()> {
        // No receivers is not an error: nobody is waiting.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self) -> CaptchaResult<EventSubscription> {
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|item| async move { item.ok() });
        Ok(EventSubscription::new(stream))
    }
}

/// Durable append-only event log shared through the captcha database.
/// Subscribers poll from the last row id they saw, so a worker in one process
/// wakes on a submission made by an operator in another.
#[derive(Debug, Clone)]
pub struct SqliteEventFeed {
    store: SqliteCaptchaStore,
    poll_interval: Duration,
}

impl SqliteEventFeed {
    pub fn new(store: SqliteCaptchaStore, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    pub fn append(&self, event: &CaptchaEvent) -> CaptchaResult<i64> {
        let conn = self.store.open()?;
        conn.execute(
            "INSERT INTO captcha_events (event_type, ts, task_id, uuid, domain, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_type.as_str(),
                millis(event.timestamp),
                event.task_id,
                event.uuid.map(|uuid| uuid.to_string()),
                event.domain,
                serde_json::to_string(&event.payload)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_id(&self) -> CaptchaResult<i64> {
        let conn = self.store.open()?;
        let id: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM captcha_events", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    /// Events with a row id above `after`, oldest first.
    pub fn since(&self, after: i64, limit: usize) -> CaptchaResult<Vec<(i64, CaptchaEvent)>> {
        let conn = self.store.open()?;
        read_events(&conn, after, limit)
    }

    /// Removes rows older than `before`; returns how many went.
    pub fn prune_before(&self, before: DateTime<Utc>) -> CaptchaResult<usize> {
        self.store.prune_events_before(before)
    }

    /// Most recent events, newest first.
    pub fn recent(&self, domain: Option<&str>, limit: usize) -> CaptchaResult<Vec<CaptchaEvent>> {
        let conn = self.store.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, ts, task_id, uuid, domain, payload FROM captcha_events
             WHERE (?1 IS NULL OR domain = ?1) ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![domain, limit as i64], StoredEvent::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|row| row.decode().map(|(_, event)| event))
            .collect()
    }
}

#[async_trait]
impl EventFeed for SqliteEventFeed {
    async fn publish(&self, event: CaptchaEvent) -> CaptchaResult<()> {
        let feed = self.clone();
        tokio::task::spawn_blocking(move || feed.append(&event)).await??;
        Ok(())
    }

    async fn subscribe(&self) -> CaptchaResult<EventSubscription> {
        let feed = self.clone();
        let start = tokio::task::spawn_blocking(move || feed.latest_id()).await??;
        let state = (self.clone(), start, VecDeque::new());
        let stream = stream::unfold(state, |(feed, mut cursor, mut buffer)| async move {
            loop {
                if let Some((id, event)) = buffer.pop_front() {
                    cursor = id;
                    return Some((event, (feed, cursor, buffer)));
                }
                tokio::time::sleep(feed.poll_interval).await;
                let reader = feed.clone();
                match tokio::task::spawn_blocking(move || reader.since(cursor, 128)).await {
                    Ok(Ok(events)) => buffer.extend(events),
                    Ok(Err(err)) => warn!(error = %err, "failed to poll captcha events"),
                    Err(err) => warn!(error = %err, "captcha event poll task failed"),
                }
            }
        });
        Ok(EventSubscription::new(stream))
    }
}

fn read_events(conn: &Connection, after: i64, limit: usize) -> CaptchaResult<Vec<(i64, CaptchaEvent)>> {
    let mut stmt = conn.prepare(
        "SELECT id, event_type, ts, task_id, uuid, domain, payload FROM captcha_events
         WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![after, limit as i64], StoredEvent::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(StoredEvent::decode).collect()
}

struct StoredEvent {
    id: i64,
    event_type: String,
    ts: i64,
    task_id: Option<i64>,
    uuid: Option<String>,
    domain: String,
    payload: String,
}

impl StoredEvent {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            ts: row.get(2)?,
            task_id: row.get(3)?,
            uuid: row.get(4)?,
            domain: row.get(5)?,
            payload: row.get(6)?,
        })
    }

    fn decode(self) -> CaptchaResult<(i64, CaptchaEvent)> {
        let uuid = self
            .uuid
            .map(|raw| Uuid::parse_str(&raw).map_err(|err| CaptchaError::InvalidUuid(err.to_string())))
            .transpose()?;
        Ok((
            self.id,
            CaptchaEvent {
                event_type: self.event_type.parse()?,
                timestamp: from_millis(self.ts),
                task_id: self.task_id,
                uuid,
                domain: self.domain,
                payload: serde_json::from_str(&self.payload)?,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Cookie, SessionSource};
    use tempfile::tempdir;

    fn session(domain: &str) -> Session {
        Session::new(
            domain,
            vec![Cookie::new("cf_clearance", "X", ".example.com")],
            Duration::from_secs(60),
            SessionSource::Manual,
        )
    }

    #[tokio::test]
    async fn broadcast_feed_delivers_to_live_subscribers() {
        let feed = BroadcastEventFeed::default();
        feed.publish(CaptchaEvent::for_session(
            EventType::SessionCached,
            &session("early.test"),
            None,
        ))
        .await
        .unwrap();
        let mut subscription = feed.subscribe().await.unwrap();
        feed.publish(CaptchaEvent::for_session(
            EventType::SessionCached,
            &session("example.com"),
            None,
        ))
        .await
        .unwrap();
        let event = subscription.next().await.unwrap();
        assert!(event.is(EventType::SessionCached, "example.com"));
        assert_eq!(event.payload["cookies"][0], "cf_clearance");
    }

    #[tokio::test]
    async fn sqlite_feed_starts_at_join_position() {
        let dir = tempdir().unwrap();
        let store = SqliteCaptchaStore::new(dir.path().join("captcha.sqlite")).unwrap();
        store.initialize().unwrap();
        let feed = SqliteEventFeed::new(store, Duration::from_millis(10));

        feed.publish(CaptchaEvent::for_session(
            EventType::SessionCached,
            &session("old.test"),
            None,
        ))
        .await
        .unwrap();
        let mut subscription = feed.subscribe().await.unwrap();

        let writer = feed.clone();
        tokio::spawn(async move {
            writer
                .publish(CaptchaEvent::for_session(
                    EventType::SessionExpired,
                    &session("example.com"),
                    None,
                ))
                .await
                .unwrap();
        });

        let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is(EventType::SessionExpired, "example.com"));
        assert_eq!(feed.recent(None, 10).unwrap().len(), 2);
        assert_eq!(feed.recent(Some("old.test"), 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_feed_prunes_past_retention() {
        let dir = tempdir().unwrap();
        let store = SqliteCaptchaStore::new(dir.path().join("captcha.sqlite")).unwrap();
        store.initialize().unwrap();
        let feed = SqliteEventFeed::new(store, Duration::from_millis(10));

        let mut old = CaptchaEvent::for_session(EventType::SessionCached, &session("old.test"), None);
        old.timestamp = Utc::now() - chrono::Duration::days(2);
        feed.append(&old).unwrap();
        feed.publish(CaptchaEvent::for_session(
            EventType::SessionCached,
            &session("example.com"),
            None,
        ))
        .await
        .unwrap();

        let removed = feed
            .prune_before(Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        let left = feed.recent(None, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].domain, "example.com");
    }

    #[test]
    fn event_types_round_trip_through_text() {
        for event in [EventType::TaskCreated, EventType::TaskSolving, EventType::SessionExpired] {
            assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
        }
        assert!("task_exploded".parse::<EventType>().is_err());
    }
}
