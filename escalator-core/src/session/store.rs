use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::sqlite::{configure_connection, from_millis, millis};

use super::{normalize_domain, Session, SessionCache, SessionError, SessionResult};

const SESSIONS_SCHEMA: &str = include_str!("../../../sql/sessions.sql");

#[derive(Debug, Clone)]
pub struct SqliteSessionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SessionResult<SqliteSessionStore> {
        let path = self.path.ok_or(SessionError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSessionStore { path, flags })
    }
}

/// Durable session cache shared by workers and operator tools.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSessionStore {
    pub fn builder() -> SqliteSessionStoreBuilder {
        SqliteSessionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SessionResult<Self> {
        SqliteSessionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> SessionResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SessionError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| SessionError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SessionResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSIONS_SCHEMA)?;
        Ok(())
    }

    /// Reads the stored row even when it has expired.
    pub fn load(&self, domain: &str) -> SessionResult<Option<Session>> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT * FROM sessions WHERE domain = ?1",
                params![normalize_domain(domain)],
                StoredSession::from_row,
            )
            .optional()?;
        row.map(StoredSession::decode).transpose()
    }

    pub fn load_valid(&self, domain: &str, now: DateTime<Utc>) -> SessionResult<Option<Session>> {
        Ok(self
            .load(domain)?
            .filter(|session| session.is_valid_at(now)))
    }

    pub fn store(&self, session: &Session, now: DateTime<Utc>) -> SessionResult<bool> {
        let conn = self.open()?;
        let cookies = serde_json::to_string(&session.cookies)?;
        let changed = conn.execute(
            "INSERT INTO sessions (domain, cookies, user_agent, token, source, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(domain) DO UPDATE SET
                cookies = excluded.cookies,
                user_agent = excluded.user_agent,
                token = excluded.token,
                source = excluded.source,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
             WHERE excluded.expires_at >= sessions.expires_at OR sessions.expires_at <= ?8",
            params![
                normalize_domain(&session.domain),
                cookies,
                &session.user_agent,
                &session.token,
                session.source.as_str(),
                millis(session.created_at),
                millis(session.expires_at),
                millis(now),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn remove(&self, domain: &str) -> SessionResult<bool> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM sessions WHERE domain = ?1",
            params![normalize_domain(domain)],
        )?;
        Ok(removed > 0)
    }

    pub fn purge(&self, now: DateTime<Utc>) -> SessionResult<usize> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![millis(now)],
        )?;
        Ok(removed)
    }

    pub fn list(&self) -> SessionResult<Vec<Session>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY expires_at DESC")?;
        let mut rows = stmt.query([])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(StoredSession::from_row(row)?.decode()?);
        }
        Ok(sessions)
    }
}

struct StoredSession {
    domain: String,
    cookies: String,
    user_agent: Option<String>,
    token: Option<String>,
    source: String,
    created_at: i64,
    expires_at: i64,
}

impl StoredSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            domain: row.get("domain")?,
            cookies: row.get("cookies")?,
            user_agent: row.get("user_agent")?,
            token: row.get("token")?,
            source: row.get("source")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }

    fn decode(self) -> SessionResult<Session> {
        Ok(Session {
            domain: self.domain,
            cookies: serde_json::from_str(&self.cookies)?,
            user_agent: self.user_agent,
            token: self.token,
            created_at: from_millis(self.created_at),
            expires_at: from_millis(self.expires_at),
            source: self.source.parse()?,
        })
    }
}

#[async_trait]
impl SessionCache for SqliteSessionStore {
    async fn get(&self, domain: &str) -> SessionResult<Option<Session>> {
        let store = self.clone();
        let domain = domain.to_string();
        tokio::task::spawn_blocking(move || store.load_valid(&domain, Utc::now())).await?
    }

    async fn put(&self, session: Session) -> SessionResult<bool> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.store(&session, Utc::now())).await?
    }

    async fn invalidate(&self, domain: &str) -> SessionResult<bool> {
        let store = self.clone();
        let domain = domain.to_string();
        tokio::task::spawn_blocking(move || store.remove(&domain)).await?
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> SessionResult<usize> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.purge(now)).await?
    }
}
