use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Params, Row, TransactionBehavior};
use uuid::Uuid;

use crate::session::normalize_domain;
use crate::sqlite::{configure_connection, from_millis, millis};

use super::error::{CaptchaError, CaptchaResult};
use super::task::{CaptchaStatus, CaptchaTask, NewCaptchaTask, Solution};

const CAPTCHA_SCHEMA: &str = include_str!("../../../sql/captcha.sql");

const OPEN_STATUSES: &str = "('pending', 'in_progress', 'solving', 'failed')";

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<CaptchaStatus>,
    pub domain: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SqliteCaptchaStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteCaptchaStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteCaptchaStoreBuilder {
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

    pub fn build(self) -> CaptchaResult<SqliteCaptchaStore> {
        let path = self.path.ok_or(CaptchaError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteCaptchaStore { path, flags })
    }
}

/// Result of [`SqliteCaptchaStore::create`].
#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: CaptchaTask,
    /// `false` when an open task for the domain was reused.
    pub created: bool,
    /// Stale tasks for the domain closed before the lookup.
    pub expired: Vec<CaptchaTask>,
}

/// Durable task records. Every state change is a conditional `UPDATE`, so two
/// processes racing on the same task cannot both win.
#[derive(Debug, Clone)]
pub struct SqliteCaptchaStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteCaptchaStore {
    pub fn builder() -> SqliteCaptchaStoreBuilder {
        SqliteCaptchaStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CaptchaResult<Self> {
        SqliteCaptchaStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn open(&self) -> CaptchaResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CaptchaError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| CaptchaError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> CaptchaResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CAPTCHA_SCHEMA)?;
        Ok(())
    }

    /// Returns the open task for the domain if there is one, bumping its
    /// bookkeeping, otherwise inserts a new `pending` task. Stale tasks for the
    /// domain are expired first so a lapsed task is never handed back.
    pub fn create(
        &self,
        new: &NewCaptchaTask,
        default_priority: u8,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> CaptchaResult<CreatedTask> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let domain = normalize_domain(&new.domain);
        let priority = new.priority.unwrap_or(default_priority).clamp(1, 10);
        let expired = expire_where(&tx, now, Some(&domain))?;

        let existing: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM captcha_tasks WHERE domain = ?1 AND status IN {OPEN_STATUSES} ORDER BY id LIMIT 1"
                ),
                params![domain],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            tx.execute(
                "UPDATE captcha_tasks
                 SET attempts = attempts + 1,
                     priority = MAX(priority, ?2),
                     error_message = COALESCE(?3, error_message),
                     updated_at = ?4
                 WHERE id = ?1",
                params![id, priority, &new.error_message, millis(now)],
            )?;
            let task = load_by_id(&tx, id)?;
            tx.commit()?;
            return Ok(CreatedTask {
                task,
                created: false,
                expired,
            });
        }

        let expires_at = now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        tx.execute(
            "INSERT INTO captcha_tasks (
                uuid, url, domain, challenge_type, status, priority, attempts,
                error_message, proxy_url, user_agent, created_at, updated_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 1, ?6, ?7, ?8, ?9, ?9, ?10)",
            params![
                Uuid::new_v4().to_string(),
                &new.url,
                domain,
                &new.challenge_type,
                priority,
                &new.error_message,
                &new.proxy_url,
                &new.user_agent,
                millis(now),
                millis(expires_at),
            ],
        )?;
        let task = load_by_id(&tx, tx.last_insert_rowid())?;
        tx.commit()?;
        Ok(CreatedTask {
            task,
            created: true,
            expired,
        })
    }

    pub fn get(&self, uuid: Uuid) -> CaptchaResult<Option<CaptchaTask>> {
        let conn = self.open()?;
        load_by_uuid(&conn, uuid)
    }

    pub fn find_open(&self, domain: &str) -> CaptchaResult<Option<CaptchaTask>> {
        let conn = self.open()?;
        conn.query_row(
            &format!(
                "SELECT * FROM captcha_tasks WHERE domain = ?1 AND status IN {OPEN_STATUSES} ORDER BY id LIMIT 1"
            ),
            params![normalize_domain(domain)],
            StoredTask::from_row,
        )
        .optional()?
        .map(StoredTask::decode)
        .transpose()
    }

    /// Locks the task for `operator`. Another operator's live lock is a conflict.
    pub fn assign(
        &self,
        uuid: Uuid,
        operator: &str,
        lock: Duration,
        now: DateTime<Utc>,
    ) -> CaptchaResult<CaptchaTask> {
        let lock_expires_at =
            now + chrono::Duration::from_std(lock).unwrap_or_else(|_| chrono::Duration::zero());
        self.transition(
            uuid,
            CaptchaStatus::InProgress,
            Some(operator),
            now,
            "UPDATE captcha_tasks
             SET status = 'in_progress', assigned_to = ?3, lock_expires_at = ?4, updated_at = ?2
             WHERE uuid = ?1 AND (
                (status IN ('pending', 'failed') AND expires_at > ?2)
                OR (status IN ('in_progress', 'solving') AND (
                    assigned_to = ?3 OR assigned_to IS NULL
                    OR lock_expires_at IS NULL OR lock_expires_at <= ?2)))",
            params![uuid.to_string(), millis(now), operator, millis(lock_expires_at)],
        )
    }

    pub fn start_solving(
        &self,
        uuid: Uuid,
        operator: &str,
        now: DateTime<Utc>,
    ) -> CaptchaResult<CaptchaTask> {
        self.transition(
            uuid,
            CaptchaStatus::Solving,
            Some(operator),
            now,
            "UPDATE captcha_tasks SET status = 'solving', updated_at = ?2
             WHERE uuid = ?1 AND status = 'in_progress' AND assigned_to = ?3 AND lock_expires_at > ?2",
            params![uuid.to_string(), millis(now), operator],
        )
    }

    pub fn submit_solution(
        &self,
        uuid: Uuid,
        solution: &Solution,
        now: DateTime<Utc>,
    ) -> CaptchaResult<CaptchaTask> {
        solution.validate()?;
        let encoded = serde_json::to_string(solution)?;
        self.transition(
            uuid,
            CaptchaStatus::Solved,
            None,
            now,
            "UPDATE captcha_tasks
             SET status = 'solved', solution = ?3, solved_at = ?2, updated_at = ?2,
                 assigned_to = NULL, lock_expires_at = NULL
             WHERE uuid = ?1 AND status IN ('in_progress', 'solving')",
            params![uuid.to_string(), millis(now), encoded],
        )
    }

    /// Temporary failure: the task goes back to the pool for another operator.
    pub fn mark_failed(
        &self,
        uuid: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CaptchaResult<CaptchaTask> {
        self.transition(
            uuid,
            CaptchaStatus::Failed,
            None,
            now,
            "UPDATE captcha_tasks
             SET status = 'failed', error_message = ?3, updated_at = ?2,
                 assigned_to = NULL, lock_expires_at = NULL
             WHERE uuid = ?1 AND status IN ('in_progress', 'solving')",
            params![uuid.to_string(), millis(now), reason],
        )
    }

    pub fn mark_unsolvable(
        &self,
        uuid: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CaptchaResult<CaptchaTask> {
        self.transition(
            uuid,
            CaptchaStatus::Unsolvable,
            None,
            now,
            &format!(
                "UPDATE captcha_tasks
                 SET status = 'unsolvable', error_message = ?3, updated_at = ?2,
                     assigned_to = NULL, lock_expires_at = NULL
                 WHERE uuid = ?1 AND status IN {OPEN_STATUSES}"
            ),
            params![uuid.to_string(), millis(now), reason],
        )
    }

    /// Expires unassigned tasks past their deadline and locked tasks whose
    /// lock lapsed without a terminal submission.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> CaptchaResult<Vec<CaptchaTask>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expired = expire_where(&tx, now, None)?;
        tx.commit()?;
        Ok(expired)
    }

    /// Drops event log rows older than `before`.
    pub fn prune_events_before(&self, before: DateTime<Utc>) -> CaptchaResult<usize> {
        let conn = self.open()?;
        Ok(conn.execute(
            "DELETE FROM captcha_events WHERE ts < ?1",
            params![millis(before)],
        )?)
    }

    pub fn list(&self, filter: &TaskFilter) -> CaptchaResult<Vec<CaptchaTask>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM captcha_tasks WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(domain) = &filter.domain {
            query.push_str(" AND domain = ?");
            values.push(Value::Text(normalize_domain(domain)));
        }
        query.push_str(" ORDER BY priority DESC, created_at ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), StoredTask::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(StoredTask::decode).collect()
    }

    /// Tasks waiting for an operator, highest priority first.
    pub fn list_pending(&self, limit: usize) -> CaptchaResult<Vec<CaptchaTask>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM captcha_tasks WHERE status IN ('pending', 'failed')
             ORDER BY priority DESC, created_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], StoredTask::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(StoredTask::decode).collect()
    }

    fn transition<P: Params>(
        &self,
        uuid: Uuid,
        to: CaptchaStatus,
        operator: Option<&str>,
        now: DateTime<Utc>,
        sql: &str,
        params: P,
    ) -> CaptchaResult<CaptchaTask> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(sql, params)?;
        let task = load_by_uuid(&tx, uuid)?.ok_or(CaptchaError::NotFound(uuid))?;
        tx.commit()?;
        if changed > 0 {
            Ok(task)
        } else {
            Err(rejection(&task, to, operator, now))
        }
    }
}

fn expire_where(
    conn: &Connection,
    now: DateTime<Utc>,
    domain: Option<&str>,
) -> CaptchaResult<Vec<CaptchaTask>> {
    let ids = {
        let mut stmt = conn.prepare(
            "SELECT id FROM captcha_tasks
             WHERE (?2 IS NULL OR domain = ?2)
               AND ((status IN ('pending', 'failed') AND expires_at <= ?1)
                 OR (status IN ('in_progress', 'solving')
                     AND (lock_expires_at IS NULL OR lock_expires_at <= ?1)))
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![millis(now), domain], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };
    let mut expired = Vec::with_capacity(ids.len());
    for id in ids {
        conn.execute(
            "UPDATE captcha_tasks
             SET status = 'expired', updated_at = ?2, assigned_to = NULL, lock_expires_at = NULL
             WHERE id = ?1",
            params![id, millis(now)],
        )?;
        expired.push(load_by_id(conn, id)?);
    }
    Ok(expired)
}

fn rejection(
    task: &CaptchaTask,
    to: CaptchaStatus,
    operator: Option<&str>,
    now: DateTime<Utc>,
) -> CaptchaError {
    if let (Some(holder), Some(operator)) = (&task.assigned_to, operator) {
        if task.is_locked_at(now) && holder != operator {
            return CaptchaError::Conflict {
                uuid: task.uuid,
                assigned_to: holder.clone(),
            };
        }
    }
    CaptchaError::InvalidTransition {
        uuid: task.uuid,
        from: task.status,
        to,
    }
}

fn load_by_id(conn: &Connection, id: i64) -> CaptchaResult<CaptchaTask> {
    conn.query_row(
        "SELECT * FROM captcha_tasks WHERE id = ?1",
        params![id],
        StoredTask::from_row,
    )?
    .decode()
}

fn load_by_uuid(conn: &Connection, uuid: Uuid) -> CaptchaResult<Option<CaptchaTask>> {
    conn.query_row(
        "SELECT * FROM captcha_tasks WHERE uuid = ?1",
        params![uuid.to_string()],
        StoredTask::from_row,
    )
    .optional()?
    .map(StoredTask::decode)
    .transpose()
}

struct StoredTask {
    id: i64,
    uuid: String,
    url: String,
    domain: String,
    challenge_type: String,
    status: String,
    priority: i64,
    assigned_to: Option<String>,
    lock_expires_at: Option<i64>,
    attempts: i64,
    error_message: Option<String>,
    proxy_url: Option<String>,
    user_agent: Option<String>,
    solution: Option<String>,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
    solved_at: Option<i64>,
}

impl StoredTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            uuid: row.get("uuid")?,
            url: row.get("url")?,
            domain: row.get("domain")?,
            challenge_type: row.get("challenge_type")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            assigned_to: row.get("assigned_to")?,
            lock_expires_at: row.get("lock_expires_at")?,
            attempts: row.get("attempts")?,
            error_message: row.get("error_message")?,
            proxy_url: row.get("proxy_url")?,
            user_agent: row.get("user_agent")?,
            solution: row.get("solution")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            expires_at: row.get("expires_at")?,
            solved_at: row.get("solved_at")?,
        })
    }

    fn decode(self) -> CaptchaResult<CaptchaTask> {
        let uuid =
            Uuid::parse_str(&self.uuid).map_err(|err| CaptchaError::InvalidUuid(err.to_string()))?;
        let solution = match self.solution {
            Some(raw) => Some(serde_json::from_str::<Solution>(&raw)?),
            None => None,
        };
        Ok(CaptchaTask {
            id: self.id,
            uuid,
            url: self.url,
            domain: self.domain,
            challenge_type: self.challenge_type,
            status: self.status.parse()?,
            priority: self.priority.clamp(1, 10) as u8,
            assigned_to: self.assigned_to,
            lock_expires_at: self.lock_expires_at.map(from_millis),
            attempts: self.attempts.max(0) as u32,
            error_message: self.error_message,
            proxy_url: self.proxy_url,
            user_agent: self.user_agent,
            solution,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            expires_at: from_millis(self.expires_at),
            solved_at: self.solved_at.map(from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Cookie;
    use tempfile::tempdir;

    const TIMEOUT: Duration = Duration::from_secs(600);
    const LOCK: Duration = Duration::from_secs(1800);

    fn store() -> (tempfile::TempDir, SqliteCaptchaStore) {
        let dir = tempdir().unwrap();
        let store = SqliteCaptchaStore::new(dir.path().join("captcha.sqlite")).unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    fn new_task(domain: &str) -> NewCaptchaTask {
        NewCaptchaTask {
            url: format!("https://{domain}/"),
            domain: domain.to_string(),
            challenge_type: "turnstile".into(),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_create_returns_open_task_and_bumps_bookkeeping() {
        let (_dir, store) = store();
        let now = Utc::now();
        let CreatedTask { task: first, created, .. } = store.create(&new_task("example.com"), 5, TIMEOUT, now).unwrap();
        assert!(created);
        assert_eq!(first.status, CaptchaStatus::Pending);
        assert_eq!(first.priority, 5);

        let mut again = new_task("EXAMPLE.com");
        again.priority = Some(9);
        again.error_message = Some("still blocked".into());
        let CreatedTask { task: second, created, .. } = store.create(&again, 5, TIMEOUT, now).unwrap();
        assert!(!created);
        assert_eq!(second.uuid, first.uuid);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.priority, 9);
        assert_eq!(second.error_message.as_deref(), Some("still blocked"));
    }

    #[test]
    fn assignment_conflicts_until_lock_lapses() {
        let (_dir, store) = store();
        let now = Utc::now();
        let task = store.create(&new_task("example.com"), 5, TIMEOUT, now).unwrap().task;
        let assigned = store.assign(task.uuid, "alice", LOCK, now).unwrap();
        assert_eq!(assigned.status, CaptchaStatus::InProgress);
        assert_eq!(assigned.assigned_to.as_deref(), Some("alice"));

        let err = store.assign(task.uuid, "bob", LOCK, now).unwrap_err();
        assert!(matches!(err, CaptchaError::Conflict { ref assigned_to, .. } if assigned_to == "alice"));

        let later = now + chrono::Duration::seconds(1801);
        let stolen = store.assign(task.uuid, "bob", LOCK, later).unwrap();
        assert_eq!(stolen.assigned_to.as_deref(), Some("bob"));
    }

    #[test]
    fn solving_requires_the_lock_holder() {
        let (_dir, store) = store();
        let now = Utc::now();
        let task = store.create(&new_task("example.com"), 5, TIMEOUT, now).unwrap().task;
        assert!(matches!(
            store.start_solving(task.uuid, "alice", now),
            Err(CaptchaError::InvalidTransition { from: CaptchaStatus::Pending, .. })
        ));
        store.assign(task.uuid, "alice", LOCK, now).unwrap();
        assert!(store.start_solving(task.uuid, "bob", now).unwrap_err().is_conflict());
        let solving = store.start_solving(task.uuid, "alice", now).unwrap();
        assert_eq!(solving.status, CaptchaStatus::Solving);
    }

    #[test]
    fn submit_clears_lock_and_closes_domain() {
        let (_dir, store) = store();
        let now = Utc::now();
        let task = store.create(&new_task("example.com"), 5, TIMEOUT, now).unwrap().task;
        assert!(store
            .submit_solution(
                task.uuid,
                &Solution::cookies(vec![Cookie::new("cf_clearance", "X", ".example.com")]),
                now
            )
            .is_err());
        store.assign(task.uuid, "alice", LOCK, now).unwrap();
        let solved = store
            .submit_solution(
                task.uuid,
                &Solution::cookies(vec![Cookie::new("cf_clearance", "X", ".example.com")]),
                now,
            )
            .unwrap();
        assert_eq!(solved.status, CaptchaStatus::Solved);
        assert!(solved.assigned_to.is_none());
        assert!(solved.lock_expires_at.is_none());
        assert!(solved.solved_at.is_some());
        assert!(store.find_open("example.com").unwrap().is_none());

        let CreatedTask { task: fresh, created, .. } = store.create(&new_task("example.com"), 5, TIMEOUT, now).unwrap();
        assert!(created);
        assert_ne!(fresh.uuid, task.uuid);
    }

    #[test]
    fn failed_tasks_return_to_the_pool() {
        let (_dir, store) = store();
        let now = Utc::now();
        let task = store.create(&new_task("example.com"), 5, TIMEOUT, now).unwrap().task;
        store.assign(task.uuid, "alice", LOCK, now).unwrap();
        let failed = store.mark_failed(task.uuid, "wrong answer", now).unwrap();
        assert_eq!(failed.status, CaptchaStatus::Failed);
        assert!(failed.assigned_to.is_none());
        assert_eq!(store.list_pending(10).unwrap().len(), 1);
        let reassigned = store.assign(task.uuid, "bob", LOCK, now).unwrap();
        assert_eq!(reassigned.assigned_to.as_deref(), Some("bob"));
        let unsolvable = store.mark_unsolvable(task.uuid, "site is down", now).unwrap();
        assert_eq!(unsolvable.status, CaptchaStatus::Unsolvable);
        assert!(store.assign(task.uuid, "bob", LOCK, now).is_err());
    }

    #[test]
    fn sweep_expires_pending_and_lapsed_locks() {
        let (_dir, store) = store();
        let now = Utc::now();
        let pending = store.create(&new_task("a.test"), 5, TIMEOUT, now).unwrap().task;
        let locked = store.create(&new_task("b.test"), 5, TIMEOUT, now).unwrap().task;
        let held = store.create(&new_task("c.test"), 5, Duration::from_secs(7200), now).unwrap().task;
        store.assign(locked.uuid, "alice", Duration::from_secs(60), now).unwrap();
        store.assign(held.uuid, "bob", Duration::from_secs(7200), now).unwrap();

        let expired = store.expire_stale(now + chrono::Duration::seconds(601)).unwrap();
        let uuids: Vec<Uuid> = expired.iter().map(|task| task.uuid).collect();
        assert_eq!(uuids, vec![pending.uuid, locked.uuid]);
        assert!(expired.iter().all(|task| task.status == CaptchaStatus::Expired));
        assert!(expired.iter().all(|task| task.assigned_to.is_none()));
        assert_eq!(
            store.get(held.uuid).unwrap().unwrap().status,
            CaptchaStatus::InProgress
        );
    }

    #[test]
    fn create_replaces_a_lapsed_task() {
        let (_dir, store) = store();
        let now = Utc::now();
        let stale = store.create(&new_task("example.com"), 5, Duration::from_secs(1), now).unwrap().task;

        let later = now + chrono::Duration::seconds(2);
        let CreatedTask { task, created, expired } =
            store.create(&new_task("example.com"), 5, TIMEOUT, later).unwrap();
        assert!(created);
        assert_ne!(task.uuid, stale.uuid);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].uuid, stale.uuid);
        assert_eq!(expired[0].status, CaptchaStatus::Expired);

        let assigned = store.assign(task.uuid, "alice", LOCK, later).unwrap();
        assert_eq!(assigned.status, CaptchaStatus::InProgress);
        assert!(store.list_pending(10).unwrap().is_empty());
    }

    #[test]
    fn create_leaves_other_domains_alone() {
        let (_dir, store) = store();
        let now = Utc::now();
        let other = store.create(&new_task("other.test"), 5, Duration::from_secs(1), now).unwrap().task;
        let later = now + chrono::Duration::seconds(2);
        let outcome = store.create(&new_task("example.com"), 5, TIMEOUT, later).unwrap();
        assert!(outcome.expired.is_empty());
        assert_eq!(
            store.get(other.uuid).unwrap().unwrap().status,
            CaptchaStatus::Pending
        );
    }

    #[test]
    fn prune_drops_old_events_only() {
        let (_dir, store) = store();
        let now = Utc::now();
        let conn = store.open().unwrap();
        for ts in [now - chrono::Duration::days(3), now] {
            conn.execute(
                "INSERT INTO captcha_events (event_type, ts, domain) VALUES ('task_expired', ?1, 'example.com')",
                params![millis(ts)],
            )
            .unwrap();
        }
        let removed = store.prune_events_before(now - chrono::Duration::days(1)).unwrap();
        assert_eq!(removed, 1);
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM captcha_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 1);
    }

    #[test]
    fn list_filters_by_status() {
        let (_dir, store) = store();
        let now = Utc::now();
        let mut low = new_task("low.test");
        low.priority = Some(2);
        let mut high = new_task("high.test");
        high.priority = Some(8);
        store.create(&low, 5, TIMEOUT, now).unwrap();
        let high = store.create(&high, 5, TIMEOUT, now).unwrap().task;
        store.assign(high.uuid, "alice", LOCK, now).unwrap();

        let pending = store
            .list(&TaskFilter {
                status: Some(CaptchaStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].domain, "low.test");
        assert_eq!(store.list(&TaskFilter::default()).unwrap()[0].domain, "high.test");
    }

    #[test]
    fn unknown_task_is_not_found() {
        let (_dir, store) = store();
        let uuid = Uuid::new_v4();
        assert!(matches!(
            store.assign(uuid, "alice", LOCK, Utc::now()),
            Err(CaptchaError::NotFound(missing)) if missing == uuid
        ));
    }
}
