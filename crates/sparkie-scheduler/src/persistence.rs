//! SQLite-backed persistence for tasks, the outreach log, the worklog and the
//! heartbeat lease.
//!
//! Every replica on a host opens the same database file; WAL mode plus a busy
//! timeout lets them share it. All timestamps are stored as RFC 3339 UTC text
//! with millisecond precision, so lexical order equals time order.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use sparkie_core::error::{Result, SparkieError};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::tasks::{
    ExecutorKind, NewTask, Resolution, StatusFilter, Task, TaskStatus, TriggerConfig,
};

/// Default page size for task listing.
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Hard cap on task listing page size.
pub const MAX_LIST_LIMIT: usize = 100;
/// `StatusFilter::All` shows closed tasks created within this many days.
pub const RECENT_WINDOW_DAYS: i64 = 30;
/// Pending approval tasks surfaced to outreach.
pub const PENDING_HUMAN_LIMIT: usize = 10;

const TASK_COLUMNS: &str = "id, user_id, action, label, payload, status, executor, trigger_type, \
     trigger_config, scheduled_at, why_human, created_at, resolved_at";

/// Format an instant for storage.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub(crate) fn db_err(e: rusqlite::Error) -> SparkieError {
    SparkieError::Database(e.to_string())
}

/// A task awaiting human approval, as surfaced to outreach.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PendingTaskSummary {
    pub id: String,
    pub label: String,
    pub created_at: String,
}

/// Shared scheduler database.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database, for tests and one-shot tools.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sparkie_tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                label TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                executor TEXT NOT NULL DEFAULT 'human',
                trigger_type TEXT NOT NULL DEFAULT 'manual',
                trigger_config TEXT NOT NULL DEFAULT '{}',
                scheduled_at TEXT,
                why_human TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sparkie_tasks_user ON sparkie_tasks(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_sparkie_tasks_due
                ON sparkie_tasks(executor, status, scheduled_at);

            CREATE TABLE IF NOT EXISTS sparkie_outreach_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                type TEXT NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outreach_user_type
                ON sparkie_outreach_log(user_id, type, sent_at);

            CREATE TABLE IF NOT EXISTS sparkie_worklog (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_worklog_user_time ON sparkie_worklog(user_id, created_at);

            CREATE TABLE IF NOT EXISTS heartbeat_locks (
                lock_key INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            -- owned by the session layer; read here for outreach
            CREATE TABLE IF NOT EXISTS user_sessions (
                user_id TEXT PRIMARY KEY,
                last_seen TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| SparkieError::Database(format!("Migration: {e}")))?;
        // Added after the first release; fails harmlessly once present.
        let _ = conn.execute("ALTER TABLE sparkie_tasks ADD COLUMN claimed_at TEXT", []);
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SparkieError::Database(format!("Lock: {e}")))
    }

    // ─── Tasks ────────────────────────────────────────────────

    /// Insert a task. Returns `false` when the id already exists (no-op).
    pub fn create_task(&self, owner: &str, task: &NewTask, now: DateTime<Utc>) -> Result<bool> {
        task.validate()?;
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO sparkie_tasks
                 (id, user_id, action, label, payload, status, executor, trigger_type,
                  trigger_config, scheduled_at, why_human, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id,
                    owner,
                    task.action,
                    task.label,
                    task.payload.to_string(),
                    task.executor.as_str(),
                    task.trigger.trigger_type(),
                    task.trigger.config_json().to_string(),
                    task.scheduled_at.map(ts),
                    task.why_human,
                    ts(now),
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Fetch one task within its owner's partition.
    pub fn get_task(&self, owner: &str, id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM sparkie_tasks WHERE id = ?1 AND user_id = ?2"),
            params![id, owner],
            row_to_task,
        )
        .optional()
        .map_err(db_err)
    }

    /// Open tasks first, then newest first.
    pub fn list_tasks(
        &self,
        owner: &str,
        filter: StatusFilter,
        limit: Option<usize>,
        offset: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let order = "ORDER BY CASE WHEN status IN ('pending', 'in_progress') THEN 0 ELSE 1 END,
                     created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4";
        let conn = self.conn()?;
        let (sql, second) = match filter {
            StatusFilter::All => (
                format!(
                    "SELECT {TASK_COLUMNS} FROM sparkie_tasks WHERE user_id = ?1
                     AND (status IN ('pending', 'in_progress') OR created_at >= ?2) {order}"
                ),
                ts(now - Duration::days(RECENT_WINDOW_DAYS)),
            ),
            StatusFilter::Only(status) => (
                format!("SELECT {TASK_COLUMNS} FROM sparkie_tasks WHERE user_id = ?1 AND status = ?2 {order}"),
                status.as_str().to_string(),
            ),
        };
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let tasks = stmt
            .query_map(
                params![owner, second, limit as i64, offset as i64],
                row_to_task,
            )
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(tasks)
    }

    /// Apply a human resolution and return the updated task.
    pub fn resolve_task(
        &self,
        owner: &str,
        id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let conn = self.conn()?;
        let current = conn
            .query_row(
                "SELECT status FROM sparkie_tasks WHERE id = ?1 AND user_id = ?2",
                params![id, owner],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| SparkieError::NotFound(format!("task '{id}'")))?;

        if current == TaskStatus::InProgress.as_str() {
            return Err(SparkieError::Conflict(format!(
                "task '{id}' is being executed"
            )));
        }

        let target = resolution.target_status();
        let resolved_at = target.is_terminal().then(|| ts(now));
        conn.execute(
            "UPDATE sparkie_tasks SET status = ?1, resolved_at = ?2
             WHERE id = ?3 AND user_id = ?4 AND status != 'in_progress'",
            params![target.as_str(), resolved_at, id, owner],
        )
        .map_err(db_err)?;

        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM sparkie_tasks WHERE id = ?1 AND user_id = ?2"),
            params![id, owner],
            row_to_task,
        )
        .map_err(db_err)
    }

    /// Owners with at least one due AI task.
    pub fn due_owners(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT user_id FROM sparkie_tasks
                 WHERE executor = 'ai' AND status = 'pending'
                 AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
            )
            .map_err(db_err)?;
        let owners = stmt
            .query_map(params![ts(now)], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(owners)
    }

    /// Due AI tasks for one owner, earliest `scheduled_at` first.
    pub fn due_tasks(&self, owner: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM sparkie_tasks
                 WHERE user_id = ?1 AND executor = 'ai' AND status = 'pending'
                 AND scheduled_at IS NOT NULL AND scheduled_at <= ?2
                 ORDER BY scheduled_at ASC, rowid ASC LIMIT ?3"
            ))
            .map_err(db_err)?;
        let tasks = stmt
            .query_map(params![owner, ts(now), limit as i64], row_to_task)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(tasks)
    }

    /// Move a due task to `in_progress`. Only one caller can win a given row;
    /// the rest get `false`.
    pub fn claim_task(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE sparkie_tasks SET status = 'in_progress', claimed_at = ?2
                 WHERE id = ?1 AND executor = 'ai' AND status = 'pending'
                 AND scheduled_at IS NOT NULL AND scheduled_at <= ?2",
                params![id, ts(now)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// `in_progress` → `completed`.
    pub fn complete_task(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.finish_task(id, TaskStatus::Completed, now)
    }

    /// `in_progress` → `failed`.
    pub fn fail_task(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.finish_task(id, TaskStatus::Failed, now)
    }

    fn finish_task(&self, id: &str, status: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sparkie_tasks SET status = ?1, resolved_at = ?2, claimed_at = NULL
             WHERE id = ?3 AND status = 'in_progress'",
            params![status.as_str(), ts(now), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// `in_progress` → `pending` with a new `scheduled_at`; `resolved_at` untouched.
    pub fn reschedule_task(&self, id: &str, next: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sparkie_tasks SET status = 'pending', scheduled_at = ?1, claimed_at = NULL
             WHERE id = ?2 AND status = 'in_progress'",
            params![ts(next), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Settle claims abandoned by a runner that died mid-task: anything still
    /// `in_progress` that was claimed at or before `claimed_before`. Cron tasks
    /// go back to `pending` at their old `scheduled_at` so they run again;
    /// others become `failed`. Returns the settled tasks in their new state.
    pub fn recover_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let stale = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM sparkie_tasks
                     WHERE status = 'in_progress' AND (claimed_at IS NULL OR claimed_at <= ?1)"
                ))
                .map_err(db_err)?;
            stmt.query_map(params![ts(claimed_before)], row_to_task)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?
        };

        let mut recovered = Vec::with_capacity(stale.len());
        for mut task in stale {
            let changed = if task.trigger.is_cron() {
                task.status = TaskStatus::Pending;
                conn.execute(
                    "UPDATE sparkie_tasks SET status = 'pending', claimed_at = NULL
                     WHERE id = ?1 AND status = 'in_progress'",
                    params![task.id],
                )
            } else {
                task.status = TaskStatus::Failed;
                task.resolved_at = Some(now);
                conn.execute(
                    "UPDATE sparkie_tasks SET status = 'failed', resolved_at = ?2, claimed_at = NULL
                     WHERE id = ?1 AND status = 'in_progress'",
                    params![task.id, ts(now)],
                )
            };
            if changed.map_err(db_err)? == 1 {
                recovered.push(task);
            }
        }
        Ok(recovered)
    }

    /// Tasks waiting on the owner's approval, newest first.
    pub fn pending_human_tasks(&self, owner: &str) -> Result<Vec<PendingTaskSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, label, created_at FROM sparkie_tasks
                 WHERE user_id = ?1 AND executor = 'human' AND status = 'pending'
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let tasks = stmt
            .query_map(params![owner, PENDING_HUMAN_LIMIT as i64], |row| {
                Ok(PendingTaskSummary {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(tasks)
    }

    // ─── Outreach log ─────────────────────────────────────────

    /// Record an outreach of `kind` unless one was logged within `window`.
    /// Check and insert happen in one statement, so two concurrent polls
    /// cannot both log.
    pub fn try_log_outreach(
        &self,
        owner: &str,
        kind: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO sparkie_outreach_log (user_id, type, sent_at)
                 SELECT ?1, ?2, ?3
                 WHERE NOT EXISTS (
                     SELECT 1 FROM sparkie_outreach_log
                     WHERE user_id = ?1 AND type = ?2 AND sent_at > ?4
                 )",
                params![owner, kind, ts(now), ts(now - window)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Whether `kind` was logged for `owner` within `window`.
    pub fn outreach_logged_within(
        &self,
        owner: &str,
        kind: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sparkie_outreach_log
             WHERE user_id = ?1 AND type = ?2 AND sent_at > ?3)",
            params![owner, kind, ts(now - window)],
            |row| row.get::<_, bool>(0),
        )
        .map_err(db_err)
    }

    // ─── Owner context ────────────────────────────────────────

    pub fn touch_activity(&self, owner: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_sessions (user_id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_seen = excluded.last_seen",
            params![owner, ts(at)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn last_activity(&self, owner: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_seen FROM user_sessions WHERE user_id = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(raw.as_deref().and_then(parse_ts))
    }

    pub fn add_memory(&self, owner: &str, content: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_memories (user_id, content, created_at) VALUES (?1, ?2, ?3)",
            params![owner, content, ts(at)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Most recent memory snippets, newest first.
    pub fn recent_memories(&self, owner: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT content FROM user_memories WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let memories = stmt
            .query_map(params![owner, limit as i64], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(memories)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let payload: String = row.get(4)?;
    let status: String = row.get(5)?;
    let executor: String = row.get(6)?;
    let trigger_type: String = row.get(7)?;
    let trigger_config: String = row.get(8)?;
    let scheduled_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(11)?;
    let resolved_at: Option<String> = row.get(12)?;

    let trigger_config: Value = serde_json::from_str(&trigger_config).unwrap_or(Value::Null);

    Ok(Task {
        id: row.get(0)?,
        owner: row.get(1)?,
        action: row.get(2)?,
        label: row.get(3)?,
        payload: serde_json::from_str(&payload).unwrap_or_else(|_| Value::Object(Default::default())),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        executor: ExecutorKind::parse(&executor).unwrap_or_default(),
        trigger: TriggerConfig::from_stored(&trigger_type, &trigger_config),
        scheduled_at: scheduled_at.as_deref().and_then(parse_ts),
        why_human: row.get(10)?,
        created_at: parse_ts(&created_at).unwrap_or_default(),
        resolved_at: resolved_at.as_deref().and_then(parse_ts),
    })
}
