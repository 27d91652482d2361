//! Worklog: append-only audit trail of scheduler and assistant activity,
//! read back by the UI's worklog panel.
//!
//! Writes from the engine are fire-and-forget: a failed write is logged and
//! dropped, never surfaced to the caller.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sparkie_core::error::{Result, SparkieError};
use std::sync::Arc;

use crate::persistence::{SchedulerDb, db_err, ts};

pub const DEFAULT_LIST_LIMIT: usize = 60;
pub const MAX_LIST_LIMIT: usize = 200;
/// Consecutive message batches closer than this are merged.
pub const MESSAGE_BATCH_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorklogType {
    ProactiveCheck,
    MessageBatch,
    EmailProcessed,
    EmailSkipped,
    MemoryLearned,
    MemoryUpdated,
    MemoryForgotten,
    TaskExecuted,
    CodePush,
    Error,
    Heartbeat,
    AiResponse,
}

impl WorklogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProactiveCheck => "proactive_check",
            Self::MessageBatch => "message_batch",
            Self::EmailProcessed => "email_processed",
            Self::EmailSkipped => "email_skipped",
            Self::MemoryLearned => "memory_learned",
            Self::MemoryUpdated => "memory_updated",
            Self::MemoryForgotten => "memory_forgotten",
            Self::TaskExecuted => "task_executed",
            Self::CodePush => "code_push",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::AiResponse => "ai_response",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| SparkieError::InvalidInput(format!("unknown worklog type '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorklogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub metadata: Value,
    pub created_at: String,
}

/// Trailing 24h counters shown above the worklog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorklogStats {
    pub emails: i64,
    pub messages: i64,
}

#[derive(Clone)]
pub struct WorklogWriter {
    db: Arc<SchedulerDb>,
}

impl WorklogWriter {
    pub fn new(db: Arc<SchedulerDb>) -> Self {
        Self { db }
    }

    /// Append an entry; failures are logged and dropped.
    pub fn write(&self, owner: &str, kind: WorklogType, content: &str, metadata: Value) {
        if let Err(e) = self.try_write_at(owner, kind, content, metadata, Utc::now()) {
            tracing::warn!("worklog write for {owner} dropped: {e}");
        }
    }

    /// Append an entry at `at`, returning its id.
    pub fn try_write_at(
        &self,
        owner: &str,
        kind: WorklogType,
        content: &str,
        metadata: Value,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO sparkie_worklog (id, user_id, type, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, owner, kind.as_str(), content, metadata.to_string(), ts(at)],
        )
        .map_err(db_err)?;
        Ok(id)
    }

    /// Record `count` new user messages, folding them into the latest batch
    /// entry when it is recent enough.
    pub fn write_message_batch(&self, owner: &str, count: u32, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.conn()?;
        let since = ts(now - Duration::minutes(MESSAGE_BATCH_WINDOW_MINUTES));
        let recent: Option<(String, i64)> = conn
            .query_row(
                "SELECT id, COALESCE(json_extract(metadata, '$.count'), 0) FROM sparkie_worklog
                 WHERE user_id = ?1 AND type = 'message_batch' AND created_at > ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![owner, since],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;

        match recent {
            Some((id, previous)) => {
                let total = previous + i64::from(count);
                conn.execute(
                    "UPDATE sparkie_worklog SET content = ?1, metadata = json_set(metadata, '$.count', ?2),
                     created_at = ?3 WHERE id = ?4",
                    params![batch_content(total), total, ts(now), id],
                )
                .map_err(db_err)?;
            }
            None => {
                drop(conn);
                let total = i64::from(count);
                self.try_write_at(
                    owner,
                    WorklogType::MessageBatch,
                    &batch_content(total),
                    json!({ "count": total }),
                    now,
                )?;
            }
        }
        Ok(())
    }

    /// Newest first.
    pub fn list(&self, owner: &str, limit: Option<usize>, offset: usize) -> Result<Vec<WorklogEntry>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, type, content, metadata, created_at FROM sparkie_worklog
                 WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
            )
            .map_err(db_err)?;
        let entries = stmt
            .query_map(params![owner, limit as i64, offset as i64], |row| {
                let metadata: String = row.get(3)?;
                Ok(WorklogEntry {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    content: row.get(2)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
                    created_at: row.get(4)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(entries)
    }

    pub fn stats_24h(&self, owner: &str, now: DateTime<Utc>) -> Result<WorklogStats> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN type IN ('email_processed', 'email_skipped') THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN type = 'message_batch'
                            THEN COALESCE(json_extract(metadata, '$.count'), 1) ELSE 0 END), 0)
             FROM sparkie_worklog WHERE user_id = ?1 AND created_at > ?2",
            params![owner, ts(now - Duration::hours(24))],
            |row| {
                Ok(WorklogStats {
                    emails: row.get(0)?,
                    messages: row.get(1)?,
                })
            },
        )
        .map_err(db_err)
    }
}

fn batch_content(count: i64) -> String {
    let plural = if count == 1 { "" } else { "s" };
    format!("You just sent me {count} message{plural}\nAll noted! I am working on it.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()
    }

    fn writer() -> WorklogWriter {
        WorklogWriter::new(Arc::new(SchedulerDb::open_in_memory().unwrap()))
    }

    #[test]
    fn test_type_strings() {
        assert_eq!(WorklogType::parse("task_executed").unwrap(), WorklogType::TaskExecuted);
        assert_eq!(WorklogType::ProactiveCheck.as_str(), "proactive_check");
        assert_eq!(
            serde_json::to_value(WorklogType::AiResponse).unwrap(),
            WorklogType::AiResponse.as_str()
        );
        assert!(WorklogType::parse("party").is_err());
    }

    #[test]
    fn test_list_newest_first_and_owner_scoped() {
        let w = writer();
        w.try_write_at("u1", WorklogType::Heartbeat, "first", json!({}), now()).unwrap();
        w.try_write_at("u1", WorklogType::TaskExecuted, "second", json!({"taskId": "t"}), now() + Duration::seconds(1))
            .unwrap();
        w.try_write_at("u2", WorklogType::Heartbeat, "other", json!({}), now()).unwrap();

        let entries = w.list("u1", None, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "second");
        assert_eq!(entries[0].kind, "task_executed");
        assert_eq!(entries[0].metadata["taskId"], "t");
        assert_eq!(w.list("u1", Some(1), 1).unwrap()[0].content, "first");
    }

    #[test]
    fn test_message_batches_coalesce() {
        let w = writer();
        w.write_message_batch("u1", 1, now()).unwrap();
        w.write_message_batch("u1", 2, now() + Duration::minutes(3)).unwrap();

        let entries = w.list("u1", None, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata["count"], 3);
        assert!(entries[0].content.starts_with("You just sent me 3 messages"));

        // outside the window starts a new entry
        w.write_message_batch("u1", 1, now() + Duration::minutes(20)).unwrap();
        let entries = w.list("u1", None, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].content.starts_with("You just sent me 1 message\n"));
    }

    #[test]
    fn test_stats_24h() {
        let w = writer();
        w.try_write_at("u1", WorklogType::EmailProcessed, "e", json!({}), now()).unwrap();
        w.try_write_at("u1", WorklogType::EmailSkipped, "e", json!({}), now()).unwrap();
        w.try_write_at("u1", WorklogType::EmailProcessed, "old", json!({}), now() - Duration::hours(30))
            .unwrap();
        w.write_message_batch("u1", 4, now()).unwrap();
        w.try_write_at("u1", WorklogType::MessageBatch, "legacy", json!({}), now() - Duration::hours(1))
            .unwrap();

        let stats = w.stats_24h("u1", now()).unwrap();
        assert_eq!(stats, WorklogStats { emails: 2, messages: 5 });
        assert_eq!(w.stats_24h("u2", now()).unwrap(), WorklogStats::default());
    }
}
