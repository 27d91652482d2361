//! Outreach Trigger: decides, once per client poll, whether the assistant
//! should speak first.
//!
//! Branches are evaluated in priority order and the first match wins:
//! 1. due AI tasks for the caller are executed inline and reported
//! 2. morning brief (morning hours, idle for a while)
//! 3. check-in (away for days)
//! 4. soft notice of tasks awaiting approval
//!
//! Branches 2-4 are deduplicated through the outreach log. Polling is
//! best-effort: any internal error yields the empty event.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use sparkie_core::config::OutreachConfig;
use sparkie_core::error::Result;
use std::sync::Arc;

use crate::executor::{ExecutedTask, TaskExecutor};
use crate::persistence::PendingTaskSummary;
use crate::worklog::WorklogType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutreachKind {
    TaskCompleted,
    MorningBrief,
    Checkin,
    PendingTasks,
}

impl OutreachKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCompleted => "task_completed",
            Self::MorningBrief => "morning_brief",
            Self::Checkin => "checkin",
            Self::PendingTasks => "pending_tasks",
        }
    }
}

/// Poll response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutreachEvent {
    pub trigger: bool,
    #[serde(rename = "type")]
    pub kind: Option<&'static str>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tasks: Option<Vec<PendingTaskSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<ExecutedTask>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_hints: Option<String>,
}

impl OutreachEvent {
    /// Nothing to say.
    pub fn none() -> Self {
        Self::default()
    }

    fn of(kind: OutreachKind, trigger: bool, message: String) -> Self {
        Self {
            trigger,
            kind: Some(kind.as_str()),
            message,
            ..Self::default()
        }
    }
}

pub struct OutreachTrigger {
    executor: Arc<TaskExecutor>,
    config: OutreachConfig,
}

impl OutreachTrigger {
    pub fn new(executor: Arc<TaskExecutor>, config: OutreachConfig) -> Self {
        Self { executor, config }
    }

    /// Evaluate for `owner` whose local clock reads `current_hour`.
    pub async fn poll(&self, owner: &str, current_hour: u32) -> OutreachEvent {
        self.poll_at(owner, current_hour, Utc::now()).await
    }

    pub async fn poll_at(&self, owner: &str, current_hour: u32, now: DateTime<Utc>) -> OutreachEvent {
        match self.evaluate(owner, current_hour, now).await {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("outreach evaluation for {owner} failed, reporting no event: {e}");
                OutreachEvent::none()
            }
        }
    }

    async fn evaluate(&self, owner: &str, current_hour: u32, now: DateTime<Utc>) -> Result<OutreachEvent> {
        let batch = self.executor.run_due_for_owner(owner, now).await?;
        if !batch.executed.is_empty() {
            let count = batch.executed.len();
            let mut event = OutreachEvent::of(
                OutreachKind::TaskCompleted,
                true,
                format!("I completed {count} task(s) while you were away."),
            );
            event.tasks = Some(batch.executed);
            return Ok(event);
        }

        let db = self.executor.db();
        let window = Duration::hours(self.config.dedup_window_hours);
        let idle = db.last_activity(owner)?.map(|seen| now - seen);
        let checkin_after = Duration::days(self.config.checkin_idle_days);

        let in_morning =
            (self.config.morning_start_hour..self.config.morning_end_hour).contains(&current_hour);
        let idle_since_morning = idle.is_some_and(|d| {
            d > Duration::hours(self.config.morning_idle_hours) && d < checkin_after
        });
        if in_morning
            && idle_since_morning
            && db.try_log_outreach(owner, OutreachKind::MorningBrief.as_str(), window, now)?
        {
            let pending = db.pending_human_tasks(owner)?;
            let mut event = OutreachEvent::of(
                OutreachKind::MorningBrief,
                true,
                "Good morning! Here is your brief for today.".to_string(),
            );
            event.pending_tasks = Some(pending);
            return Ok(self.surfaced(owner, event));
        }

        if let Some(idle) = idle.filter(|d| *d >= checkin_after) {
            if db.try_log_outreach(owner, OutreachKind::Checkin.as_str(), window, now)? {
                let days = idle.num_days();
                let hints = db.recent_memories(owner, self.config.memory_hint_limit)?;
                let mut event = OutreachEvent::of(
                    OutreachKind::Checkin,
                    true,
                    format!("It has been {days} days. Checking in."),
                );
                event.days_since = Some(days);
                event.memory_hints = (!hints.is_empty()).then(|| hints.join("; "));
                return Ok(self.surfaced(owner, event));
            }
        }

        let pending = db.pending_human_tasks(owner)?;
        if !pending.is_empty()
            && db.try_log_outreach(owner, OutreachKind::PendingTasks.as_str(), window, now)?
        {
            let mut event = OutreachEvent::of(
                OutreachKind::PendingTasks,
                false,
                format!("{} task(s) awaiting your approval in the Tasks tab", pending.len()),
            );
            event.pending_tasks = Some(pending);
            return Ok(self.surfaced(owner, event));
        }

        Ok(OutreachEvent::none())
    }

    fn surfaced(&self, owner: &str, event: OutreachEvent) -> OutreachEvent {
        tracing::debug!("outreach {:?} surfaced for {owner}", event.kind);
        self.executor.worklog().write(
            owner,
            WorklogType::ProactiveCheck,
            &event.message,
            json!({ "type": event.kind, "trigger": event.trigger }),
        );
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorSettings;
    use crate::persistence::SchedulerDb;
    use crate::tasks::{NewTask, TriggerConfig};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
    }

    fn trigger() -> OutreachTrigger {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let executor = Arc::new(TaskExecutor::new(db, None, ExecutorSettings::default()));
        OutreachTrigger::new(executor, OutreachConfig::default())
    }

    fn db(t: &OutreachTrigger) -> &Arc<SchedulerDb> {
        t.executor.db()
    }

    fn add_approval(t: &OutreachTrigger, id: &str) {
        db(t)
            .create_task("u1", &NewTask::human(id, "post it", "Approve post", json!({})), now())
            .unwrap();
    }

    fn logged(t: &OutreachTrigger, kind: OutreachKind) -> bool {
        db(t)
            .outreach_logged_within("u1", kind.as_str(), Duration::hours(12), now())
            .unwrap()
    }

    #[tokio::test]
    async fn test_checkin_after_four_days() {
        let t = trigger();
        db(&t).touch_activity("u1", now() - Duration::days(4)).unwrap();
        db(&t).add_memory("u1", "training for a marathon", now() - Duration::days(5)).unwrap();

        let event = t.poll_at("u1", 9, now()).await;
        assert!(event.trigger);
        assert_eq!(event.kind, Some("checkin"));
        assert_eq!(event.days_since, Some(4));
        assert_eq!(event.memory_hints.as_deref(), Some("training for a marathon"));
        assert!(logged(&t, OutreachKind::Checkin));
        assert!(!logged(&t, OutreachKind::MorningBrief));

        // deduplicated within the window
        assert_eq!(t.poll_at("u1", 9, now() + Duration::hours(1)).await, OutreachEvent::none());
        // fires again once the window has elapsed
        let later = t.poll_at("u1", 9, now() + Duration::hours(13)).await;
        assert_eq!(later.kind, Some("checkin"));
    }

    #[tokio::test]
    async fn test_recent_activity_skips_morning_brief() {
        let t = trigger();
        db(&t).touch_activity("u1", now() - Duration::hours(1)).unwrap();
        assert_eq!(t.poll_at("u1", 9, now()).await, OutreachEvent::none());

        add_approval(&t, "h1");
        let event = t.poll_at("u1", 9, now()).await;
        assert!(!event.trigger);
        assert_eq!(event.kind, Some("pending_tasks"));
        assert_eq!(event.pending_tasks.as_ref().unwrap().len(), 1);
        assert!(!logged(&t, OutreachKind::MorningBrief));
    }

    #[tokio::test]
    async fn test_morning_brief_once_per_window() {
        let t = trigger();
        db(&t).touch_activity("u1", now() - Duration::hours(6)).unwrap();
        add_approval(&t, "h1");

        let event = t.poll_at("u1", 9, now()).await;
        assert!(event.trigger);
        assert_eq!(event.kind, Some("morning_brief"));
        assert_eq!(event.pending_tasks.as_ref().unwrap()[0].label, "Approve post");

        // second poll falls through to the soft pending notice, then to nothing
        let second = t.poll_at("u1", 9, now() + Duration::minutes(1)).await;
        assert_eq!(second.kind, Some("pending_tasks"));
        let third = t.poll_at("u1", 9, now() + Duration::minutes(2)).await;
        assert_eq!(third, OutreachEvent::none());

        let entries = t.executor.worklog().list("u1", None, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.kind == "proactive_check"));
    }

    #[tokio::test]
    async fn test_morning_brief_only_in_morning_hours() {
        let t = trigger();
        db(&t).touch_activity("u1", now() - Duration::hours(6)).unwrap();
        assert_eq!(t.poll_at("u1", 11, now()).await, OutreachEvent::none());
        assert_eq!(t.poll_at("u1", 7, now()).await, OutreachEvent::none());
        assert_eq!(t.poll_at("u1", 8, now()).await.kind, Some("morning_brief"));
    }

    #[tokio::test]
    async fn test_unknown_activity_gets_no_greeting() {
        let t = trigger();
        assert_eq!(t.poll_at("u1", 9, now()).await, OutreachEvent::none());
    }

    #[tokio::test]
    async fn test_due_tasks_reported_without_outreach_log() {
        let t = trigger();
        db(&t).touch_activity("u1", now() - Duration::days(4)).unwrap();
        let task = NewTask::ai("a1", "summarize inbox", "Inbox summary", TriggerConfig::Manual)
            .with_scheduled_at(now() - Duration::minutes(5));
        db(&t).create_task("u1", &task, now()).unwrap();

        let event = t.poll_at("u1", 9, now()).await;
        assert!(event.trigger);
        assert_eq!(event.kind, Some("task_completed"));
        assert_eq!(event.tasks.as_ref().unwrap()[0].id, "a1");
        assert!(!logged(&t, OutreachKind::TaskCompleted));
        assert!(!logged(&t, OutreachKind::Checkin));

        // the task is done, so the next poll moves on to the check-in
        assert_eq!(t.poll_at("u1", 9, now()).await.kind, Some("checkin"));
    }

    #[tokio::test]
    async fn test_database_errors_become_no_event() {
        let t = trigger();
        db(&t).touch_activity("u1", now() - Duration::days(4)).unwrap();
        db(&t)
            .conn()
            .unwrap()
            .execute_batch("DROP TABLE sparkie_outreach_log;")
            .unwrap();
        assert_eq!(t.poll_at("u1", 9, now()).await, OutreachEvent::none());
    }

    #[test]
    fn test_event_wire_shape() {
        let mut event = OutreachEvent::of(OutreachKind::Checkin, true, "hi".into());
        event.days_since = Some(4);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"trigger": true, "type": "checkin", "message": "hi", "daysSince": 4}));
        assert_eq!(
            serde_json::to_value(OutreachEvent::none()).unwrap(),
            json!({"trigger": false, "type": null, "message": ""})
        );
    }
}
