//! Task definitions: the core data model for scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sparkie_core::error::{Result, SparkieError};

use crate::cron;

/// Used when a stored cron config has lost its expression.
pub const DEFAULT_CRON_EXPRESSION: &str = "0 9 * * 1";

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(SparkieError::InvalidInput(format!("unknown task status '{other}'"))),
        }
    }

    /// Terminal for delay/manual tasks. Cron tasks never reach these on success.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Who carries the task out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Ai,
    #[default]
    Human,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ai" => Ok(Self::Ai),
            "human" => Ok(Self::Human),
            other => Err(SparkieError::InvalidInput(format!("unknown executor '{other}'"))),
        }
    }
}

/// How a task becomes due. Each variant carries exactly the parameters its
/// trigger type needs; the database stores the type name and a JSON config
/// side by side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TriggerConfig {
    /// Not time-driven.
    #[default]
    Manual,
    /// Fire once at `fire_at`.
    Delay { fire_at: DateTime<Utc> },
    /// Recur on a cron expression.
    Cron { expression: String },
}

impl TriggerConfig {
    pub fn trigger_type(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Delay { .. } => "delay",
            Self::Cron { .. } => "cron",
        }
    }

    pub fn is_cron(&self) -> bool {
        matches!(self, Self::Cron { .. })
    }

    /// Validate a `(trigger_type, trigger_config)` pair coming from a caller.
    pub fn parse(trigger_type: &str, config: &Value) -> Result<Self> {
        match trigger_type {
            "manual" => Ok(Self::Manual),
            "delay" => {
                let fire_at = config["fireAt"]
                    .as_str()
                    .ok_or_else(|| SparkieError::InvalidInput("delay trigger needs fireAt".into()))?;
                let fire_at = DateTime::parse_from_rfc3339(fire_at)
                    .map_err(|e| SparkieError::InvalidInput(format!("fireAt: {e}")))?
                    .with_timezone(&Utc);
                Ok(Self::Delay { fire_at })
            }
            "cron" => {
                let expression = config["expression"]
                    .as_str()
                    .ok_or_else(|| SparkieError::InvalidInput("cron trigger needs expression".into()))?;
                cron::CronSchedule::parse(expression)?;
                Ok(Self::Cron {
                    expression: expression.to_string(),
                })
            }
            other => Err(SparkieError::InvalidInput(format!("unknown trigger type '{other}'"))),
        }
    }

    /// Lenient decoding for rows already in the database.
    pub(crate) fn from_stored(trigger_type: &str, config: &Value) -> Self {
        match Self::parse(trigger_type, config) {
            Ok(trigger) => trigger,
            Err(e) if trigger_type == "cron" => {
                tracing::warn!("stored cron config unusable ({e}), using '{DEFAULT_CRON_EXPRESSION}'");
                Self::Cron {
                    expression: config["expression"]
                        .as_str()
                        .unwrap_or(DEFAULT_CRON_EXPRESSION)
                        .to_string(),
                }
            }
            Err(e) => {
                tracing::warn!("stored trigger '{trigger_type}' unusable ({e}), treating as manual");
                Self::Manual
            }
        }
    }

    pub fn config_json(&self) -> Value {
        match self {
            Self::Manual => json!({}),
            Self::Delay { fire_at } => json!({"fireAt": fire_at.to_rfc3339()}),
            Self::Cron { expression } => json!({"expression": expression}),
        }
    }

    /// Initial `scheduled_at` when the creator did not give one.
    pub fn initial_schedule(&self, now: DateTime<Utc>, cron_offset_minutes: i32) -> Option<DateTime<Utc>> {
        match self {
            Self::Manual => None,
            Self::Delay { fire_at } => Some(*fire_at),
            Self::Cron { expression } => Some(cron::next_fire_time_with_offset(
                expression,
                now,
                cron_offset_minutes,
            )),
        }
    }
}

/// A scheduled task.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    /// Owning user id.
    pub owner: String,
    /// Runbook handed to the completion service.
    pub action: String,
    /// Human-readable title.
    pub label: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub executor: ExecutorKind,
    pub trigger: TriggerConfig,
    /// `None` means not time-driven.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub why_human: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "action": self.action,
            "label": self.label,
            "payload": self.payload,
            "status": self.status,
            "executor": self.executor,
            "trigger_type": self.trigger.trigger_type(),
            "trigger_config": self.trigger.config_json(),
            "scheduled_at": self.scheduled_at.map(|t| t.to_rfc3339()),
            "why_human": self.why_human,
            "created_at": self.created_at.to_rfc3339(),
            "resolved_at": self.resolved_at.map(|t| t.to_rfc3339()),
        })
    }
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub action: String,
    pub label: String,
    pub payload: Value,
    pub executor: ExecutorKind,
    pub trigger: TriggerConfig,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub why_human: Option<String>,
}

impl NewTask {
    /// A plain approval task: human executor, manual trigger.
    pub fn human(id: &str, action: &str, label: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            action: action.to_string(),
            label: label.to_string(),
            payload,
            executor: ExecutorKind::Human,
            trigger: TriggerConfig::Manual,
            scheduled_at: None,
            why_human: None,
        }
    }

    /// An AI task driven by `trigger`.
    pub fn ai(id: &str, action: &str, label: &str, trigger: TriggerConfig) -> Self {
        Self {
            executor: ExecutorKind::Ai,
            trigger,
            ..Self::human(id, action, label, json!({}))
        }
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.action.trim().is_empty() || self.label.trim().is_empty() {
            return Err(SparkieError::InvalidInput("id, action and label are required".into()));
        }
        if !self.payload.is_object() {
            return Err(SparkieError::InvalidInput("payload must be an object".into()));
        }
        Ok(())
    }
}

/// Target of an explicit human resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    Rejected,
    Completed,
    Failed,
    Skipped,
    Pending,
}

impl Resolution {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "pending" => Ok(Self::Pending),
            other => Err(SparkieError::InvalidInput(format!("invalid resolution status '{other}'"))),
        }
    }

    /// `approved` → completed, `rejected` → skipped, the rest pass through.
    pub fn target_status(&self) -> TaskStatus {
        match self {
            Self::Approved | Self::Completed => TaskStatus::Completed,
            Self::Rejected | Self::Skipped => TaskStatus::Skipped,
            Self::Failed => TaskStatus::Failed,
            Self::Pending => TaskStatus::Pending,
        }
    }
}

/// Status filter for listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Open tasks plus anything created within the recent window.
    All,
    Only(TaskStatus),
}

impl StatusFilter {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "all" {
            Ok(Self::All)
        } else {
            TaskStatus::parse(s).map(Self::Only)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
        assert!(TaskStatus::parse("running").is_err());
    }

    #[test]
    fn test_resolution_mapping() {
        assert_eq!(Resolution::Approved.target_status(), TaskStatus::Completed);
        assert_eq!(Resolution::Rejected.target_status(), TaskStatus::Skipped);
        assert_eq!(Resolution::Failed.target_status(), TaskStatus::Failed);
        assert_eq!(Resolution::Pending.target_status(), TaskStatus::Pending);
        assert!(Resolution::parse("done").is_err());
    }

    #[test]
    fn test_trigger_parse_validates() {
        let cron = TriggerConfig::parse("cron", &json!({"expression": "0 9 * * *"})).unwrap();
        assert!(cron.is_cron());
        assert!(TriggerConfig::parse("cron", &json!({"expression": "nope"})).is_err());
        assert!(TriggerConfig::parse("cron", &json!({})).is_err());
        assert!(TriggerConfig::parse("delay", &json!({"fireAt": "yesterday"})).is_err());
        assert!(TriggerConfig::parse("interval", &json!({})).is_err());

        let delay = TriggerConfig::parse("delay", &json!({"fireAt": "2026-10-20T09:00:00Z"})).unwrap();
        assert_eq!(
            delay,
            TriggerConfig::Delay {
                fire_at: Utc.with_ymd_and_hms(2026, 10, 20, 9, 0, 0).unwrap()
            }
        );
        assert_eq!(TriggerConfig::parse("manual", &Value::Null).unwrap(), TriggerConfig::Manual);
    }

    #[test]
    fn test_stored_cron_without_expression_uses_default() {
        let trigger = TriggerConfig::from_stored("cron", &json!({}));
        assert_eq!(
            trigger,
            TriggerConfig::Cron {
                expression: DEFAULT_CRON_EXPRESSION.into()
            }
        );
        assert_eq!(TriggerConfig::from_stored("weird", &json!({})), TriggerConfig::Manual);
    }

    #[test]
    fn test_initial_schedule() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        assert_eq!(TriggerConfig::Manual.initial_schedule(now, 0), None);
        let cron = TriggerConfig::Cron {
            expression: "0 9 * * *".into(),
        };
        assert_eq!(
            cron.initial_schedule(now, 0),
            Some(Utc.with_ymd_and_hms(2026, 10, 20, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_new_task_validation() {
        assert!(NewTask::human("t-1", "do", "Do", json!({})).validate().is_ok());
        assert!(NewTask::human("", "do", "Do", json!({})).validate().is_err());
        assert!(NewTask::human("t-1", "do", "Do", json!([1])).validate().is_err());
    }
}
