//! Task Executor: selects due AI tasks, drives them through the lifecycle
//! and hands the actual work to the completion service.
//!
//! Lifecycle of one attempt:
//! ```text
//! pending ──claim──▶ in_progress ──ok──▶ completed        (delay / manual)
//!                         │        └─ok──▶ pending + next  (cron)
//!                         └──error/timeout──▶ failed
//! ```
//! A claim abandoned by a runner that died is settled by
//! [`TaskExecutor::recover_stale_claims`]: cron back to `pending`, others `failed`.
//! Tasks in a batch run one after another, oldest `scheduled_at` first. A
//! failing task never stops the rest of its batch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sparkie_core::config::{CompletionConfig, SchedulerConfig};
use sparkie_core::error::{Result, SparkieError};
use sparkie_providers::{ChatMessage, CompletionClient, CompletionRequest};
use std::sync::Arc;
use std::time::Duration;

use crate::cron;
use crate::persistence::SchedulerDb;
use crate::tasks::{Task, TriggerConfig};
use crate::worklog::{WorklogType, WorklogWriter};

/// Result text when no completion credential is configured.
pub const UNAVAILABLE_RESULT: &str = "Task executed (completion service unavailable)";
/// Result text when the service answered with nothing.
pub const EMPTY_RESULT: &str = "Task completed";
/// A claim older than this many task timeouts is considered abandoned.
const STALE_CLAIM_FACTOR: u32 = 2;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub batch_size: usize,
    pub task_timeout: Duration,
    pub max_result_chars: usize,
    pub model: String,
    pub cron_offset_minutes: i32,
}

impl ExecutorSettings {
    pub fn from_config(scheduler: &SchedulerConfig, completion: &CompletionConfig) -> Self {
        Self {
            batch_size: scheduler.batch_size.max(1),
            task_timeout: Duration::from_secs(scheduler.task_timeout_secs),
            max_result_chars: scheduler.max_result_chars,
            model: completion.model.clone(),
            cron_offset_minutes: scheduler.cron_utc_offset_minutes,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default(), &CompletionConfig::default())
    }
}

/// A task that ran successfully, as reported to the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedTask {
    pub id: String,
    pub label: String,
    pub result: String,
}

/// What one batch did.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub executed: Vec<ExecutedTask>,
    pub failed: Vec<String>,
    /// Selected as due but claimed by another path first.
    pub lost_claims: usize,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.executed.len() + self.failed.len()
    }
}

pub struct TaskExecutor {
    db: Arc<SchedulerDb>,
    completion: Option<Arc<dyn CompletionClient>>,
    worklog: WorklogWriter,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        db: Arc<SchedulerDb>,
        completion: Option<Arc<dyn CompletionClient>>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            worklog: WorklogWriter::new(db.clone()),
            db,
            completion,
            settings,
        }
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    pub fn worklog(&self) -> &WorklogWriter {
        &self.worklog
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn due_owners(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.db.due_owners(now)
    }

    /// Run up to `batch_size` due tasks for one owner.
    ///
    /// Only selection errors propagate; everything after that is handled
    /// per task.
    pub async fn run_due_for_owner(&self, owner: &str, now: DateTime<Utc>) -> Result<BatchReport> {
        let due = self.db.due_tasks(owner, now, self.settings.batch_size)?;
        let mut report = BatchReport::default();

        for task in due {
            match self.db.claim_task(&task.id, now) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("task {} already claimed, skipping", task.id);
                    report.lost_claims += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("claim of task {} failed: {e}", task.id);
                    continue;
                }
            }

            let (headline, stage, error) = match self.invoke(&task).await {
                Ok(result) => match self.record_success(&task, now) {
                    Ok(()) => {
                        tracing::info!("✅ Task '{}' completed for {}", task.label, owner);
                        self.worklog.write(
                            owner,
                            WorklogType::TaskExecuted,
                            &result,
                            json!({
                                "taskLabel": task.label,
                                "taskId": task.id,
                                "trigger": task.trigger.trigger_type(),
                            }),
                        );
                        report.executed.push(ExecutedTask {
                            id: task.id,
                            label: task.label,
                            result,
                        });
                        continue;
                    }
                    // The service did its part; only our bookkeeping failed.
                    Err(e) => {
                        tracing::error!("Task {} ran but its outcome was not saved: {e}", task.id);
                        ("Task result not saved", "store", e)
                    }
                },
                Err(e) => {
                    tracing::warn!("❌ Task {} failed: {e}", task.id);
                    ("Task failed", "completion", e)
                }
            };

            if let Err(db_e) = self.db.fail_task(&task.id, now) {
                tracing::warn!("could not mark task {} failed: {db_e}", task.id);
            }
            self.worklog.write(
                owner,
                WorklogType::Error,
                &format!("{headline}: {}", task.label),
                json!({
                    "taskLabel": task.label,
                    "taskId": task.id,
                    "stage": stage,
                    "error": error.to_string(),
                }),
            );
            report.failed.push(task.id);
        }

        Ok(report)
    }

    /// Success transition: cron tasks go back to `pending` at their next fire
    /// time, everything else completes.
    fn record_success(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        match &task.trigger {
            TriggerConfig::Cron { expression } => {
                let next =
                    cron::next_fire_time_with_offset(expression, now, self.settings.cron_offset_minutes);
                self.db.reschedule_task(&task.id, next)?;
                tracing::debug!("cron task {} rescheduled for {next}", task.id);
            }
            TriggerConfig::Delay { .. } | TriggerConfig::Manual => {
                self.db.complete_task(&task.id, now)?;
            }
        }
        Ok(())
    }

    /// Settle tasks left `in_progress` by a runner that died mid-task. A claim
    /// older than twice the task timeout cannot still be running.
    pub fn recover_stale_claims(&self, now: DateTime<Utc>) -> Result<usize> {
        let grace = chrono::Duration::from_std(self.settings.task_timeout * STALE_CLAIM_FACTOR)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let recovered = self.db.recover_stale_claims(now - grace, now)?;
        for task in &recovered {
            tracing::warn!(
                "Recovered abandoned task {} for {} (now {})",
                task.id,
                task.owner,
                task.status.as_str()
            );
            self.worklog.write(
                &task.owner,
                WorklogType::Error,
                &format!("Task interrupted: {}", task.label),
                json!({
                    "taskLabel": task.label,
                    "taskId": task.id,
                    "stage": "recovery",
                    "status": task.status.as_str(),
                }),
            );
        }
        Ok(recovered.len())
    }

    async fn invoke(&self, task: &Task) -> Result<String> {
        let Some(client) = &self.completion else {
            return Ok(UNAVAILABLE_RESULT.to_string());
        };

        let request = CompletionRequest {
            messages: vec![ChatMessage::user(execution_prompt(task))],
            model: self.settings.model.clone(),
        };
        let text = tokio::time::timeout(self.settings.task_timeout, client.complete(&request))
            .await
            .map_err(|_| {
                SparkieError::Timeout(format!(
                    "{} did not answer within {}s",
                    client.name(),
                    self.settings.task_timeout.as_secs()
                ))
            })??;

        Ok(shape_result(&text, self.settings.max_result_chars))
    }
}

/// Instruction sent to the completion service for one task.
pub fn execution_prompt(task: &Task) -> String {
    [
        "[AUTONOMOUS TASK EXECUTION — PROACTIVE HEARTBEAT]".to_string(),
        format!("Task: {}", task.label),
        format!("Runbook: {}", task.action),
        String::new(),
        "Execute this task now. Be thorough and specific. Report exactly what was done.".to_string(),
    ]
    .join("\n")
}

/// Trim, cap at `max_chars` characters, and never return an empty result.
fn shape_result(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return EMPTY_RESULT.to_string();
    }
    trimmed.chars().take(max_chars).collect()
}
