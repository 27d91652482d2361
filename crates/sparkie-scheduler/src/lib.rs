//! # Sparkie Scheduler
//!
//! Autonomous task scheduling and execution engine.
//!
//! ## Design Principles
//! - The database is the only shared state, between components and between replicas
//! - One heartbeat tick at a time across the cluster (advisory lock)
//! - A task is claimed with a conditional update before it runs, on every path
//! - Proactive outreach is best-effort and never fails a poll
//!
//! ## Architecture
//! ```text
//! HeartbeatScheduler (tokio interval, first tick shortly after boot)
//!   └── Heartbeat::tick ── with_lock(HeartbeatLock)
//!         └── for each owner with due tasks → TaskExecutor
//!               ├── claim (pending → in_progress)
//!               ├── CompletionClient (streamed, hard timeout)
//!               ├── cron → pending @ next fire time | else → completed | error → failed
//!               └── WorklogWriter (one entry per attempt)
//!
//! Client poll → OutreachTrigger
//!   ├── due tasks for the caller (inline TaskExecutor batch)
//!   ├── morning_brief / checkin (deduplicated via the outreach log)
//!   └── pending approvals (soft notice)
//! ```

pub mod cron;
pub mod engine;
pub mod executor;
pub mod lock;
pub mod outreach;
pub mod persistence;
pub mod tasks;
pub mod worklog;

pub use engine::{Heartbeat, HeartbeatScheduler, TickReport};
pub use executor::{BatchReport, ExecutedTask, ExecutorSettings, TaskExecutor};
pub use lock::{HeartbeatLock, LocalHeartbeatLock, SqliteLeaseLock, with_lock};
#[cfg(feature = "postgres")]
pub use lock::PgAdvisoryLock;
pub use outreach::{OutreachEvent, OutreachKind, OutreachTrigger};
pub use persistence::{PendingTaskSummary, SchedulerDb};
pub use tasks::{
    ExecutorKind, NewTask, Resolution, StatusFilter, Task, TaskStatus, TriggerConfig,
};
pub use worklog::{WorklogEntry, WorklogStats, WorklogType, WorklogWriter};
