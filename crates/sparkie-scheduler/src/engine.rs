//! Heartbeat engine: the background loop that advances due AI tasks.
//! Fires once shortly after boot to catch work that fell due during
//! downtime, then on a fixed interval. Each tick runs under the heartbeat
//! lock, so only one replica in the cluster does the work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sparkie_core::config::SchedulerConfig;
use sparkie_core::error::Result;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::executor::TaskExecutor;
use crate::lock::{HeartbeatLock, with_lock};

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// False when another holder had the lock and nothing was attempted.
    pub ran: bool,
    pub owners: usize,
    pub executed: usize,
    pub failed: usize,
    /// Abandoned claims settled at the start of the tick.
    pub recovered: usize,
}

/// One scheduler pass over every owner with due tasks.
pub struct Heartbeat {
    executor: Arc<TaskExecutor>,
    lock: Arc<dyn HeartbeatLock>,
}

impl Heartbeat {
    pub fn new(executor: Arc<TaskExecutor>, lock: Arc<dyn HeartbeatLock>) -> Self {
        Self { executor, lock }
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let outcome = with_lock(self.lock.as_ref(), || self.run_owners(now)).await?;
        Ok(outcome.unwrap_or_default())
    }

    async fn run_owners(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let recovered = self.executor.recover_stale_claims(now).unwrap_or_else(|e| {
            tracing::warn!("stale claim recovery failed: {e}");
            0
        });
        let owners = self.executor.due_owners(now)?;
        let mut report = TickReport {
            ran: true,
            owners: owners.len(),
            recovered,
            ..TickReport::default()
        };
        if owners.is_empty() {
            return Ok(report);
        }

        tracing::info!("💓 Tick: {} owner(s) with due tasks", owners.len());
        for owner in owners {
            match self.executor.run_due_for_owner(&owner, now).await {
                Ok(batch) => {
                    if batch.attempted() > 0 {
                        tracing::info!(
                            "Executed {} task(s) for {} ({} failed)",
                            batch.executed.len(),
                            owner,
                            batch.failed.len()
                        );
                    }
                    report.executed += batch.executed.len();
                    report.failed += batch.failed.len();
                }
                Err(e) => tracing::warn!("batch for {owner} aborted: {e}"),
            }
        }
        Ok(report)
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the periodic tick task. Created once by the host process.
pub struct HeartbeatScheduler {
    heartbeat: Arc<Heartbeat>,
    interval: Duration,
    initial_delay: Duration,
    running: Mutex<Option<Running>>,
}

impl HeartbeatScheduler {
    pub fn new(heartbeat: Arc<Heartbeat>, interval: Duration, initial_delay: Duration) -> Self {
        Self {
            heartbeat,
            interval: interval.max(Duration::from_millis(1)),
            initial_delay,
            running: Mutex::new(None),
        }
    }

    pub fn from_config(heartbeat: Arc<Heartbeat>, config: &SchedulerConfig) -> Self {
        Self::new(
            heartbeat,
            Duration::from_secs(config.interval_secs),
            Duration::from_secs(config.initial_delay_secs),
        )
    }

    /// Spawn the tick loop. Returns `false` (and does nothing) if it is
    /// already running. Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let Ok(mut running) = self.running.lock() else {
            return false;
        };
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let heartbeat = self.heartbeat.clone();
        let interval = self.interval;
        let first = Instant::now() + self.initial_delay;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeat.tick().await {
                            tracing::error!("heartbeat tick error: {e}");
                        }
                    }
                }
            }
            tracing::debug!("heartbeat loop stopped");
        });

        tracing::info!(
            "⏰ Heartbeat scheduler started ({}s interval, first tick in {}s)",
            interval.as_secs(),
            self.initial_delay.as_secs()
        );
        *running = Some(Running { cancel, handle });
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Cancel the loop and wait for an in-flight tick to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("heartbeat loop ended abnormally: {e}");
            }
        }
    }
}
