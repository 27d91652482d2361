//! Heartbeat lock: cluster-wide, non-blocking mutual exclusion for one
//! scheduler tick.
//!
//! Losing the race is the normal steady state with several replicas, so
//! contention is reported as `Ok(false)` and never as an error.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::FutureExt;
use rusqlite::params;
use sparkie_core::error::Result;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::persistence::{SchedulerDb, db_err, ts};

/// Advisory lock guarding the background tick.
#[async_trait]
pub trait HeartbeatLock: Send + Sync {
    fn name(&self) -> &str;

    /// Try to take the lock without waiting.
    async fn try_acquire(&self) -> Result<bool>;

    /// Give the lock back. Releasing a lock not held is a no-op.
    async fn release(&self) -> Result<()>;

    /// How often a held lock must be renewed. `None` for locks that do not expire.
    fn renew_every(&self) -> Option<std::time::Duration> {
        None
    }

    /// Extend a held lock. `Ok(false)` means it was lost.
    async fn renew(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Run `f` only if `lock` can be taken right now.
///
/// Returns `Ok(None)` without calling `f` when another holder has the lock.
/// Expiring locks are renewed while `f` runs. The lock is released on every
/// exit from `f`, panics included.
pub async fn with_lock<T, F, Fut>(lock: &dyn HeartbeatLock, f: F) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !lock.try_acquire().await? {
        tracing::debug!("[{}] heartbeat lock held elsewhere, skipping tick", lock.name());
        return Ok(None);
    }

    let work = AssertUnwindSafe(async move { f().await }).catch_unwind();
    let outcome = match lock.renew_every() {
        None => work.await,
        Some(period) => {
            tokio::pin!(work);
            let mut renewals = tokio::time::interval(period);
            renewals.tick().await;
            loop {
                tokio::select! {
                    out = &mut work => break out,
                    _ = renewals.tick() => match lock.renew().await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!("[{}] heartbeat lock lost mid-tick", lock.name()),
                        Err(e) => tracing::warn!("[{}] heartbeat lock renewal failed: {e}", lock.name()),
                    },
                }
            }
        }
    };

    if let Err(e) = lock.release().await {
        tracing::warn!("[{}] heartbeat lock release failed: {e}", lock.name());
    }

    match outcome {
        Ok(result) => result.map(Some),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Lease row in the shared SQLite file. A holder that dies without releasing
/// blocks others only until the lease expires. A live holder renews every
/// third of the TTL.
pub struct SqliteLeaseLock {
    db: Arc<SchedulerDb>,
    key: i64,
    holder: String,
    ttl: Duration,
}

impl SqliteLeaseLock {
    pub fn new(db: Arc<SchedulerDb>, key: i64, ttl_secs: u64) -> Self {
        Self {
            db,
            key,
            holder: uuid::Uuid::new_v4().to_string(),
            ttl: Duration::seconds(ttl_secs.max(1) as i64),
        }
    }
}

#[async_trait]
impl HeartbeatLock for SqliteLeaseLock {
    fn name(&self) -> &str {
        "sqlite-lease"
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let conn = self.db.conn()?;
        conn.execute(
            "DELETE FROM heartbeat_locks WHERE lock_key = ?1 AND expires_at <= ?2",
            params![self.key, ts(now)],
        )
        .map_err(db_err)?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO heartbeat_locks (lock_key, holder, expires_at)
                 VALUES (?1, ?2, ?3)",
                params![self.key, self.holder, ts(now + self.ttl)],
            )
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    async fn release(&self) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "DELETE FROM heartbeat_locks WHERE lock_key = ?1 AND holder = ?2",
            params![self.key, self.holder],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn renew_every(&self) -> Option<std::time::Duration> {
        self.ttl.to_std().ok().map(|ttl| ttl / 3)
    }

    async fn renew(&self) -> Result<bool> {
        let conn = self.db.conn()?;
        let extended = conn
            .execute(
                "UPDATE heartbeat_locks SET expires_at = ?3 WHERE lock_key = ?1 AND holder = ?2",
                params![self.key, self.holder, ts(Utc::now() + self.ttl)],
            )
            .map_err(db_err)?;
        Ok(extended == 1)
    }
}

/// In-process lock for a single replica.
#[derive(Default)]
pub struct LocalHeartbeatLock {
    held: AtomicBool,
}

impl LocalHeartbeatLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[async_trait]
impl HeartbeatLock for LocalHeartbeatLock {
    fn name(&self) -> &str {
        "local"
    }

    async fn try_acquire(&self) -> Result<bool> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn release(&self) -> Result<()> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgAdvisoryLock;

#[cfg(feature = "postgres")]
mod pg {
    use super::*;
    use sparkie_core::error::SparkieError;
    use sqlx::pool::PoolConnection;
    use sqlx::postgres::{PgPool, PgPoolOptions};
    use sqlx::Postgres;
    use tokio::sync::Mutex;

    /// `pg_try_advisory_lock` on a fixed key. Advisory locks belong to a
    /// session, so the connection that took the lock is pinned until release.
    pub struct PgAdvisoryLock {
        pool: PgPool,
        key: i64,
        session: Mutex<Option<PoolConnection<Postgres>>>,
    }

    fn pg_err(e: sqlx::Error) -> SparkieError {
        SparkieError::Database(format!("postgres: {e}"))
    }

    impl PgAdvisoryLock {
        pub async fn connect(url: &str, key: i64) -> Result<Self> {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(url)
                .await
                .map_err(pg_err)?;
            Ok(Self {
                pool,
                key,
                session: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl HeartbeatLock for PgAdvisoryLock {
        fn name(&self) -> &str {
            "pg-advisory"
        }

        async fn try_acquire(&self) -> Result<bool> {
            let mut session = self.session.lock().await;
            if session.is_some() {
                return Ok(false);
            }
            let mut conn = self.pool.acquire().await.map_err(pg_err)?;
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await
                .map_err(pg_err)?;
            if locked {
                *session = Some(conn);
            }
            Ok(locked)
        }

        async fn release(&self) -> Result<()> {
            let Some(mut conn) = self.session.lock().await.take() else {
                return Ok(());
            };
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(&mut *conn)
                .await
                .map_err(pg_err)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkie_core::error::SparkieError;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_simultaneous_ticks_only_one_runs() {
        let lock = LocalHeartbeatLock::new();
        let runs = AtomicUsize::new(0);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let first = with_lock(&lock, || async {
            runs.fetch_add(1, Ordering::SeqCst);
            let _ = rx.await;
            Ok::<_, SparkieError>(1)
        });
        let second = async {
            tokio::task::yield_now().await;
            let result = with_lock(&lock, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SparkieError>(2)
            })
            .await;
            let _ = tx.send(());
            result
        };

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), Some(1));
        assert_eq!(b.unwrap(), None);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let lock = LocalHeartbeatLock::new();
        let result: Result<Option<()>> =
            with_lock(&lock, || async { Err(SparkieError::Database("boom".into())) }).await;
        assert!(result.is_err());
        assert!(!lock.is_held());
        assert_eq!(with_lock(&lock, || async { Ok::<_, SparkieError>(5) }).await.unwrap(), Some(5));
    }

    fn explode() -> Result<()> {
        panic!("tick blew up")
    }

    #[tokio::test]
    async fn test_released_after_panic() {
        let lock = Arc::new(LocalHeartbeatLock::new());
        let inner = lock.clone();
        let handle = tokio::spawn(async move {
            let _ = with_lock(inner.as_ref(), || async { explode() }).await;
        });
        assert!(handle.await.is_err());
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_sqlite_lease_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparkie.db");
        let a = SqliteLeaseLock::new(Arc::new(SchedulerDb::open(&path).unwrap()), 42, 300);
        let b = SqliteLeaseLock::new(Arc::new(SchedulerDb::open(&path).unwrap()), 42, 300);

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        // releasing someone else's lease does nothing
        b.release().await.unwrap();
        assert!(!b.try_acquire().await.unwrap());

        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_renewed_through_long_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparkie.db");
        let a = SqliteLeaseLock::new(Arc::new(SchedulerDb::open(&path).unwrap()), 42, 1);
        let b = SqliteLeaseLock::new(Arc::new(SchedulerDb::open(&path).unwrap()), 42, 1);

        let during = with_lock(&a, || async {
            tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
            b.try_acquire().await
        })
        .await
        .unwrap();
        assert_eq!(during, Some(false));
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_fails_once_lease_is_lost() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let a = SqliteLeaseLock::new(db.clone(), 9, 300);
        assert!(a.try_acquire().await.unwrap());
        assert!(a.renew().await.unwrap());
        db.conn()
            .unwrap()
            .execute("DELETE FROM heartbeat_locks WHERE lock_key = 9", [])
            .unwrap();
        assert!(!a.renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_lease_keys_are_independent() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let a = SqliteLeaseLock::new(db.clone(), 1, 300);
        let b = SqliteLeaseLock::new(db, 2, 300);
        assert!(a.try_acquire().await.unwrap());
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        {
            let conn = db.conn().unwrap();
            conn.execute(
                "INSERT INTO heartbeat_locks (lock_key, holder, expires_at) VALUES (7, 'dead', ?1)",
                params![ts(Utc::now() - Duration::seconds(1))],
            )
            .unwrap();
        }
        let lock = SqliteLeaseLock::new(db, 7, 300);
        assert!(lock.try_acquire().await.unwrap());
    }
}
