use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use rusqlite::params;
use tracing::warn;
use uuid::Uuid;

use crate::{StoreDatabase, StoreResult};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Named-resource mutual exclusion with lease-based expiry. Acquisition is
/// an atomic set-if-absent with expiry; release is a compare-and-delete on
/// the owner token, so no other holder can release the lock. If a holder
/// crashes, the lease lapses and the next acquisition purges the row.
#[derive(Clone)]
pub struct LockManager {
    db: StoreDatabase,
}

impl LockManager {
    pub fn new(db: StoreDatabase) -> Self {
        Self { db }
    }

    fn key(name: &str) -> String {
        format!("lock:{name}")
    }

    /// Non-blocking acquisition. `None` means another owner holds a live
    /// lease.
    pub async fn acquire(&self, name: &str, lease: Duration) -> StoreResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let key = Self::key(name);
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + lease.as_millis() as i64;

        let conn = self.db.connection();
        let conn = conn.lock().await;
        let acquired = {
            // Purge an expired holder and claim in one transaction so two
            // concurrent acquirers cannot both observe the key absent.
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM locks WHERE name = ?1 AND expires_at_ms <= ?2",
                params![key, now_ms],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO locks (name, owner, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![key, token, expires_at_ms],
            )?;
            tx.commit()?;
            inserted == 1
        };

        if acquired {
            Ok(Some(LockGuard {
                manager: self.clone(),
                name: name.to_string(),
                token: Some(token),
            }))
        } else {
            Ok(None)
        }
    }

    /// Blocking acquisition within a total wait budget, polling with a
    /// small fixed delay.
    pub async fn acquire_blocking(
        &self,
        name: &str,
        lease: Duration,
        wait_budget: Duration,
    ) -> StoreResult<Option<LockGuard>> {
        let deadline = tokio::time::Instant::now() + wait_budget;
        loop {
            if let Some(guard) = self.acquire(name, lease).await? {
                return Ok(Some(guard));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// Scoped form: the lock is released on success, on error, and on
    /// panic. Returns `Ok(None)` when the lock could not be acquired
    /// within the wait budget.
    pub async fn with_lock<F, T>(
        &self,
        name: &str,
        lease: Duration,
        wait_budget: Duration,
        fut: F,
    ) -> StoreResult<Option<T>>
    where
        F: Future<Output = T>,
    {
        let Some(guard) = self.acquire_blocking(name, lease, wait_budget).await? else {
            return Ok(None);
        };
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        guard.release().await?;
        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Whether a live lease exists for `name`.
    pub async fn is_held(&self, name: &str) -> StoreResult<bool> {
        let key = Self::key(name);
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let held: i64 = conn.query_row(
            "SELECT COUNT(*) FROM locks WHERE name = ?1 AND expires_at_ms > ?2",
            params![key, now_ms],
            |row| row.get(0),
        )?;
        Ok(held > 0)
    }

    async fn release_token(&self, name: &str, token: &str) -> StoreResult<bool> {
        let key = Self::key(name);
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND owner = ?2",
            params![key, token],
        )?;
        Ok(deleted == 1)
    }
}

/// Ownership of one acquired lock. Release explicitly with
/// [`LockGuard::release`]; a guard dropped while still held schedules a
/// best-effort release and logs.
pub struct LockGuard {
    manager: LockManager,
    name: String,
    token: Option<String>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extend the lease. Holders running long must renew before the lease
    /// lapses; a false return means the lease already expired and another
    /// owner may hold the lock now.
    pub async fn renew(&self, lease: Duration) -> StoreResult<bool> {
        let Some(token) = self.token.as_deref() else {
            return Ok(false);
        };
        let key = LockManager::key(&self.name);
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + lease.as_millis() as i64;
        let conn = self.manager.db.connection();
        let conn = conn.lock().await;
        let renewed = conn.execute(
            "UPDATE locks SET expires_at_ms = ?1
             WHERE name = ?2 AND owner = ?3 AND expires_at_ms > ?4",
            params![expires_at_ms, key, token, now_ms],
        )?;
        Ok(renewed == 1)
    }

    /// Compare-and-delete release. Returns false if the lease had already
    /// expired and the lock moved on to another owner.
    pub async fn release(mut self) -> StoreResult<bool> {
        match self.token.take() {
            Some(token) => self.manager.release_token(&self.name, &token).await,
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            warn!(lock = %self.name, "lock guard dropped without release");
            let manager = self.manager.clone();
            let name = self.name.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = manager.release_token(&name, &token).await;
                });
            }
        }
    }
}
