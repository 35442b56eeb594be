//! Distributed lock (spec §4.H). SQLite-backed SETNX-with-TTL, grounded
//! on the same pooled-connection style as [`crate::persistence::sqlite`].
//! Fails closed: any store error is treated as "lock not acquired".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use uuid::Uuid;

use crate::errors::CoreError;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempts to acquire `key` for `ttl`. Returns an owner token on
    /// success, usable to renew or release.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>, CoreError>;
    async fn renew(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool, CoreError>;
    async fn release(&self, key: &str, owner_token: &str) -> Result<(), CoreError>;
}

pub struct SqliteLock {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLock {
    /// Shares a pool with the persistence adapter rather than opening a
    /// second connection to the same file — the `distributed_locks`
    /// table is created by `persistence::sqlite`'s schema bootstrap.
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn sql_err(e: rusqlite::Error) -> CoreError {
    CoreError::LockUnavailable(e.to_string())
}

#[async_trait]
impl DistributedLock for SqliteLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>, CoreError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        let token = Uuid::new_v4().to_string();
        let expires_at = now_ms() + ttl.as_millis() as i64;
        let work = tokio::task::spawn_blocking(move || -> Result<Option<String>, CoreError> {
            let conn = pool.get().map_err(|e| CoreError::LockUnavailable(e.to_string()))?;
            let now = now_ms();
            conn.execute("DELETE FROM distributed_locks WHERE key = ?1 AND expires_at_ms < ?2", params![key, now])
                .map_err(sql_err)?;
            conn.execute(
                "INSERT INTO distributed_locks (key, owner_token, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![key, token, expires_at],
            )
            .map_err(sql_err)?;
            let owner: String = conn
                .query_row("SELECT owner_token FROM distributed_locks WHERE key = ?1", params![key], |row| row.get(0))
                .map_err(sql_err)?;
            if owner == token {
                Ok(Some(token))
            } else {
                Ok(None)
            }
        });
        work.await.map_err(|e| CoreError::LockUnavailable(e.to_string()))?
    }

    async fn renew(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool, CoreError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        let owner_token = owner_token.to_string();
        let expires_at = now_ms() + ttl.as_millis() as i64;
        let work = tokio::task::spawn_blocking(move || -> Result<bool, CoreError> {
            let conn = pool.get().map_err(|e| CoreError::LockUnavailable(e.to_string()))?;
            let updated = conn
                .execute(
                    "UPDATE distributed_locks SET expires_at_ms = ?1 WHERE key = ?2 AND owner_token = ?3",
                    params![expires_at, key, owner_token],
                )
                .map_err(sql_err)?;
            Ok(updated == 1)
        });
        work.await.map_err(|e| CoreError::LockUnavailable(e.to_string()))?
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        let owner_token = owner_token.to_string();
        let work = tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            let conn = pool.get().map_err(|e| CoreError::LockUnavailable(e.to_string()))?;
            conn.execute("DELETE FROM distributed_locks WHERE key = ?1 AND owner_token = ?2", params![key, owner_token])
                .map_err(sql_err)?;
            Ok(())
        });
        work.await.map_err(|e| CoreError::LockUnavailable(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_pool() -> (tempfile::TempDir, Pool<SqliteConnectionManager>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let manager = SqliteConnectionManager::file(&path);
        let pool = Pool::builder().max_size(4).build(manager).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE distributed_locks (key TEXT PRIMARY KEY, owner_token TEXT NOT NULL, expires_at_ms INTEGER NOT NULL);",
            )
            .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn property_mutual_exclusion_second_acquire_fails() {
        let (_dir, pool) = open_pool();
        let lock = SqliteLock::new(pool);
        let a = lock.acquire("cleanup:ACC1", Duration::from_secs(30)).await.unwrap();
        assert!(a.is_some());
        let b = lock.acquire("cleanup:ACC1", Duration::from_secs(30)).await.unwrap();
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let (_dir, pool) = open_pool();
        let lock = SqliteLock::new(pool);
        let a = lock.acquire("cleanup:ACC1", Duration::from_millis(10)).await.unwrap();
        assert!(a.is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let b = lock.acquire("cleanup:ACC1", Duration::from_secs(30)).await.unwrap();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn release_allows_immediate_reacquisition() {
        let (_dir, pool) = open_pool();
        let lock = SqliteLock::new(pool);
        let token = lock.acquire("cleanup:ACC1", Duration::from_secs(30)).await.unwrap().unwrap();
        lock.release("cleanup:ACC1", &token).await.unwrap();
        let b = lock.acquire("cleanup:ACC1", Duration::from_secs(30)).await.unwrap();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn release_with_wrong_token_is_a_noop() {
        let (_dir, pool) = open_pool();
        let lock = SqliteLock::new(pool);
        let token = lock.acquire("cleanup:ACC1", Duration::from_secs(30)).await.unwrap().unwrap();
        lock.release("cleanup:ACC1", "not-the-owner").await.unwrap();
        let still_held = lock.acquire("cleanup:ACC1", Duration::from_secs(30)).await.unwrap();
        assert!(still_held.is_none());
        let _ = token;
    }

    #[tokio::test]
    async fn renew_extends_ttl_only_for_the_owner() {
        let (_dir, pool) = open_pool();
        let lock = SqliteLock::new(pool);
        let token = lock.acquire("cleanup:ACC1", Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(lock.renew("cleanup:ACC1", &token, Duration::from_secs(30)).await.unwrap());
        assert!(!lock.renew("cleanup:ACC1", "bogus", Duration::from_secs(30)).await.unwrap());
    }
}
