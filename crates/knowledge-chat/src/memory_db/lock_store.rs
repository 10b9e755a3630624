//! Database-backed request leases, shared by every process using the same file.
//! The `holder` column carries the token of the acquisition that owns the lease.
use crate::transport::lock::DedupLock;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct SqliteDedupLock {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteDedupLock {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }
}

impl DedupLock for SqliteDedupLock {
    fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        // The upsert only overwrites a row whose lease has already run out.
        let changed = conn.execute(
            "INSERT INTO request_locks (key, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE request_locks.expires_at <= ?4",
            params![key, holder, expires_at, now],
        )?;

        debug!("Lease {} {}", key, if changed > 0 { "acquired" } else { "busy" });
        Ok(changed > 0)
    }

    fn release(&self, key: &str, holder: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM request_locks WHERE key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::ChatDatabase;
    use crate::transport::{request_lock_key, LockGuard};

    #[test]
    fn test_sqlite_lease_excludes_other_holders() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDatabase::open(&dir.path().join("chat.db")).unwrap();
        let lock = SqliteDedupLock::new(db.pool());
        let ttl = Duration::from_secs(30);

        assert!(lock.try_acquire("ai-request:c1", "a", ttl).unwrap());
        assert!(!lock.try_acquire("ai-request:c1", "b", ttl).unwrap());

        // releasing someone else's lease is a no-op
        lock.release("ai-request:c1", "b").unwrap();
        assert!(!lock.try_acquire("ai-request:c1", "b", ttl).unwrap());

        lock.release("ai-request:c1", "a").unwrap();
        assert!(lock.try_acquire("ai-request:c1", "b", ttl).unwrap());
    }

    #[test]
    fn test_sqlite_lease_expires() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDatabase::open(&dir.path().join("chat.db")).unwrap();
        let lock = SqliteDedupLock::new(db.pool());

        assert!(lock.try_acquire("k", "a", Duration::from_millis(0)).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(lock.try_acquire("k", "b", Duration::from_secs(30)).unwrap());
    }

    #[test]
    fn test_overrun_guard_does_not_free_successor() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDatabase::open(&dir.path().join("chat.db")).unwrap();
        let lock: Arc<dyn DedupLock> = Arc::new(db.dedup_lock());
        let key = request_lock_key("c1");

        let first = LockGuard::acquire(lock.clone(), key.clone(), Duration::from_millis(10)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = LockGuard::acquire(lock.clone(), key.clone(), Duration::from_secs(60)).unwrap();
        assert!(second.is_some());

        drop(first);
        assert!(LockGuard::acquire(lock.clone(), key.clone(), Duration::from_secs(60)).unwrap().is_none());

        drop(second);
        assert!(LockGuard::acquire(lock, key, Duration::from_secs(60)).unwrap().is_some());
    }
}
