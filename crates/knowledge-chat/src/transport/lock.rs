//! Per-key request leases.
//!
//! A lease is taken with a bounded lifetime so a crashed holder cannot wedge a
//! conversation forever, and is released explicitly when the guard drops.
//! Every acquisition carries its own holder token; a release only removes the
//! lease if that holder still owns it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

pub trait DedupLock: Send + Sync {
    /// Take the lease for `key` on behalf of `holder` unless a live lease
    /// exists. Never blocks.
    fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Drop the lease for `key` if `holder` still owns it.
    fn release(&self, key: &str, holder: &str) -> anyhow::Result<()>;
}

/// Lease key guarding the AI request lifecycle of one conversation.
pub fn request_lock_key(conversation_id: &str) -> String {
    format!("ai-request:{}", conversation_id)
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// In-process leases. Enough for a single server instance; use the SQLite lock
/// when several processes share one database.
#[derive(Default)]
pub struct LocalDedupLock {
    leases: DashMap<String, Lease>,
}

impl LocalDedupLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupLock for LocalDedupLock {
    fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        let lease = Lease { holder: holder.to_string(), expires_at: now + ttl };
        let acquired = match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut current) => {
                if current.get().expires_at > now {
                    false
                } else {
                    debug!("Taking over expired lease {}", key);
                    current.insert(lease);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
                true
            }
        };
        Ok(acquired)
    }

    fn release(&self, key: &str, holder: &str) -> anyhow::Result<()> {
        self.leases.remove_if(key, |_, lease| lease.holder == holder);
        Ok(())
    }
}

/// Releases its lease when dropped.
pub struct LockGuard {
    lock: Arc<dyn DedupLock>,
    key: String,
    holder: String,
}

impl LockGuard {
    /// `Ok(None)` when another holder owns the lease.
    pub fn acquire(lock: Arc<dyn DedupLock>, key: String, ttl: Duration) -> anyhow::Result<Option<Self>> {
        let holder = Uuid::new_v4().to_string();
        if lock.try_acquire(&key, &holder, ttl)? {
            Ok(Some(Self { lock, key, holder }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(&self.key, &self.holder) {
            // the lease still expires on its own
            warn!("Failed to release lease {}: {}", self.key, e);
        }
    }
}
