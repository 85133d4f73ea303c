//! Per-(guild, user) mutual exclusion with fair FIFO ordering and
//! non-reentrancy, refcounted so idle entries are purged.
//!
//! `tokio::sync::Mutex` queues waiters in arrival order, so admission order
//! equals acquisition order — this is what makes the lock manager's FIFO
//! guarantee a property of its building block rather than an incidental
//! one. The keyed map is a `DashMap` (same idiom `serenity`/
//! `unicity-astrid-astrid` use for sharded concurrent maps); the map is
//! only ever touched for the short duration of a lookup/insert/maybe-remove,
//! never held across the actual lock-hold period.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type LockKey = (i64, i64);

#[derive(Clone, Default)]
pub struct LockManager {
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

/// Held for the duration of Phases 4-7. Releasing happens on every path —
/// including task cancellation or panic — because `Drop` runs regardless.
pub struct LockHandle {
    key: LockKey,
    manager: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
    _guard: OwnedMutexGuard<()>,
    /// Whether this acquisition had to wait on another holder of the same
    /// `(guild_id, user_id)` key, rather than the total number of keys the
    /// manager happens to be tracking at the time.
    pub contended: bool,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, guild_id: i64, user_id: i64) -> LockHandle {
        let key = (guild_id, user_id);
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match mutex.clone().try_lock_owned() {
            Ok(guard) => LockHandle {
                key,
                manager: self.locks.clone(),
                _guard: guard,
                contended: false,
            },
            Err(_) => {
                let guard = mutex.lock_owned().await;
                LockHandle {
                    key,
                    manager: self.locks.clone(),
                    _guard: guard,
                    contended: true,
                }
            }
        }
    }

    /// Number of distinct (guild, user) keys currently tracked, exposed for
    /// tests verifying idle-entry cleanup.
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // If no other task holds a clone of this key's Arc<Mutex<_>> beyond
        // the map's own entry and this guard's, it's safe to purge the
        // entry so idle (guild, user) pairs don't accumulate forever.
        if let Some(entry) = self.manager.get(&self.key) {
            if Arc::strong_count(entry.value()) <= 1 {
                drop(entry);
                self.manager.remove_if(&self.key, |_, v| Arc::strong_count(v) <= 1);
            }
        }
    }
}
