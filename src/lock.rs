//! Keyed lock registry: cross-cutting mutual exclusion by value equality.
//!
//! Two callers acquiring equal keys contend on the same primitive even
//! when the key instances are distinct; callers with distinct keys never
//! contend. An entry exists only while at least one caller holds or
//! waits on it: created lazily on first acquire, removed eagerly when
//! the last guard drops.
//!
//! Releasing a key that was never registered is a caller bug and panics.
//! A periodic reaper sweep backs up the eager removal in case a guard
//! leaks across a panic boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

struct Entry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters. The entry lives while this is non-zero.
    refcount: usize,
}

#[derive(Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Holds the keyed lock until dropped.
pub struct LockGuard {
    registry: Arc<LockRegistry>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Releases a waiter's reference if the acquire future is dropped
/// before the lock is obtained.
struct Waiter<'a> {
    registry: &'a LockRegistry,
    key: &'a str,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release(self.key);
        }
    }
}

impl LockRegistry {
    pub fn new() -> Arc<LockRegistry> {
        Arc::new(LockRegistry::default())
    }

    /// Acquire the lock for `key`, waiting if another holder has it.
    /// Cancelling the wait (dropping the future, e.g. under a timeout)
    /// releases the reference again.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> LockGuard {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                mutex: Arc::new(tokio::sync::Mutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            entry.mutex.clone()
        };

        // The reference taken above must not outlive a cancelled wait
        let mut waiter = Waiter {
            registry: self,
            key,
            armed: true,
        };

        trace!(key, "waiting for keyed lock");
        let guard = mutex.lock_owned().await;
        waiter.armed = false;
        trace!(key, "keyed lock acquired");
        LockGuard {
            registry: self.clone(),
            key: key.to_string(),
            _guard: guard,
        }
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(key) {
            Some(entry) => entry,
            None => panic!("lock '{}' released but never acquired", key),
        };
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entries.remove(key);
        }
    }

    /// Number of live entries. Zero when nobody holds or waits.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove stale zero-reference entries. Eager removal on release is
    /// the primary mechanism; this only ever finds entries after a guard
    /// leaked. Returns the number of entries removed.
    pub fn reap(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.refcount > 0);
        let reaped = before - entries.len();
        if reaped > 0 {
            warn!(reaped, "reaped stale lock entries");
        }
        reaped
    }

    /// Spawn a background task sweeping the registry on a timer. Abort
    /// the returned handle to stop it.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.reap();
            }
        })
    }
}
