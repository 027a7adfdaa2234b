//! Named locks serializing read-modify-write cycles on shared remote objects.
//!
//! The registry is process-local. Two processes mutating the same parent can
//! still race; a distributed implementation can be slotted in behind
//! [`LockRegistry`] without touching the reconcilers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Operation, Result};
use crate::id::ResourceId;
use crate::poll::{Clock, Deadline};

/// Name of the logical object whose shared state is being mutated.
///
/// Every participant touching the same object must derive the same key, so
/// keys are case-folded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(String);

impl LockKey {
    /// Key for a remote object, derived from its identifier.
    pub fn for_resource(id: &ResourceId) -> Self {
        Self(format!(
            "{}:{}",
            id.resource_type().to_lowercase(),
            id.lowercase()
        ))
    }

    /// Key for callers that lock by kind and name.
    pub fn named(kind: &str, name: &str) -> Self {
        Self(format!("{}:{}", kind.to_lowercase(), name.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Proof of holding a lock. Released when dropped, on every exit path.
pub struct LockGuard {
    key: LockKey,
    release: Option<Release>,
}

impl LockGuard {
    pub fn new(key: LockKey, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            key,
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!(lock = %self.key, "Lock released");
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Table of named mutual-exclusion locks.
#[async_trait]
pub trait LockRegistry: Send + Sync {
    /// Block until no other holder of `key` exists.
    async fn acquire(&self, key: &LockKey) -> LockGuard;

    /// Like [`acquire`](Self::acquire), giving up when `deadline` passes.
    async fn acquire_until(
        &self,
        key: &LockKey,
        deadline: &Deadline,
        clock: &dyn Clock,
    ) -> Result<LockGuard> {
        let remaining = deadline.remaining(clock);
        tokio::select! {
            biased;
            guard = self.acquire(key) => Ok(guard),
            _ = clock.sleep(remaining) => Err(Error::Timeout {
                operation: Operation::LockWait,
                id: key.to_string(),
                waited: deadline.waited(clock),
            }),
        }
    }

    /// Acquire several locks in a global order so that callers never deadlock.
    ///
    /// Locks already taken are released again when a later one times out.
    async fn acquire_many(
        &self,
        keys: &[LockKey],
        deadline: &Deadline,
        clock: &dyn Clock,
    ) -> Result<Vec<LockGuard>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.acquire_until(key, deadline, clock).await?);
        }
        Ok(guards)
    }
}

/// [`LockRegistry`] backed by a concurrent map of async mutexes.
#[derive(Clone, Default)]
pub struct InMemoryLockRegistry {
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl InMemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn slot(&self, key: &LockKey) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key.clone()).or_default().value())
    }

    /// Drop the entry for `key` when nobody holds or waits on it.
    fn prune(locks: &DashMap<LockKey, Arc<Mutex<()>>>, key: &LockKey) {
        locks.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }

    fn guard(&self, key: &LockKey, held: OwnedMutexGuard<()>) -> LockGuard {
        let locks = Arc::clone(&self.locks);
        let owned = key.clone();
        LockGuard::new(key.clone(), move || {
            drop(held);
            Self::prune(&locks, &owned);
        })
    }
}

#[async_trait]
impl LockRegistry for InMemoryLockRegistry {
    async fn acquire(&self, key: &LockKey) -> LockGuard {
        let slot = self.slot(key);
        let held = match Arc::clone(&slot).try_lock_owned() {
            Ok(held) => held,
            Err(_) => {
                debug!(lock = %key, "Waiting for lock");
                slot.lock_owned().await
            }
        };
        debug!(lock = %key, "Lock acquired");
        self.guard(key, held)
    }

    async fn acquire_until(
        &self,
        key: &LockKey,
        deadline: &Deadline,
        clock: &dyn Clock,
    ) -> Result<LockGuard> {
        let remaining = deadline.remaining(clock);
        let result = tokio::select! {
            biased;
            guard = self.acquire(key) => Ok(guard),
            _ = clock.sleep(remaining) => Err(Error::Timeout {
                operation: Operation::LockWait,
                id: key.to_string(),
                waited: deadline.waited(clock),
            }),
        };
        if result.is_err() {
            // The abandoned waiter may have been the last reference.
            Self::prune(&self.locks, key);
        }
        result
    }
}
