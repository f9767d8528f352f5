//! State storage and per-instance locking.
//!
//! # Overview
//!
//! A machine instance is nothing but a [`MachineState`] in a [`StateStore`],
//! keyed by instance id. Every call loads it, runs, and saves it back.
//!
//! # The Contract
//!
//! 1. **Lock before load.** A synchronized call acquires the instance lock
//!    from the [`LockProvider`] before it reads anything.
//!
//! 2. **Save before unlock.** The new state is written while the lock is
//!    still held. A failed call writes nothing.
//!
//! 3. **Unlock on every path.** The guard is released whether the call
//!    succeeded or not.
//!
//! Both backends report failures as `anyhow::Error`; the machine wraps them
//! in the matching [`TrellisError`](crate::TrellisError) variant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;

use crate::core::MachineState;

// =============================================================================
// State Store
// =============================================================================

/// Persists machine state across calls.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Load an instance. `None` means it has never been saved.
    async fn load(&self, id: &str) -> anyhow::Result<Option<MachineState>>;

    /// Save an instance, replacing whatever was stored.
    async fn save(&self, id: &str, state: &MachineState) -> anyhow::Result<()>;

    /// Delete an instance. Deleting a missing instance is not an error.
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}

/// In-memory store backed by a HashMap.
///
/// Each store is its own object; two stores never share instances.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, MachineState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn load(&self, id: &str) -> anyhow::Result<Option<MachineState>> {
        let data = self
            .data
            .lock()
            .map_err(|e| anyhow::anyhow!("mutex poisoned: {}", e))?;
        Ok(data.get(id).cloned())
    }

    async fn save(&self, id: &str, state: &MachineState) -> anyhow::Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| anyhow::anyhow!("mutex poisoned: {}", e))?;
        data.insert(id.to_owned(), state.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| anyhow::anyhow!("mutex poisoned: {}", e))?;
        data.remove(id);
        Ok(())
    }
}

// =============================================================================
// Locks
// =============================================================================

/// Hands out exclusive per-instance locks.
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    /// Wait for the lock on `id`.
    async fn acquire(&self, id: &str) -> anyhow::Result<Box<dyn LockGuard>>;
}

/// A held instance lock.
#[async_trait]
pub trait LockGuard: Send {
    /// Give the lock back.
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

/// Process-local locks: one `tokio` mutex per instance id.
///
/// Waiters are served in FIFO order. An entry lives only while someone holds
/// or waits for its lock.
#[derive(Debug, Default)]
pub struct InMemoryLocks {
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if someone currently holds the lock on `id`.
    pub fn is_locked(&self, id: &str) -> bool {
        self.locks
            .get(id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of instance ids currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

struct InMemoryGuard {
    id: String,
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockProvider for InMemoryLocks {
    async fn acquire(&self, id: &str) -> anyhow::Result<Box<dyn LockGuard>> {
        // Clone the Arc out so the map shard is not held while waiting.
        let mutex = self.locks.entry(id.to_owned()).or_default().clone();
        let guard = mutex.lock_owned().await;
        Ok(Box::new(InMemoryGuard {
            id: id.to_owned(),
            locks: self.locks.clone(),
            guard,
        }))
    }
}

#[async_trait]
impl LockGuard for InMemoryGuard {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let InMemoryGuard { id, locks, guard } = *self;
        drop(guard);
        // Only the table's own reference left: nobody holds or waits.
        locks.remove_if(&id, |_, mutex| Arc::strong_count(mutex) == 1);
        Ok(())
    }
}
