//! Testing utilities for trellis plans.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trellis = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording Hooks
//!
//! ```ignore
//! use trellis::testing::HookLog;
//!
//! let log = HookLog::new();
//! let plan = Plan::new("door")
//!     .graph("main", door_graph())
//!     .leaf("Closed")
//!     .leaf("Open")
//!     .bind("main:Closed", log.record(closed_handler()))
//!     .bind("main:Open", log.record(Handler::new()));
//!
//! machine.call("d", "open", json!({})).await?;
//! assert_eq!(log.hooks(), vec!["onEntry main:Open", "afterLeft main:Closed"]);
//! ```
//!
//! # Failing Backends
//!
//! [`FlakyStore`] and [`FlakyLocks`] wrap the in-memory backends and fail on
//! demand, for exercising error paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::{MachineState, AFTER_LEFT, ON_ENTRY};
use crate::handler::{Handler, LeafCall, Reply};
use crate::persistence::{InMemoryLocks, InMemoryStore, LockGuard, LockProvider, StateStore};

// =============================================================================
// Hook Log
// =============================================================================

/// One recorded lifecycle hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub hook: String,
    pub node: String,
    pub instance_id: Option<String>,
}

/// Shared, ordered record of lifecycle hook invocations.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct HookLog {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl HookLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add recording `onEntry` and `afterLeft` methods to `handler`.
    ///
    /// Existing hook methods on `handler` are replaced.
    pub fn record(&self, handler: Handler) -> Handler {
        let entry = self.clone();
        let exit = self.clone();
        handler
            .on(ON_ENTRY, move |call: LeafCall| {
                entry.push(ON_ENTRY, &call);
                async move { Ok(Reply::new()) }
            })
            .on(AFTER_LEFT, move |call: LeafCall| {
                exit.push(AFTER_LEFT, &call);
                async move { Ok(Reply::new()) }
            })
    }

    /// Every recorded event, in order.
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Every recorded event as `"<hook> <node>"`.
    pub fn hooks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|e| format!("{} {}", e.hook, e.node))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn push(&self, hook: &str, call: &LeafCall) {
        if let Ok(mut events) = self.events.lock() {
            events.push(HookEvent {
                hook: hook.to_owned(),
                node: call.node.id.clone(),
                instance_id: call.node.instance_id.clone(),
            });
        }
    }
}

/// A handler whose `method` requests `arrow` and does nothing else.
pub fn arrow_on(method: &str, arrow: &str) -> Handler {
    let arrow = arrow.to_owned();
    Handler::new().on(method, move |_call: LeafCall| {
        let arrow = arrow.clone();
        async move { Ok(Reply::new().with_arrow(arrow)) }
    })
}

// =============================================================================
// Failing Backends
// =============================================================================

/// In-memory store that fails loads or saves on demand.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn load(&self, id: &str) -> anyhow::Result<Option<MachineState>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            anyhow::bail!("load failed for {id}");
        }
        self.inner.load(id).await
    }

    async fn save(&self, id: &str, state: &MachineState) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("save failed for {id}");
        }
        self.inner.save(id, state).await
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("remove failed for {id}");
        }
        self.inner.remove(id).await
    }
}

/// In-memory locks that fail acquisition or release on demand.
///
/// A failed release still frees the lock, so later calls do not hang.
#[derive(Debug, Default)]
pub struct FlakyLocks {
    inner: InMemoryLocks,
    fail_acquires: AtomicBool,
    fail_releases: Arc<AtomicBool>,
}

impl FlakyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_acquires(&self, fail: bool) {
        self.fail_acquires.store(fail, Ordering::SeqCst);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.inner.is_locked(id)
    }
}

struct FlakyGuard {
    inner: Box<dyn LockGuard>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl LockProvider for FlakyLocks {
    async fn acquire(&self, id: &str) -> anyhow::Result<Box<dyn LockGuard>> {
        if self.fail_acquires.load(Ordering::SeqCst) {
            anyhow::bail!("lock service unavailable for {id}");
        }
        let inner = self.inner.acquire(id).await?;
        Ok(Box::new(FlakyGuard {
            inner,
            fail: self.fail_releases.clone(),
        }))
    }
}

#[async_trait]
impl LockGuard for FlakyGuard {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let FlakyGuard { inner, fail } = *self;
        inner.release().await?;
        if fail.load(Ordering::SeqCst) {
            anyhow::bail!("lock release failed");
        }
        Ok(())
    }
}
