//! Trellis Machine - one serialized call at a time per instance.
//!
//! The Machine ties the pieces together for every call:
//!
//! ```text
//! lock → load → build model → reconcile → dispatch → resolve ⇄ hooks → prune → save → unlock
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trellis::{Machine, Plan};
//!
//! let machine = Machine::builder(door_plan())
//!     .with_store(Arc::new(InMemoryStore::new()))
//!     .with_config(EngineConfig::from_env()?)
//!     .build();
//!
//! let result = machine.call("door-1", "open", json!({"force": true})).await?;
//! let state = machine.state("door-1").await?;
//! ```
//!
//! # Unsynchronized Methods
//!
//! If *every* node defining the called method registered it with
//! [`Handler::on_unsynchronized`](crate::Handler::on_unsynchronized), the lock
//! is released as soon as the state has been read. Such a call only sees a
//! consistent snapshot; it is saved only if it changed something, and then
//! the last writer wins.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::MachineState;
use crate::dispatch::Dispatcher;
use crate::error::TrellisError;
use crate::graph::{GraphBuilder, GraphModel, HandlerTable};
use crate::lifecycle::LifecycleRunner;
use crate::persistence::{InMemoryLocks, InMemoryStore, LockGuard, LockProvider, StateStore};
use crate::plan::Plan;

/// A plan bound to a store and a lock provider.
///
/// Cloning is cheap; clones share the store and the locks.
#[derive(Clone)]
pub struct Machine {
    plan: Arc<Plan>,
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockProvider>,
    config: EngineConfig,
}

impl Machine {
    /// Start building a machine for `plan`.
    pub fn builder(plan: Plan) -> MachineBuilder {
        MachineBuilder::new(plan)
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Call `method` on instance `instance`.
    ///
    /// Returns the dispatch result: a leaf's result, or an object keyed by
    /// child name for composites. Nothing is saved unless the whole call
    /// succeeds.
    pub async fn call(
        &self,
        instance: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, TrellisError> {
        debug!(instance, method, "call started");
        let mut held = Some(self.lock(instance).await?);
        let outcome = self.run_call(instance, method, &params, &mut held).await;
        self.unlock(instance, held, outcome).await
    }

    /// Read an instance as the next call would see it.
    ///
    /// Takes the lock like a call does. Never writes.
    pub async fn state(&self, instance: &str) -> Result<MachineState, TrellisError> {
        let guard = self.lock(instance).await?;
        let outcome = self
            .load(instance)
            .await
            .and_then(|state| self.prepare(state).map(|(state, _, _)| state));
        self.unlock(instance, Some(guard), outcome).await
    }

    /// Delete an instance's persisted state.
    pub async fn remove(&self, instance: &str) -> Result<(), TrellisError> {
        let guard = self.lock(instance).await?;
        let outcome = self
            .store
            .remove(instance)
            .await
            .map_err(|source| TrellisError::UnableToWriteState {
                instance: instance.to_owned(),
                source,
            });
        if outcome.is_ok() {
            info!(instance, "instance removed");
        }
        self.unlock(instance, Some(guard), outcome).await
    }

    async fn run_call(
        &self,
        instance: &str,
        method: &str,
        params: &Value,
        held: &mut Option<Box<dyn LockGuard>>,
    ) -> Result<Value, TrellisError> {
        let loaded = self.load(instance).await?;
        let (mut state, model, handlers) = self.prepare(loaded.clone())?;

        let unsynchronized = self.config.unsynchronized_enabled && handlers.is_unsynchronized(method);
        if unsynchronized {
            if let Some(guard) = held.take() {
                debug!(instance, method, "releasing lock for unsynchronized method");
                guard
                    .release()
                    .await
                    .map_err(|source| TrellisError::UnableToUnlock {
                        instance: instance.to_owned(),
                        source,
                    })?;
            }
        }

        let out = Dispatcher::new(&model, &state.active, &handlers, &state.instance_ids)
            .dispatch(method, params, state.context.clone())
            .await?;
        state.context = out.ctx;

        let settlement = LifecycleRunner::new(&model, &handlers, &self.config)
            .settle(&mut state, out.arrows)
            .await?;
        model.prune(&mut state);

        let changed = state.active != loaded.active
            || state.context != loaded.context
            || state.instance_ids != loaded.instance_ids;
        if !unsynchronized || changed {
            self.save(instance, &mut state).await?;
        }

        info!(
            instance,
            method,
            handled = out.handled,
            cycles = settlement.cycles,
            revision = state.revision,
            "call completed"
        );
        Ok(out.result)
    }

    /// Build the model from `state`'s context and fill in the active tree.
    fn prepare(
        &self,
        mut state: MachineState,
    ) -> Result<(MachineState, GraphModel, HandlerTable), TrellisError> {
        let (model, handlers) = GraphBuilder::build(&self.plan, &state.context)?;
        model.reconcile(&mut state);
        model.prune(&mut state);
        Ok((state, model, handlers))
    }

    async fn load(&self, instance: &str) -> Result<MachineState, TrellisError> {
        let loaded = self
            .store
            .load(instance)
            .await
            .map_err(|source| TrellisError::UnableToReadState {
                instance: instance.to_owned(),
                source,
            })?;
        Ok(loaded.unwrap_or_else(|| {
            debug!(instance, "new instance");
            MachineState::new(json!({}))
        }))
    }

    async fn save(&self, instance: &str, state: &mut MachineState) -> Result<(), TrellisError> {
        state.revision += 1;
        state.updated_at = Utc::now();
        self.store
            .save(instance, state)
            .await
            .map_err(|source| TrellisError::UnableToWriteState {
                instance: instance.to_owned(),
                source,
            })
    }

    async fn lock(&self, instance: &str) -> Result<Box<dyn LockGuard>, TrellisError> {
        self.locks
            .acquire(instance)
            .await
            .map_err(|source| TrellisError::UnableToLock {
                instance: instance.to_owned(),
                source,
            })
    }

    /// Release `guard` if still held, then hand back `outcome`.
    ///
    /// A release failure after a failed call is logged and the call's own
    /// error returned.
    async fn unlock<T>(
        &self,
        instance: &str,
        guard: Option<Box<dyn LockGuard>>,
        outcome: Result<T, TrellisError>,
    ) -> Result<T, TrellisError> {
        let Some(guard) = guard else {
            return outcome;
        };
        match (guard.release().await, outcome) {
            (Ok(()), outcome) => outcome,
            (Err(source), Ok(_)) => Err(TrellisError::UnableToUnlock {
                instance: instance.to_owned(),
                source,
            }),
            (Err(release_err), Err(e)) => {
                warn!(instance, error = %release_err, "failed to release lock after failed call");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("plan", &self.plan.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Machine Builder
// =============================================================================

/// Builder for a [`Machine`].
///
/// Store and locks default to fresh in-memory implementations.
///
/// # Example
///
/// ```ignore
/// let machine = Machine::builder(plan)
///     .with_store(shared_store)
///     .with_locks(shared_locks)
///     .with_config(EngineConfig::new().with_max_cycles(16))
///     .build();
/// ```
pub struct MachineBuilder {
    plan: Plan,
    store: Option<Arc<dyn StateStore>>,
    locks: Option<Arc<dyn LockProvider>>,
    config: EngineConfig,
}

impl MachineBuilder {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            store: None,
            locks: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Machine {
        Machine {
            plan: Arc::new(self.plan),
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            locks: self.locks.unwrap_or_else(|| Arc::new(InMemoryLocks::new())),
            config: self.config,
        }
    }
}
