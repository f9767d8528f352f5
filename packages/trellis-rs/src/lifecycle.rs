//! Applying resolved transitions: instance ids and lifecycle hooks.
//!
//! # Overview
//!
//! [`LifecycleRunner::settle`] takes the arrow paths of a dispatch and loops:
//!
//! 1. [`resolve`] the paths against the current active map
//! 2. Adopt the new active map; drop ids of nodes left for good and give
//!    every entered node a fresh instance id
//! 3. Run `onEntry` for every entered node, bottom-up
//! 4. Run `afterLeft` for every left node, deepest first
//! 5. Arrows returned by `onEntry` hooks start the next round
//!
//! Hooks run one at a time, each awaited before the next, and the context
//! threads through all of them.
//!
//! # What a Hook Sees
//!
//! | Hook | Context | Instance ids |
//! |------|---------|--------------|
//! | `onEntry` | current | after the transition |
//! | `afterLeft`, node re-entered | current | after the transition |
//! | `afterLeft`, node gone | before the transition | before the transition |
//!
//! A hook running on a node that is gone contributes its context changes as
//! a delta (see [`crate::merge`]). Arrows it returns are dropped: the node is
//! no longer there to leave.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::{new_instance_id, ArrowPath, MachineState, AFTER_LEFT, ON_ENTRY};
use crate::dispatch::Dispatcher;
use crate::error::TrellisError;
use crate::graph::{GraphModel, HandlerTable};
use crate::merge;
use crate::transition::{resolve, Resolution};

/// What one [`LifecycleRunner::settle`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Rounds that changed the active tree.
    pub cycles: usize,
    /// Every node entered, in the order entered.
    pub entered: Vec<String>,
    /// Every node left, in the order left.
    pub left: Vec<String>,
}

impl Settlement {
    pub fn changed(&self) -> bool {
        self.cycles > 0
    }
}

pub struct LifecycleRunner<'a> {
    model: &'a GraphModel,
    handlers: &'a HandlerTable,
    config: &'a EngineConfig,
}

impl<'a> LifecycleRunner<'a> {
    pub fn new(model: &'a GraphModel, handlers: &'a HandlerTable, config: &'a EngineConfig) -> Self {
        Self {
            model,
            handlers,
            config,
        }
    }

    /// Resolve `paths` and run hooks until no hook requests another transition.
    pub async fn settle(
        &self,
        state: &mut MachineState,
        mut paths: Vec<ArrowPath>,
    ) -> Result<Settlement, TrellisError> {
        let mut settlement = Settlement::default();

        while paths.iter().any(|p| !p.is_silent()) {
            let resolution = resolve(self.model, &state.active, &paths)?;
            if resolution.is_noop() {
                break;
            }

            settlement.cycles += 1;
            if let Some(limit) = self.config.max_cycles {
                if settlement.cycles > limit {
                    warn!(limit, "transition cycle limit exceeded");
                    return Err(TrellisError::CycleLimitExceeded { limit });
                }
            }

            info!(
                cycle = settlement.cycles,
                left = resolution.left.len(),
                entered = resolution.entered.len(),
                "applying transition"
            );
            settlement.left.extend(resolution.left.iter().cloned());
            settlement.entered.extend(resolution.entered.iter().cloned());
            paths = self.apply(state, resolution).await?;
        }

        Ok(settlement)
    }

    /// Apply one resolution and run its hooks. Returns the arrows `onEntry`
    /// hooks produced.
    async fn apply(
        &self,
        state: &mut MachineState,
        resolution: Resolution,
    ) -> Result<Vec<ArrowPath>, TrellisError> {
        let before = state.clone();
        let entered: HashSet<&str> = resolution.entered.iter().map(String::as_str).collect();

        state.active = resolution.active;
        for id in &resolution.left {
            if !entered.contains(id.as_str()) {
                state.instance_ids.remove(id);
            }
        }
        for id in &resolution.entered {
            state.instance_ids.insert(id.clone(), new_instance_id());
        }

        let mut next = Vec::new();
        for id in resolution.entered.iter().rev() {
            if !self.defines(id, ON_ENTRY) {
                continue;
            }
            let out = Dispatcher::new(self.model, &state.active, self.handlers, &state.instance_ids)
                .invoke_node(id, ON_ENTRY, &Value::Null, state.context.clone())
                .await?;
            state.context = out.ctx;
            for path in out.arrows {
                if let Some(arrow) = path.outermost_arrow() {
                    debug!(node = %id, arrow, "entry hook requested transition");
                    next.push(self.model.path_to_root(id, arrow));
                }
            }
        }

        for id in &resolution.left {
            if !self.defines(id, AFTER_LEFT) {
                continue;
            }
            let out = if entered.contains(id.as_str()) {
                let out = Dispatcher::new(self.model, &state.active, self.handlers, &state.instance_ids)
                    .invoke_node(id, AFTER_LEFT, &Value::Null, state.context.clone())
                    .await?;
                state.context = out.ctx.clone();
                out
            } else {
                let out = Dispatcher::new(self.model, &before.active, self.handlers, &before.instance_ids)
                    .invoke_node(id, AFTER_LEFT, &Value::Null, before.context.clone())
                    .await?;
                merge::apply(&mut state.context, &merge::diff(&before.context, &out.ctx));
                out
            };
            if out.has_arrows() {
                debug!(node = %id, "ignoring arrows returned by exit hook");
            }
        }

        Ok(next)
    }

    fn defines(&self, id: &str, method: &str) -> bool {
        self.handlers.get(id).is_some_and(|h| h.defines(method))
    }
}
