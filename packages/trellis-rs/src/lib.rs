//! # Trellis
//!
//! A hierarchical statechart runtime where graphs choose, composites run in
//! parallel, and one call owns an instance at a time.
//!
//! ## Core Concepts
//!
//! A [`Plan`] declares a tree of nodes:
//! - **Leaf** = terminal node; its [`Handler`] does the work
//! - **Graph** = exactly one child active, switched by named arrows
//! - **Composite** = every child active, dispatched concurrently
//! - **Dynamic composite** = a composite sized from the context on every call
//! - **External** = another plan spliced in place
//!
//! A [`Machine`] binds a plan to a [`StateStore`] and a [`LockProvider`].
//! Every instance is a [`MachineState`]: the active child of each graph, a
//! JSON context, and an instance id per active node.
//!
//! ## Architecture
//!
//! ```text
//! Machine::call(instance, method, params)
//!     │
//!     ▼ lock, load, build, reconcile
//! Dispatcher ── walks the active tree ──► handlers
//!     │                                      │
//!     │ ◄── results, contexts, arrow paths ──┘
//!     ▼
//! resolve ── arrow paths → left / entered ──┐
//!     ▲                                      │
//!     └── arrows from onEntry ◄── hooks ◄────┘
//!     │
//!     ▼ prune, save, unlock
//! result
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One synchronized call per instance** - the lock spans load to save
//! 2. **All or nothing** - a failed call persists nothing
//! 3. **Every graph has one active child** - two branches that disagree abort the call
//! 4. **Ids follow presence** - a node's instance id changes only when it is left and re-entered
//!
//! ## Example
//!
//! ```ignore
//! use trellis::{GraphDecl, Handler, LeafCall, Machine, Plan, Reply};
//! use serde_json::json;
//!
//! let plan = Plan::new("door")
//!     .graph(
//!         "main",
//!         GraphDecl::new()
//!             .node("Closed")
//!             .node("Open")
//!             .arrow("Closed", "open", "Open")
//!             .arrow("Open", "close", "Closed"),
//!     )
//!     .leaf("Closed")
//!     .leaf("Open")
//!     .bind(
//!         "main:Closed",
//!         Handler::new().on("open", |_call: LeafCall| async move {
//!             Ok(Reply::new().with_arrow("open"))
//!         }),
//!     )
//!     .bind(
//!         "main:Open",
//!         Handler::new().on("close", |_call: LeafCall| async move {
//!             Ok(Reply::new().with_arrow("close"))
//!         }),
//!     );
//!
//! let machine = Machine::builder(plan).build();
//! machine.call("front-door", "open", json!({})).await?;
//! assert_eq!(
//!     machine.state("front-door").await?.active_child("main"),
//!     Some("main:Open"),
//! );
//! ```

// Core modules
mod config;
mod core;
mod dispatch;
mod engine;
mod error;
mod graph;
mod handler;
mod lifecycle;
mod merge;
mod persistence;
mod plan;
mod transition;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export core types
pub use crate::core::{
    ActiveStateMap, ArrowPath, ArrowStep, InstanceIds, MachineState, AFTER_LEFT, DEFAULT_ENTRY,
    HISTORY_ENTRY, ON_ENTRY, RECENT_ENTRY, ROOT, SEPARATOR,
};

// Re-export plan and graph types
pub use graph::{Descent, GraphBuilder, GraphModel, GraphNode, HandlerTable, NodeKind, Target};
pub use plan::{
    ArrowDecl, ChildDecl, Declaration, EntryDecl, GraphDecl, NodeBinding, NodeCountFn, Plan,
};

// Re-export handler types
pub use handler::{
    Capability, Dispatched, Handler, LeafCall, LeafMethod, MethodSpec, Next, NodeIdentity, Reply,
    WrapCall, WrapMethod,
};

// Re-export the pipeline stages
pub use dispatch::Dispatcher;
pub use lifecycle::{LifecycleRunner, Settlement};
pub use transition::{resolve, Resolution};

// Re-export machine, storage and config
pub use config::EngineConfig;
pub use engine::{Machine, MachineBuilder};
pub use persistence::{InMemoryLocks, InMemoryStore, LockGuard, LockProvider, StateStore};

// Re-export error types
pub use error::{PlanError, TrellisError};

// Re-export async_trait for implementing WrapMethod, StateStore and LockProvider
pub use async_trait::async_trait;

/// Context merging for parallel branches.
pub mod context {
    pub use crate::merge::{apply, diff, merge, Branch, Patch, PathSegment};
}
