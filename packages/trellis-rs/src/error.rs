//! Structured error types for trellis.
//!
//! `TrellisError` is what a caller of [`Machine::call`](crate::Machine::call)
//! sees. Every variant is pattern-matchable so callers can decide whether a
//! retry makes sense; trellis itself never retries.
//!
//! # The Unlock Rule
//!
//! > **Whatever variant comes back, the instance lock has been released.**
//!
//! - Storage and lock failures wrap the backend's `anyhow::Error`
//! - Handler failures carry the handler's own error as `source`
//! - `InvalidTransition` and `CycleLimitExceeded` abort before anything is saved
//!
//! # Example
//!
//! ```ignore
//! use trellis::{Machine, TrellisError};
//!
//! match machine.call("door-1", "open", json!({})).await {
//!     Ok(result) => println!("opened: {result}"),
//!     Err(TrellisError::InvalidTransition { node, .. }) => {
//!         eprintln!("branches disagreed about {node}");
//!     }
//!     Err(TrellisError::UnableToLock { .. }) => {
//!         // safe to retry: nothing was read or written
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use thiserror::Error;

/// Errors surfaced by a machine call.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// The state store failed while loading an instance.
    #[error("unable to read state for instance {instance}: {source}")]
    UnableToReadState {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    /// The state store failed while saving or removing an instance.
    #[error("unable to write state for instance {instance}: {source}")]
    UnableToWriteState {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    /// The lock provider refused or failed to hand out the instance lock.
    #[error("unable to lock instance {instance}: {source}")]
    UnableToLock {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    /// The lock provider failed to release the instance lock.
    #[error("unable to unlock instance {instance}: {source}")]
    UnableToUnlock {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    /// Two parallel branches asked one Graph node for different active children.
    #[error("invalid transition: {node} cannot activate both {first} and {second}")]
    InvalidTransition {
        node: String,
        first: String,
        second: String,
    },

    /// A node handler returned an error.
    #[error("handler for {node} failed on {method}: {source}")]
    HandlerFailure {
        node: String,
        method: String,
        #[source]
        source: anyhow::Error,
    },

    /// The plan could not be expanded into a graph model.
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    /// Entry hooks kept requesting transitions past the configured limit.
    #[error("transition cycle limit of {limit} exceeded")]
    CycleLimitExceeded { limit: usize },
}

impl TrellisError {
    /// Returns true if the error came from the storage or lock backend.
    ///
    /// These are the failures where a caller-side retry can succeed without
    /// any change to the plan or the handlers.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            TrellisError::UnableToReadState { .. }
                | TrellisError::UnableToWriteState { .. }
                | TrellisError::UnableToLock { .. }
                | TrellisError::UnableToUnlock { .. }
        )
    }
}

/// Errors from expanding a plan into a graph model.
///
/// All of these are fatal: the plan itself is wrong, so the same call will
/// fail the same way until the plan is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The plan has no `main` declaration.
    #[error("plan {plan} has no main declaration")]
    MissingRoot { plan: String },

    /// A node references a declaration the plan does not contain.
    #[error("{node} references undeclared node {name}")]
    MissingDeclaration { node: String, name: String },

    /// A declaration (or external plan) contains itself.
    #[error("cyclic reference to {name} at {node}")]
    CyclicReference { node: String, name: String },

    /// A graph declares no children.
    #[error("graph {node} has no children")]
    EmptyGraph { node: String },

    /// The same child name appears twice under one parent.
    #[error("{node} declares child {child} more than once")]
    DuplicateChild { node: String, child: String },

    /// An arrow or entry point names something that is not a direct child.
    #[error("graph {node} references {child}, which is not one of its children")]
    UnknownChild { node: String, child: String },

    /// An arrow or entry point enters a graph through an entry point it lacks.
    #[error("{node} has no entry point {entry}")]
    UnknownEntryPoint { node: String, entry: String },

    /// A dynamic composite has no node-count function bound.
    #[error("dynamic composite {node} has no node-count binding")]
    MissingNodeCount { node: String },

    /// A node-count function returned an unusable key.
    #[error("dynamic composite {node} produced invalid key {key:?}")]
    InvalidDynamicKey { node: String, key: String },
}
