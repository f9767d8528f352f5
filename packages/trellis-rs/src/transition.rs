//! Turning arrow paths into a new active tree.
//!
//! # Overview
//!
//! Every [`ArrowPath`] the dispatcher collected is walked *up*: the first
//! level whose parent is a Graph declaring an arrow for `(node, name)` owns
//! the transition. The owner's current child subtree is left (deepest first)
//! and the arrow's target is entered through its entry point (top-down).
//!
//! Several paths are resolved together:
//!
//! - A request owned *inside* a subtree that another request leaves is
//!   superseded. The outer transition wins.
//! - Two requests that assign one Graph different children are an
//!   [`TrellisError::InvalidTransition`].
//! - Identical requests collapse into one.
//!
//! A self-loop that would reproduce the current assignments exactly leaves
//! and enters nothing, but its assignments still count as a choice: a sibling
//! moving the same graph elsewhere is a conflict. Any other self-loop leaves
//! and re-enters the target.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::core::{ActiveStateMap, ArrowPath};
use crate::error::TrellisError;
use crate::graph::{GraphModel, Target};

/// The outcome of resolving one batch of arrow paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// The active map after every transition is applied.
    pub active: ActiveStateMap,
    /// Nodes left, deepest first.
    pub left: Vec<String>,
    /// Nodes entered, top-down.
    pub entered: Vec<String>,
}

impl Resolution {
    /// True if nothing was left or entered.
    pub fn is_noop(&self) -> bool {
        self.left.is_empty() && self.entered.is_empty()
    }
}

/// One owned transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    owner: String,
    from: String,
    arrow: String,
    target: Target,
}

/// Resolve `paths` against the current `active` map.
pub fn resolve(
    model: &GraphModel,
    active: &ActiveStateMap,
    paths: &[ArrowPath],
) -> Result<Resolution, TrellisError> {
    let mut requests: Vec<Request> = Vec::new();
    for path in paths {
        match owner_of(model, path) {
            Some(request) if !requests.contains(&request) => requests.push(request),
            Some(_) => {}
            None => debug!(path = %path, "no graph owns arrow path"),
        }
    }

    let outer: Vec<&Request> = requests
        .iter()
        .filter(|r| {
            let superseded = requests
                .iter()
                .any(|other| model.is_ancestor(&other.owner, &r.owner));
            if superseded {
                debug!(owner = %r.owner, arrow = %r.arrow, "transition superseded by an outer one");
            }
            !superseded
        })
        .collect();

    let mut resolution = Resolution {
        active: active.clone(),
        ..Resolution::default()
    };
    let mut assigned: BTreeMap<String, String> = BTreeMap::new();
    let mut left_seen = HashSet::new();
    let mut entered_seen = HashSet::new();

    for request in outer {
        let descent = model.descend(&request.target.node, &request.target.entry, active);

        let mut assignments = Vec::with_capacity(descent.assignments.len() + 1);
        assignments.push((request.owner.clone(), request.target.node.clone()));
        assignments.extend(descent.assignments);

        for (graph, child) in &assignments {
            match assigned.get(graph) {
                Some(existing) if existing != child => {
                    return Err(TrellisError::InvalidTransition {
                        node: graph.clone(),
                        first: existing.clone(),
                        second: child.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    assigned.insert(graph.clone(), child.clone());
                }
            }
        }

        // Still counted for conflicts above, but nothing to leave or enter.
        if request.from == request.target.node && reproduces(model, active, &assignments) {
            debug!(node = %request.from, arrow = %request.arrow, "self-loop changes nothing");
            continue;
        }

        for id in model.active_subtree_bottom_up(&request.from, active) {
            if left_seen.insert(id.clone()) {
                resolution.left.push(id);
            }
        }
        for id in descent.entered {
            if entered_seen.insert(id.clone()) {
                resolution.entered.push(id);
            }
        }

        debug!(
            owner = %request.owner,
            from = %request.from,
            arrow = %request.arrow,
            to = %request.target.node,
            entry = %request.target.entry,
            "resolved transition"
        );
    }

    // History lives in the stale entries of left graphs, so nothing is removed.
    resolution.active.extend(assigned);
    Ok(resolution)
}

/// Walk a path innermost first until a Graph parent declares the arrow.
fn owner_of(model: &GraphModel, path: &ArrowPath) -> Option<Request> {
    path.steps().find_map(|step| {
        let arrow = step.arrow.as_deref()?;
        let parent = model.parent(&step.node).filter(|p| p.is_graph())?;
        let target = parent.arrow(&step.node, arrow)?;
        Some(Request {
            owner: parent.id.clone(),
            from: step.node.clone(),
            arrow: arrow.to_owned(),
            target: target.clone(),
        })
    })
}

/// True if every assignment already holds in `active`.
fn reproduces(model: &GraphModel, active: &ActiveStateMap, assignments: &[(String, String)]) -> bool {
    assignments.iter().all(|(graph, child)| {
        model
            .node(graph)
            .and_then(|g| model.active_child(g, active))
            .is_some_and(|current| current == child)
    })
}
