//! Core value types shared by every stage of a call.
//!
//! # Overview
//!
//! A machine instance is described by three pieces of data:
//! - [`ActiveStateMap`] = which child each Graph node currently has selected
//! - the context = one JSON document shared by all handlers
//! - [`InstanceIds`] = an opaque identity per active node, rotated on re-entry
//!
//! Together with bookkeeping they form the persisted [`MachineState`].
//!
//! # Node Ids
//!
//! Node ids are colon-separated paths from the root, e.g. `main:Door:Open`.
//! The root is always [`ROOT`]. Ids are plain strings so that they survive
//! serialization unchanged and can be logged as-is.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

/// Id of the root node of every model.
pub const ROOT: &str = "main";

/// Separator between path segments of a node id.
pub const SEPARATOR: char = ':';

/// Entry point every Graph node has.
pub const DEFAULT_ENTRY: &str = "default";

/// Entry point that resumes the last active child.
pub const HISTORY_ENTRY: &str = "history";

/// Alias of [`HISTORY_ENTRY`].
pub const RECENT_ENTRY: &str = "recent";

/// Hook method called on nodes that were just entered.
pub const ON_ENTRY: &str = "onEntry";

/// Hook method called on nodes that were just left.
pub const AFTER_LEFT: &str = "afterLeft";

/// Graph node id → id of its active child.
pub type ActiveStateMap = BTreeMap<String, String>;

/// Node id → opaque per-activation identity.
pub type InstanceIds = BTreeMap<String, String>;

/// Join a parent id and a local child name into a child id.
pub fn child_id(parent: &str, name: &str) -> String {
    let mut id = String::with_capacity(parent.len() + name.len() + 1);
    id.push_str(parent);
    id.push(SEPARATOR);
    id.push_str(name);
    id
}

/// The last path segment of a node id.
pub fn local_name(id: &str) -> &str {
    id.rsplit(SEPARATOR).next().unwrap_or(id)
}

/// True for the entry points that resume the previously active child.
pub fn is_history_entry(entry: &str) -> bool {
    entry == HISTORY_ENTRY || entry == RECENT_ENTRY
}

/// Generate a fresh instance id.
pub fn new_instance_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Arrow Paths
// =============================================================================

/// One level of an arrow path: `node` leaves its level with `arrow`.
///
/// The parent of `node` is the Graph that gets to interpret the arrow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrowStep {
    pub node: String,
    pub arrow: Option<String>,
}

/// A transition request, innermost level first.
///
/// A leaf that returns arrow `x` produces `[(leaf, x)]`. Every ancestor the
/// result passes through on its way back up appends itself, so by the time the
/// dispatch finishes the path names one arrow per level up to the root.
/// Ancestors that wrap the recursion may rename the arrow recorded for their
/// own level; the transition engine uses whatever name each level recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrowPath {
    steps: SmallVec<[ArrowStep; 4]>,
}

impl ArrowPath {
    /// Start a path at `node`.
    pub fn new(node: impl Into<String>, arrow: Option<String>) -> Self {
        let mut steps = SmallVec::new();
        steps.push(ArrowStep {
            node: node.into(),
            arrow,
        });
        Self { steps }
    }

    /// Extend the path by one ancestor level, carrying the outermost name up.
    pub fn ascend(&mut self, node: impl Into<String>) {
        let arrow = self.outermost_arrow().map(str::to_owned);
        self.steps.push(ArrowStep {
            node: node.into(),
            arrow,
        });
    }

    /// The arrow name recorded at the outermost level so far.
    pub fn outermost_arrow(&self) -> Option<&str> {
        self.steps.last().and_then(|s| s.arrow.as_deref())
    }

    /// The node the path started at.
    pub fn origin(&self) -> Option<&str> {
        self.steps.first().map(|s| s.node.as_str())
    }

    /// Replace the name recorded at the outermost level.
    ///
    /// `None` swallows the arrow at this level and every level above.
    pub fn rename_outermost(&mut self, arrow: Option<String>) {
        if let Some(last) = self.steps.last_mut() {
            last.arrow = arrow;
        }
    }

    /// Iterate over the levels, innermost first.
    pub fn steps(&self) -> impl Iterator<Item = &ArrowStep> {
        self.steps.iter()
    }

    /// Number of levels recorded.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if the path has no levels.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True if no level carries an arrow name.
    pub fn is_silent(&self) -> bool {
        self.steps.iter().all(|s| s.arrow.is_none())
    }
}

impl fmt::Display for ArrowPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            match &step.arrow {
                Some(arrow) => write!(f, "{}[{}]", step.node, arrow)?,
                None => write!(f, "{}[-]", step.node)?,
            }
        }
        Ok(())
    }
}

// =============================================================================
// Machine State
// =============================================================================

/// Everything persisted for one machine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    /// Graph node id → active child id.
    pub active: ActiveStateMap,
    /// The instance context.
    pub context: serde_json::Value,
    /// Node id → instance id for every active node.
    pub instance_ids: InstanceIds,
    /// Number of successful saves of this instance.
    pub revision: u64,
    /// When the state was last saved.
    pub updated_at: DateTime<Utc>,
}

impl MachineState {
    /// A blank state with the given context and nothing active yet.
    ///
    /// The engine reconciles a blank state against the graph model, which
    /// fills in the default active tree.
    pub fn new(context: serde_json::Value) -> Self {
        Self {
            active: ActiveStateMap::new(),
            context,
            instance_ids: InstanceIds::new(),
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    /// Active child of a Graph node, if recorded.
    pub fn active_child(&self, graph: &str) -> Option<&str> {
        self.active.get(graph).map(String::as_str)
    }

    /// Instance id of a node, if it is active.
    pub fn instance_id(&self, node: &str) -> Option<&str> {
        self.instance_ids.get(node).map(String::as_str)
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new(serde_json::Value::Object(Default::default()))
    }
}
