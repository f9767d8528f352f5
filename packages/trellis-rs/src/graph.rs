//! The flat graph model and the builder that expands a plan into it.
//!
//! # Overview
//!
//! [`GraphBuilder::build`] walks a [`Plan`] from its `main` declaration and
//! produces:
//! - a [`GraphModel`]: one [`GraphNode`] per path-qualified id
//! - a [`HandlerTable`]: node id → handler, plus a method index
//!
//! The model is rebuilt for every call because dynamic composites size
//! themselves from the context.
//!
//! # Descent
//!
//! The model also knows how to *enter* a subtree ([`GraphModel::descend`]):
//! leaves stop, composites enter every child, graphs pick one child through
//! an entry point. The transition engine and initial-state reconciliation
//! both use it, so there is exactly one definition of "entering a node".

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{
    child_id, is_history_entry, new_instance_id, ActiveStateMap, ArrowPath, MachineState,
    DEFAULT_ENTRY, ROOT, SEPARATOR,
};
use crate::error::PlanError;
use crate::handler::Handler;
use crate::plan::{ChildDecl, Declaration, GraphDecl, Plan};

/// Node kind as seen at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Leaf,
    Graph,
    Composite,
}

/// Where an arrow or entry point leads: a child id and the entry point to use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub node: String,
    pub entry: String,
}

/// One node of the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub parent: Option<String>,
    pub children: Vec<String>,
    /// (child id, arrow name) → target. Graph nodes only.
    pub arrows: HashMap<(String, String), Target>,
    /// Entry point name → target. Graph nodes only; always has `default`.
    pub entry_points: HashMap<String, Target>,
}

impl GraphNode {
    fn new(id: String, kind: NodeKind, parent: Option<String>) -> Self {
        Self {
            id,
            kind,
            parent,
            children: Vec::new(),
            arrows: HashMap::new(),
            entry_points: HashMap::new(),
        }
    }

    /// Look up the arrow `arrow` leaving child `child`.
    pub fn arrow(&self, child: &str, arrow: &str) -> Option<&Target> {
        self.arrows.get(&(child.to_owned(), arrow.to_owned()))
    }

    pub fn is_graph(&self) -> bool {
        self.kind == NodeKind::Graph
    }

    fn has_child(&self, id: &str) -> bool {
        self.children.iter().any(|c| c == id)
    }
}

/// The result of entering a subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descent {
    /// Graph node → chosen child, top-down.
    pub assignments: Vec<(String, String)>,
    /// Every node entered, top-down.
    pub entered: Vec<String>,
}

// =============================================================================
// Graph Model
// =============================================================================

/// The flattened statechart for one call.
#[derive(Debug, Clone, Default)]
pub struct GraphModel {
    nodes: HashMap<String, GraphNode>,
}

impl GraphModel {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn parent(&self, id: &str) -> Option<&GraphNode> {
        self.node(id)
            .and_then(|n| n.parent.as_deref())
            .and_then(|p| self.node(p))
    }

    /// True if `ancestor` is a proper ancestor of `node`.
    pub fn is_ancestor(&self, ancestor: &str, node: &str) -> bool {
        let mut current = self.parent(node);
        while let Some(n) = current {
            if n.id == ancestor {
                return true;
            }
            current = self.parent(&n.id);
        }
        false
    }

    /// An arrow path from `node` up to the root, every level carrying `arrow`.
    pub fn path_to_root(&self, node: &str, arrow: &str) -> ArrowPath {
        let mut path = ArrowPath::new(node, Some(arrow.to_owned()));
        let mut current = self.parent(node);
        while let Some(n) = current {
            path.ascend(n.id.clone());
            current = self.parent(&n.id);
        }
        path
    }

    /// The child a Graph node has active, falling back to its default target.
    pub fn active_child<'a>(&'a self, graph: &'a GraphNode, active: &'a ActiveStateMap) -> Option<&'a str> {
        match active.get(&graph.id) {
            Some(child) if graph.has_child(child) => Some(child.as_str()),
            _ => graph.entry_points.get(DEFAULT_ENTRY).map(|t| t.node.as_str()),
        }
    }

    /// Every currently active node, top-down.
    pub fn active_nodes(&self, active: &ActiveStateMap) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_active(ROOT, active, &mut out);
        out
    }

    fn collect_active(&self, id: &str, active: &ActiveStateMap, out: &mut Vec<String>) {
        let Some(node) = self.node(id) else {
            return;
        };
        out.push(node.id.clone());
        match node.kind {
            NodeKind::Leaf => {}
            NodeKind::Composite => {
                for child in &node.children {
                    self.collect_active(child, active, out);
                }
            }
            NodeKind::Graph => {
                if let Some(child) = self.active_child(node, active) {
                    self.collect_active(child, active, out);
                }
            }
        }
    }

    /// The active subtree rooted at `id`, deepest nodes first, `id` last.
    pub fn active_subtree_bottom_up(&self, id: &str, active: &ActiveStateMap) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_active(id, active, &mut out);
        // Pre-order reversed puts every node after all of its descendants.
        out.reverse();
        out
    }

    /// Enter `id` through entry point `entry`.
    ///
    /// `prior` is consulted only for `history`/`recent` entry points.
    pub fn descend(&self, id: &str, entry: &str, prior: &ActiveStateMap) -> Descent {
        let mut out = Descent::default();
        self.descend_into(id, entry, prior, &mut out);
        out
    }

    fn descend_into(&self, id: &str, entry: &str, prior: &ActiveStateMap, out: &mut Descent) {
        let Some(node) = self.node(id) else {
            return;
        };
        out.entered.push(node.id.clone());
        match node.kind {
            NodeKind::Leaf => {}
            NodeKind::Composite => {
                for child in &node.children {
                    self.descend_into(child, entry, prior, out);
                }
            }
            NodeKind::Graph => {
                let Some(target) = self.entry_target(node, entry, prior) else {
                    return;
                };
                out.assignments.push((node.id.clone(), target.node.clone()));
                self.descend_into(&target.node, &target.entry, prior, out);
            }
        }
    }

    /// Resolve an entry point of a Graph node to a child.
    fn entry_target(&self, graph: &GraphNode, entry: &str, prior: &ActiveStateMap) -> Option<Target> {
        if is_history_entry(entry) {
            if let Some(child) = prior.get(&graph.id).filter(|c| graph.has_child(c)) {
                // Deep history: the resumed child resumes its own history too.
                return Some(Target {
                    node: child.clone(),
                    entry: entry.to_owned(),
                });
            }
            return graph.entry_points.get(DEFAULT_ENTRY).cloned();
        }

        if let Some(target) = graph.entry_points.get(entry) {
            return Some(target.clone());
        }

        debug!(node = %graph.id, entry, "entry point not declared, using default");
        graph.entry_points.get(DEFAULT_ENTRY).cloned()
    }

    /// Fill in the active tree for Graph nodes that have no valid entry yet.
    ///
    /// Runs on every loaded state: the first call of an instance starts from
    /// an empty map, and dynamic composites may have grown new children since
    /// the last call. Newly activated nodes get instance ids; no hooks run.
    /// Returns the nodes that were activated.
    pub fn reconcile(&self, state: &mut MachineState) -> Vec<String> {
        let mut activated = Vec::new();
        let mut stack = vec![ROOT.to_owned()];

        while let Some(id) = stack.pop() {
            let Some(node) = self.node(&id) else {
                continue;
            };
            match node.kind {
                NodeKind::Leaf => {}
                NodeKind::Composite => {
                    stack.extend(node.children.iter().rev().cloned());
                }
                NodeKind::Graph => match state.active.get(&id) {
                    Some(child) if node.has_child(child) => stack.push(child.clone()),
                    _ => {
                        let descent = self.descend(&id, DEFAULT_ENTRY, &state.active);
                        for (graph, child) in descent.assignments {
                            state.active.insert(graph, child);
                        }
                        // The graph itself was already active; only its subtree is new.
                        activated.extend(descent.entered.into_iter().skip(1));
                    }
                },
            }
        }

        for id in self.active_nodes(&state.active) {
            if !state.instance_ids.contains_key(&id) {
                state.instance_ids.insert(id, new_instance_id());
            }
        }

        if !activated.is_empty() {
            debug!(count = activated.len(), "reconciled active tree");
        }
        activated
    }

    /// Drop state entries that refer to nodes this model does not have.
    pub fn prune(&self, state: &mut MachineState) {
        state.active.retain(|graph, child| {
            self.node(graph)
                .map(|n| n.is_graph() && n.has_child(child))
                .unwrap_or(false)
        });
        state.instance_ids.retain(|node, _| self.contains(node));
    }

    /// Check every arrow and entry point target against the finished model.
    fn validate_targets(&self) -> Result<(), PlanError> {
        let mut graphs: Vec<&GraphNode> = self.nodes.values().filter(|n| n.is_graph()).collect();
        graphs.sort_by(|a, b| a.id.cmp(&b.id));

        for graph in graphs {
            let targets = graph.arrows.values().chain(graph.entry_points.values());
            for target in targets {
                let Some(node) = self.node(&target.node) else {
                    return Err(PlanError::UnknownChild {
                        node: graph.id.clone(),
                        child: target.node.clone(),
                    });
                };
                if node.is_graph()
                    && !is_history_entry(&target.entry)
                    && !node.entry_points.contains_key(&target.entry)
                {
                    return Err(PlanError::UnknownEntryPoint {
                        node: node.id.clone(),
                        entry: target.entry.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Handler Table
// =============================================================================

/// Node id → handler, with a per-method index.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<Handler>>,
    /// Method name → ids of nodes whose handler defines it.
    by_method: BTreeMap<String, BTreeSet<String>>,
}

impl HandlerTable {
    pub fn get(&self, node: &str) -> Option<&Arc<Handler>> {
        self.handlers.get(node)
    }

    /// True if any node defines `method`.
    pub fn defines(&self, method: &str) -> bool {
        self.by_method.contains_key(method)
    }

    /// Ids of the nodes defining `method`.
    pub fn nodes_defining(&self, method: &str) -> impl Iterator<Item = &str> {
        self.by_method
            .get(method)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    /// True if at least one node defines `method` and all of them declare it
    /// unsynchronized.
    pub fn is_unsynchronized(&self, method: &str) -> bool {
        let mut any = false;
        for id in self.nodes_defining(method) {
            let spec = self.handlers.get(id).and_then(|h| h.method(method));
            match spec {
                Some(spec) if spec.unsynchronized => any = true,
                _ => return false,
            }
        }
        any
    }

    /// Bind `handler` to `node` unless the node already has one.
    fn insert(&mut self, node: &str, handler: Arc<Handler>) {
        if self.handlers.contains_key(node) {
            return;
        }
        for method in handler.method_names() {
            self.by_method
                .entry(method.to_owned())
                .or_default()
                .insert(node.to_owned());
        }
        self.handlers.insert(node.to_owned(), handler);
    }
}

// =============================================================================
// Graph Builder
// =============================================================================

/// Expands a [`Plan`] into a [`GraphModel`] and a [`HandlerTable`].
pub struct GraphBuilder<'a> {
    ctx: &'a Value,
    model: GraphModel,
    handlers: HandlerTable,
    /// `plan/declaration` keys currently being expanded.
    expanding: Vec<String>,
}

/// Where a node is being expanded from.
struct Frame<'p> {
    plan: &'p Plan,
    decl: &'p str,
    id: String,
    binding_path: String,
    parent: Option<String>,
}

/// A child about to be expanded.
struct Slot<'p> {
    /// Local name, the last segment of the child's id.
    local: String,
    /// Declaration it expands.
    decl: &'p str,
    /// Last segment of its binding path.
    binding: &'p str,
}

impl<'p> Slot<'p> {
    fn from_child(child: &'p ChildDecl) -> Self {
        Self {
            local: child.name.clone(),
            decl: &child.decl,
            binding: &child.name,
        }
    }
}

impl<'a> GraphBuilder<'a> {
    /// Build the model for `plan` against the current context.
    pub fn build(plan: &Plan, ctx: &'a Value) -> Result<(GraphModel, HandlerTable), PlanError> {
        if plan.declaration(ROOT).is_none() {
            return Err(PlanError::MissingRoot {
                plan: plan.name().to_owned(),
            });
        }

        let mut builder = GraphBuilder {
            ctx,
            model: GraphModel::default(),
            handlers: HandlerTable::default(),
            expanding: Vec::new(),
        };
        builder.expand(Frame {
            plan,
            decl: ROOT,
            id: ROOT.to_owned(),
            binding_path: ROOT.to_owned(),
            parent: None,
        })?;
        builder.model.validate_targets()?;

        debug!(
            plan = plan.name(),
            nodes = builder.model.len(),
            "built graph model"
        );
        Ok((builder.model, builder.handlers))
    }

    fn expand(&mut self, frame: Frame<'_>) -> Result<(), PlanError> {
        let Some(decl) = frame.plan.declaration(frame.decl) else {
            return Err(PlanError::MissingDeclaration {
                node: frame.parent.clone().unwrap_or_else(|| frame.id.clone()),
                name: frame.decl.to_owned(),
            });
        };

        let key = format!("{}/{}", frame.plan.name(), frame.decl);
        if self.expanding.contains(&key) {
            return Err(PlanError::CyclicReference {
                node: frame.id.clone(),
                name: frame.decl.to_owned(),
            });
        }
        self.expanding.push(key);

        let binding = frame.plan.binding(&frame.binding_path);
        if let Some(handler) = binding.and_then(|b| b.handler.clone()) {
            self.handlers.insert(&frame.id, handler);
        }

        let result = match decl {
            Declaration::Leaf => {
                self.add_node(GraphNode::new(frame.id, NodeKind::Leaf, frame.parent));
                Ok(())
            }
            Declaration::Composite { nodes } => {
                let children = nodes.iter().map(Slot::from_child).collect();
                self.expand_container(&frame, NodeKind::Composite, children)
                    .map(|_| ())
            }
            Declaration::DynamicComposite { template } => self.expand_dynamic(&frame, template),
            Declaration::Graph(graph) => self.expand_graph(&frame, graph),
            Declaration::External(sub) => {
                if sub.declaration(ROOT).is_none() {
                    Err(PlanError::MissingRoot {
                        plan: sub.name().to_owned(),
                    })
                } else {
                    // The sub-plan's root takes this node's place; its own
                    // bindings are addressed relative to its own root.
                    self.expand(Frame {
                        plan: sub,
                        decl: ROOT,
                        id: frame.id.clone(),
                        binding_path: ROOT.to_owned(),
                        parent: frame.parent.clone(),
                    })
                }
            }
        };

        self.expanding.pop();
        result
    }

    /// Add a Graph or Composite node and expand its children.
    fn expand_container(
        &mut self,
        frame: &Frame<'_>,
        kind: NodeKind,
        children: Vec<Slot<'_>>,
    ) -> Result<Vec<String>, PlanError> {
        let mut node = GraphNode::new(frame.id.clone(), kind, frame.parent.clone());
        let mut seen = HashSet::new();

        for slot in &children {
            if !seen.insert(slot.local.clone()) {
                return Err(PlanError::DuplicateChild {
                    node: frame.id.clone(),
                    child: slot.local.clone(),
                });
            }
            node.children.push(child_id(&frame.id, &slot.local));
        }
        let ids = node.children.clone();
        self.add_node(node);

        for (slot, id) in children.into_iter().zip(ids.iter()) {
            self.expand(Frame {
                plan: frame.plan,
                decl: slot.decl,
                id: id.clone(),
                binding_path: child_id(&frame.binding_path, slot.binding),
                parent: Some(frame.id.clone()),
            })?;
        }
        Ok(ids)
    }

    fn expand_dynamic(&mut self, frame: &Frame<'_>, template: &str) -> Result<(), PlanError> {
        let count = frame
            .plan
            .binding(&frame.binding_path)
            .and_then(|b| b.node_count.clone())
            .ok_or_else(|| PlanError::MissingNodeCount {
                node: frame.id.clone(),
            })?;

        let keys = (*count)(self.ctx);
        let mut children = Vec::with_capacity(keys.len());
        for key in keys {
            if key.is_empty() || key.contains(SEPARATOR) {
                return Err(PlanError::InvalidDynamicKey {
                    node: frame.id.clone(),
                    key,
                });
            }
            // Every instance binds through the template's name.
            children.push(Slot {
                local: format!("{template}[{key}]"),
                decl: template,
                binding: template,
            });
        }

        self.expand_container(frame, NodeKind::Composite, children)
            .map_err(|e| match e {
                PlanError::DuplicateChild { node, child } => PlanError::InvalidDynamicKey {
                    node,
                    key: child,
                },
                other => other,
            })?;
        Ok(())
    }

    fn expand_graph(&mut self, frame: &Frame<'_>, graph: &GraphDecl) -> Result<(), PlanError> {
        if graph.nodes.is_empty() {
            return Err(PlanError::EmptyGraph {
                node: frame.id.clone(),
            });
        }

        let children = graph.nodes.iter().map(Slot::from_child).collect();
        self.expand_container(frame, NodeKind::Graph, children)?;

        let local_child = |name: &str| -> Result<String, PlanError> {
            if graph.nodes.iter().any(|n| n.name == name) {
                Ok(child_id(&frame.id, name))
            } else {
                Err(PlanError::UnknownChild {
                    node: frame.id.clone(),
                    child: name.to_owned(),
                })
            }
        };

        let mut arrows = HashMap::new();
        for arrow in &graph.arrows {
            let from = local_child(&arrow.from)?;
            let to = local_child(&arrow.to)?;
            arrows.insert(
                (from, arrow.arrow.clone()),
                Target {
                    node: to,
                    entry: arrow.entry.clone(),
                },
            );
        }

        let mut entry_points = HashMap::new();
        for entry in &graph.entry_points {
            if is_history_entry(&entry.name) {
                warn!(node = %frame.id, entry = %entry.name, "history entry point is reserved, ignoring declaration");
                continue;
            }
            entry_points.insert(
                entry.name.clone(),
                Target {
                    node: local_child(&entry.to)?,
                    entry: entry.entry.clone(),
                },
            );
        }
        entry_points
            .entry(DEFAULT_ENTRY.to_owned())
            .or_insert_with(|| Target {
                node: child_id(&frame.id, &graph.nodes[0].name),
                entry: DEFAULT_ENTRY.to_owned(),
            });

        if let Some(node) = self.model.nodes.get_mut(&frame.id) {
            node.arrows = arrows;
            node.entry_points = entry_points;
        }
        Ok(())
    }

    fn add_node(&mut self, node: GraphNode) {
        self.model.nodes.insert(node.id.clone(), node);
    }
}
