//! Plans: the static description a graph model is built from.
//!
//! A [`Plan`] is a set of named [`Declaration`]s plus a map of bindings. The
//! declaration named `main` is the root. Graphs and composites list their
//! children as [`ChildDecl`]s: a local name plus the declaration it expands.
//! The two are usually the same; [`GraphDecl::node_as`] and tuple children
//! let one declaration appear several times under one parent. The builder
//! gives every use its own path-qualified id.
//!
//! Bindings attach behavior to nodes by *binding path*: the node id with any
//! dynamic-instance suffix removed. Every instance of a dynamic composite's
//! template therefore shares the template's handler.
//!
//! # Example
//!
//! ```ignore
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
//!     .bind("main:Closed", closed_handler)
//!     .bind("main:Open", open_handler);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::core::DEFAULT_ENTRY;
use crate::handler::Handler;

/// Computes the element keys of a dynamic composite from the context.
pub type NodeCountFn = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// A child slot of a graph or composite: local name → declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildDecl {
    pub name: String,
    pub decl: String,
}

impl ChildDecl {
    /// A child named after its declaration.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            decl: name.clone(),
            name,
        }
    }

    /// A child named `name` expanding declaration `decl`.
    pub fn alias(name: impl Into<String>, decl: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decl: decl.into(),
        }
    }
}

impl From<&str> for ChildDecl {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChildDecl {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl<N: Into<String>, D: Into<String>> From<(N, D)> for ChildDecl {
    fn from((name, decl): (N, D)) -> Self {
        Self::alias(name, decl)
    }
}

/// An arrow declared on a graph: `from --arrow--> to`, entering `to` via `entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrowDecl {
    pub from: String,
    pub arrow: String,
    pub to: String,
    pub entry: String,
}

/// A named way into a graph: enter child `to` via its entry point `entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDecl {
    pub name: String,
    pub to: String,
    pub entry: String,
}

/// An exclusive-choice container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphDecl {
    pub nodes: Vec<ChildDecl>,
    pub arrows: Vec<ArrowDecl>,
    pub entry_points: Vec<EntryDecl>,
}

impl GraphDecl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child by declaration name.
    pub fn node(mut self, name: impl Into<String>) -> Self {
        self.nodes.push(ChildDecl::new(name));
        self
    }

    /// Add a child named `name` that expands declaration `decl`.
    ///
    /// Arrows and entry points refer to the child by `name`.
    pub fn node_as(mut self, name: impl Into<String>, decl: impl Into<String>) -> Self {
        self.nodes.push(ChildDecl::alias(name, decl));
        self
    }

    /// Add an arrow entering `to` through its default entry point.
    pub fn arrow(
        self,
        from: impl Into<String>,
        arrow: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.arrow_via(from, arrow, to, DEFAULT_ENTRY)
    }

    /// Add an arrow entering `to` through a named entry point.
    pub fn arrow_via(
        mut self,
        from: impl Into<String>,
        arrow: impl Into<String>,
        to: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        self.arrows.push(ArrowDecl {
            from: from.into(),
            arrow: arrow.into(),
            to: to.into(),
            entry: entry.into(),
        });
        self
    }

    /// Add an entry point leading to `to` through its default entry point.
    pub fn entry(self, name: impl Into<String>, to: impl Into<String>) -> Self {
        self.entry_via(name, to, DEFAULT_ENTRY)
    }

    /// Add an entry point leading to `to` through a named nested entry point.
    pub fn entry_via(
        mut self,
        name: impl Into<String>,
        to: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        self.entry_points.push(EntryDecl {
            name: name.into(),
            to: to.into(),
            entry: entry.into(),
        });
        self
    }
}

/// One node declaration.
#[derive(Clone)]
pub enum Declaration {
    /// Terminal node.
    Leaf,
    /// Exactly one child active at a time.
    Graph(GraphDecl),
    /// All children active at once.
    Composite { nodes: Vec<ChildDecl> },
    /// A composite with one copy of `template` per key returned by the
    /// node-count function bound at this node.
    DynamicComposite { template: String },
    /// Splice another plan's `main` in place of this node.
    External(Arc<Plan>),
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declaration::Leaf => write!(f, "Leaf"),
            Declaration::Graph(g) => f.debug_tuple("Graph").field(g).finish(),
            Declaration::Composite { nodes } => {
                f.debug_struct("Composite").field("nodes", nodes).finish()
            }
            Declaration::DynamicComposite { template } => f
                .debug_struct("DynamicComposite")
                .field("template", template)
                .finish(),
            Declaration::External(plan) => f.debug_tuple("External").field(&plan.name).finish(),
        }
    }
}

/// Behavior attached to one binding path.
#[derive(Clone, Default)]
pub struct NodeBinding {
    pub handler: Option<Arc<Handler>>,
    pub node_count: Option<NodeCountFn>,
}

impl fmt::Debug for NodeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBinding")
            .field("handler", &self.handler)
            .field("node_count", &self.node_count.is_some())
            .finish()
    }
}

/// A complete, named statechart description.
#[derive(Debug, Clone)]
pub struct Plan {
    name: String,
    declarations: BTreeMap<String, Declaration>,
    bindings: HashMap<String, NodeBinding>,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declarations: BTreeMap::new(),
            bindings: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add (or replace) a declaration.
    pub fn declare(mut self, name: impl Into<String>, decl: Declaration) -> Self {
        self.declarations.insert(name.into(), decl);
        self
    }

    pub fn leaf(self, name: impl Into<String>) -> Self {
        self.declare(name, Declaration::Leaf)
    }

    pub fn graph(self, name: impl Into<String>, graph: GraphDecl) -> Self {
        self.declare(name, Declaration::Graph(graph))
    }

    /// Add a composite. Children are declaration names or
    /// `(local name, declaration)` pairs.
    pub fn composite<I, S>(self, name: impl Into<String>, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChildDecl>,
    {
        let nodes = nodes.into_iter().map(Into::into).collect();
        self.declare(name, Declaration::Composite { nodes })
    }

    pub fn dynamic_composite(self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.declare(
            name,
            Declaration::DynamicComposite {
                template: template.into(),
            },
        )
    }

    pub fn external(self, name: impl Into<String>, plan: Plan) -> Self {
        self.declare(name, Declaration::External(Arc::new(plan)))
    }

    /// Bind a handler to a node.
    pub fn bind(mut self, path: impl Into<String>, handler: Handler) -> Self {
        self.bindings.entry(path.into()).or_default().handler = Some(Arc::new(handler));
        self
    }

    /// Bind the node-count function of a dynamic composite.
    pub fn bind_node_count<F>(mut self, path: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        self.bindings.entry(path.into()).or_default().node_count = Some(Arc::new(f));
        self
    }

    pub fn declaration(&self, name: &str) -> Option<&Declaration> {
        self.declarations.get(name)
    }

    pub fn binding(&self, path: &str) -> Option<&NodeBinding> {
        self.bindings.get(path)
    }
}
