//! Node handlers and the method lookup table.
//!
//! A [`Handler`] is bound to one node (by binding path) and maps method names
//! to a [`MethodSpec`]. Each spec carries a [`Capability`]:
//!
//! - [`Capability::Leaf`] = a plain async function of a [`LeafCall`] returning
//!   a [`Reply`] (result, replacement context, one arrow)
//! - [`Capability::Wrap`] = a [`WrapMethod`] that receives a [`Next`]
//!   continuation and decides how (and whether) to run the default recursion
//!
//! The table is consulted by method name at dispatch time; nothing is looked
//! up reflectively.
//!
//! # Example
//!
//! ```ignore
//! use trellis::{Handler, Reply};
//!
//! let closed = Handler::new()
//!     .on("open", |call| async move {
//!         let force = call.params["force"].as_bool().unwrap_or(false);
//!         Ok(Reply::new().with_arrow(if force { "kicked" } else { "opened" }))
//!     })
//!     .on_unsynchronized("describe", |_call| async move {
//!         Ok(Reply::new().with_result("closed"))
//!     });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::core::ArrowPath;
use crate::error::TrellisError;

/// Who is being called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Path-qualified node id.
    pub id: String,
    /// The node's current instance id, if it has one.
    pub instance_id: Option<String>,
}

/// Input to a leaf-style method.
#[derive(Debug, Clone)]
pub struct LeafCall {
    pub method: String,
    pub ctx: Value,
    pub params: Value,
    pub node: NodeIdentity,
}

/// What a leaf-style method hands back.
///
/// Every field is optional: an empty reply means "nothing to report, context
/// untouched, stay where you are".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub result: Option<Value>,
    pub ctx: Option<Value>,
    pub arrow: Option<String>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call result.
    pub fn with_result(mut self, result: impl Into<Value>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Replace the context.
    pub fn with_ctx(mut self, ctx: Value) -> Self {
        self.ctx = Some(ctx);
        self
    }

    /// Request a transition.
    pub fn with_arrow(mut self, arrow: impl Into<String>) -> Self {
        self.arrow = Some(arrow.into());
        self
    }
}

/// Outcome of dispatching a method into a subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Transition requests produced inside the subtree.
    pub arrows: Vec<ArrowPath>,
    /// Context after the subtree ran.
    pub ctx: Value,
    /// Leaf result, or an object keyed by child name for composites.
    pub result: Value,
    /// True if at least one handler in the subtree ran.
    pub handled: bool,
}

impl Dispatched {
    /// A subtree in which nothing ran.
    pub fn idle(ctx: Value) -> Self {
        Self {
            arrows: Vec::new(),
            ctx,
            result: Value::Null,
            handled: false,
        }
    }

    /// Rename `from` to `to` at the outermost level of every path.
    ///
    /// Called by a wrapper after `next.run(..)`, this renames the arrow its
    /// own node leaves with; lower levels keep the name they recorded.
    pub fn rename_arrow(&mut self, from: &str, to: impl Into<String>) {
        let to = to.into();
        for path in &mut self.arrows {
            if path.outermost_arrow() == Some(from) {
                path.rename_outermost(Some(to.clone()));
            }
        }
    }

    /// Drop every path whose outermost arrow is `arrow`.
    pub fn swallow_arrow(&mut self, arrow: &str) {
        self.arrows.retain(|p| p.outermost_arrow() != Some(arrow));
    }

    /// Request a transition starting at `node`.
    pub fn emit(&mut self, node: impl Into<String>, arrow: impl Into<String>) {
        self.arrows.push(ArrowPath::new(node, Some(arrow.into())));
    }

    /// True if the subtree requested any transition.
    pub fn has_arrows(&self) -> bool {
        self.arrows.iter().any(|p| !p.is_silent())
    }
}

// =============================================================================
// Method Traits
// =============================================================================

/// A plain method: one call in, one [`Reply`] out.
///
/// Implemented for every `Fn(LeafCall) -> impl Future<Output = Result<Reply>>`.
#[async_trait]
pub trait LeafMethod: Send + Sync {
    async fn invoke(&self, call: LeafCall) -> anyhow::Result<Reply>;
}

#[async_trait]
impl<F, Fut> LeafMethod for F
where
    F: Fn(LeafCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Reply>> + Send,
{
    async fn invoke(&self, call: LeafCall) -> anyhow::Result<Reply> {
        (self)(call).await
    }
}

/// Continuation handed to a wrapper: the default recursion at this node.
pub struct Next<'a> {
    run: Box<dyn FnOnce(Value) -> BoxFuture<'a, Result<Dispatched, TrellisError>> + Send + 'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new<F>(run: F) -> Self
    where
        F: FnOnce(Value) -> BoxFuture<'a, Result<Dispatched, TrellisError>> + Send + 'a,
    {
        Self { run: Box::new(run) }
    }

    /// A continuation with nothing below it.
    pub(crate) fn idle() -> Self {
        Self::new(|ctx| Box::pin(async move { Ok(Dispatched::idle(ctx)) }))
    }

    /// Run the default recursion with `ctx`.
    ///
    /// Errors from deeper handlers come back as [`TrellisError`] inside the
    /// `anyhow::Error`; the dispatcher unwraps them again so the failing
    /// node keeps its attribution.
    pub async fn run(self, ctx: Value) -> anyhow::Result<Dispatched> {
        (self.run)(ctx).await.map_err(anyhow::Error::from)
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Input to a wrapping method.
#[derive(Debug)]
pub struct WrapCall<'a> {
    pub method: String,
    pub ctx: Value,
    pub params: Value,
    pub node: NodeIdentity,
    pub next: Next<'a>,
}

/// A method that wraps the default recursion at its node.
///
/// # Example
///
/// ```ignore
/// struct Audit;
///
/// #[async_trait]
/// impl WrapMethod for Audit {
///     async fn invoke(&self, call: WrapCall<'_>) -> anyhow::Result<Dispatched> {
///         let mut ctx = call.ctx;
///         ctx["calls"] = json!(ctx["calls"].as_u64().unwrap_or(0) + 1);
///         let mut out = call.next.run(ctx).await?;
///         out.rename_arrow("done", "finished");
///         Ok(out)
///     }
/// }
/// ```
#[async_trait]
pub trait WrapMethod: Send + Sync {
    async fn invoke(&self, call: WrapCall<'_>) -> anyhow::Result<Dispatched>;
}

// =============================================================================
// Handler Table
// =============================================================================

/// How a method is implemented.
#[derive(Clone)]
pub enum Capability {
    Leaf(Arc<dyn LeafMethod>),
    Wrap(Arc<dyn WrapMethod>),
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Leaf(_) => write!(f, "Leaf"),
            Capability::Wrap(_) => write!(f, "Wrap"),
        }
    }
}

/// One entry of a handler's method table.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub capability: Capability,
    /// The method may run without holding the instance lock.
    pub unsynchronized: bool,
}

/// Method table for one node.
#[derive(Debug, Clone, Default)]
pub struct Handler {
    methods: HashMap<String, MethodSpec>,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain method.
    pub fn on<F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(LeafCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        self.with_method(method, Capability::Leaf(Arc::new(f)), false)
    }

    /// Register a plain method that does not need the instance lock.
    ///
    /// A call only skips the lock if every node defining the method opted in.
    pub fn on_unsynchronized<F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(LeafCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        self.with_method(method, Capability::Leaf(Arc::new(f)), true)
    }

    /// Register a method implemented by a [`LeafMethod`] value.
    pub fn on_method<M: LeafMethod + 'static>(self, method: impl Into<String>, m: M) -> Self {
        self.with_method(method, Capability::Leaf(Arc::new(m)), false)
    }

    /// Register a wrapping method.
    pub fn wrap<W: WrapMethod + 'static>(self, method: impl Into<String>, w: W) -> Self {
        self.with_method(method, Capability::Wrap(Arc::new(w)), false)
    }

    /// Register a method with an explicit capability.
    pub fn with_method(
        mut self,
        method: impl Into<String>,
        capability: Capability,
        unsynchronized: bool,
    ) -> Self {
        self.methods.insert(
            method.into(),
            MethodSpec {
                capability,
                unsynchronized,
            },
        );
        self
    }

    /// Look up a method.
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    /// True if the handler defines `name`.
    pub fn defines(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Names of all defined methods.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity {
            id: id.into(),
            instance_id: None,
        }
    }

    #[tokio::test]
    async fn test_closure_leaf_method() {
        let handler = Handler::new().on("ping", |call: LeafCall| async move {
            Ok(Reply::new()
                .with_result(format!("pong from {}", call.node.id))
                .with_arrow("next"))
        });

        let spec = handler.method("ping").unwrap();
        assert!(!spec.unsynchronized);
        let Capability::Leaf(m) = &spec.capability else {
            panic!("expected leaf capability");
        };

        let reply = m
            .invoke(LeafCall {
                method: "ping".into(),
                ctx: json!({}),
                params: json!(null),
                node: identity("main:A"),
            })
            .await
            .unwrap();

        assert_eq!(reply.result, Some(json!("pong from main:A")));
        assert_eq!(reply.arrow.as_deref(), Some("next"));
        assert!(reply.ctx.is_none());
    }

    #[test]
    fn test_unsynchronized_flag() {
        let handler = Handler::new()
            .on("write", |_c: LeafCall| async move { Ok(Reply::new()) })
            .on_unsynchronized("read", |_c: LeafCall| async move { Ok(Reply::new()) });

        assert!(!handler.method("write").unwrap().unsynchronized);
        assert!(handler.method("read").unwrap().unsynchronized);
        assert!(handler.defines("read"));
        assert!(!handler.defines("delete"));
    }

    struct Renaming;

    #[async_trait]
    impl WrapMethod for Renaming {
        async fn invoke(&self, call: WrapCall<'_>) -> anyhow::Result<Dispatched> {
            let mut out = call.next.run(call.ctx).await?;
            out.rename_arrow("done", "finished");
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_wrap_method_renames_outermost_arrow() {
        let next = Next::new(|ctx| {
            Box::pin(async move {
                let mut out = Dispatched::idle(ctx);
                let mut path = ArrowPath::new("main:G:A", Some("done".into()));
                path.ascend("main:G");
                out.arrows.push(path);
                out.handled = true;
                Ok(out)
            })
        });

        let out = Renaming
            .invoke(WrapCall {
                method: "go".into(),
                ctx: json!({"k": 1}),
                params: Value::Null,
                node: identity("main:G"),
                next,
            })
            .await
            .unwrap();

        assert_eq!(out.ctx, json!({"k": 1}));
        assert_eq!(out.arrows[0].outermost_arrow(), Some("finished"));
        let first = out.arrows[0].steps().next().unwrap();
        assert_eq!(first.arrow.as_deref(), Some("done"));
    }

    #[test]
    fn test_dispatched_swallow_and_emit() {
        let mut out = Dispatched::idle(json!({}));
        out.emit("main:A", "x");
        out.emit("main:B", "y");
        assert!(out.has_arrows());

        out.swallow_arrow("x");
        assert_eq!(out.arrows.len(), 1);
        assert_eq!(out.arrows[0].origin(), Some("main:B"));
    }
}
