//! Dispatcher for routing a method call through the active tree.
//!
//! The `Dispatcher` is responsible for:
//! 1. Walking from the root to every active leaf
//! 2. Invoking the handler bound to each node that defines the method
//! 3. Folding results, contexts, and transition requests back up the tree
//!
//! # Walk Rules
//!
//! - **Leaf**: invoke the handler; no further recursion.
//! - **Composite**: dispatch every child concurrently, join them all, merge
//!   their contexts (see [`crate::merge`]), key results by child name.
//! - **Graph**: dispatch the active child only.
//!
//! On the way back up every node appends itself to each arrow path, so the
//! transition engine can see which arrow name each level left with.
//!
//! # Wrapping
//!
//! A handler bound to any node may define the method as a
//! [`WrapMethod`](crate::WrapMethod). The wrapper receives a [`Next`] that
//! performs the walk rules above *for its own node*, including appending the
//! node to arrow paths. Whatever the wrapper does before or after, path
//! accumulation below it is already complete when it gets the result.

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::{local_name, ActiveStateMap, ArrowPath, InstanceIds, ROOT};
use crate::error::TrellisError;
use crate::graph::{GraphModel, GraphNode, HandlerTable, NodeKind};
use crate::handler::{Capability, Dispatched, LeafCall, LeafMethod, NodeIdentity, Next, Reply, WrapCall};
use crate::merge::{self, Branch};

/// Routes one method call through one snapshot of machine state.
///
/// A dispatcher borrows everything it needs; it is created per pass and
/// holds no state of its own.
pub struct Dispatcher<'a> {
    model: &'a GraphModel,
    active: &'a ActiveStateMap,
    handlers: &'a HandlerTable,
    instance_ids: &'a InstanceIds,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        model: &'a GraphModel,
        active: &'a ActiveStateMap,
        handlers: &'a HandlerTable,
        instance_ids: &'a InstanceIds,
    ) -> Self {
        Self {
            model,
            active,
            handlers,
            instance_ids,
        }
    }

    /// Dispatch `method` from the root.
    pub async fn dispatch(
        &self,
        method: &str,
        params: &Value,
        ctx: Value,
    ) -> Result<Dispatched, TrellisError> {
        self.dispatch_node(ROOT, method, params, ctx).await
    }

    /// Invoke `method` on one node's handler without walking into children.
    ///
    /// Used for lifecycle hooks. A wrapping method gets a continuation that
    /// does nothing.
    pub async fn invoke_node(
        &self,
        id: &str,
        method: &str,
        params: &Value,
        ctx: Value,
    ) -> Result<Dispatched, TrellisError> {
        let capability = self
            .handlers
            .get(id)
            .and_then(|h| h.method(method))
            .map(|spec| spec.capability.clone());

        match capability {
            None => Ok(Dispatched::idle(ctx)),
            Some(Capability::Leaf(m)) => self.invoke_leaf(id, m.as_ref(), method, params, ctx).await,
            Some(Capability::Wrap(w)) => {
                let call = WrapCall {
                    method: method.to_owned(),
                    ctx,
                    params: params.clone(),
                    node: self.identity(id),
                    next: Next::idle(),
                };
                let mut out = w
                    .invoke(call)
                    .await
                    .map_err(|e| handler_error(id, method, e))?;
                out.handled = true;
                Ok(out)
            }
        }
    }

    fn dispatch_node<'s>(
        &'s self,
        id: &'s str,
        method: &'s str,
        params: &'s Value,
        ctx: Value,
    ) -> BoxFuture<'s, Result<Dispatched, TrellisError>> {
        async move {
            let Some(node) = self.model.node(id) else {
                warn!(node = id, "dispatch reached a node missing from the model");
                return Ok(Dispatched::idle(ctx));
            };

            let capability = self
                .handlers
                .get(id)
                .and_then(|h| h.method(method))
                .map(|spec| spec.capability.clone());

            match capability {
                None => self.walk(node, method, params, ctx).await,
                Some(Capability::Wrap(w)) => {
                    let next = Next::new(move |ctx| self.walk(node, method, params, ctx));
                    let call = WrapCall {
                        method: method.to_owned(),
                        ctx,
                        params: params.clone(),
                        node: self.identity(id),
                        next,
                    };
                    let mut out = w
                        .invoke(call)
                        .await
                        .map_err(|e| handler_error(id, method, e))?;
                    out.handled = true;
                    Ok(out)
                }
                Some(Capability::Leaf(m)) if node.kind == NodeKind::Leaf => {
                    self.invoke_leaf(id, m.as_ref(), method, params, ctx).await
                }
                Some(Capability::Leaf(m)) => {
                    // A plain method on a container runs after its subtree,
                    // on the subtree's merged context.
                    let below = self.walk(node, method, params, ctx).await?;
                    let own = self
                        .invoke_leaf(id, m.as_ref(), method, params, below.ctx)
                        .await?;

                    let mut arrows = below.arrows;
                    arrows.extend(own.arrows);
                    let result = if own.result.is_null() {
                        below.result
                    } else {
                        own.result
                    };
                    Ok(Dispatched {
                        arrows,
                        ctx: own.ctx,
                        result,
                        handled: true,
                    })
                }
            }
        }
        .boxed()
    }

    /// The default recursion at `node`.
    fn walk<'s>(
        &'s self,
        node: &'s GraphNode,
        method: &'s str,
        params: &'s Value,
        ctx: Value,
    ) -> BoxFuture<'s, Result<Dispatched, TrellisError>> {
        async move {
            match node.kind {
                NodeKind::Leaf => Ok(Dispatched::idle(ctx)),
                NodeKind::Graph => {
                    let Some(child) = self.model.active_child(node, self.active) else {
                        return Ok(Dispatched::idle(ctx));
                    };
                    let mut out = self.dispatch_node(child, method, params, ctx).await?;
                    for path in &mut out.arrows {
                        path.ascend(node.id.clone());
                    }
                    Ok(out)
                }
                NodeKind::Composite => {
                    let branches = node
                        .children
                        .iter()
                        .map(|child| self.dispatch_node(child, method, params, ctx.clone()));
                    let outcomes = try_join_all(branches).await?;

                    let merged = merge::merge(
                        &ctx,
                        &outcomes
                            .iter()
                            .map(|o| Branch {
                                ctx: &o.ctx,
                                handled: o.handled,
                            })
                            .collect::<Vec<_>>(),
                    );

                    let mut result = Map::new();
                    let mut arrows = Vec::new();
                    let mut handled = false;
                    for (child, outcome) in node.children.iter().zip(outcomes) {
                        handled |= outcome.handled;
                        result.insert(local_name(child).to_owned(), outcome.result);
                        for mut path in outcome.arrows {
                            path.ascend(node.id.clone());
                            arrows.push(path);
                        }
                    }

                    Ok(Dispatched {
                        arrows,
                        ctx: merged,
                        result: Value::Object(result),
                        handled,
                    })
                }
            }
        }
        .boxed()
    }

    async fn invoke_leaf(
        &self,
        id: &str,
        m: &dyn LeafMethod,
        method: &str,
        params: &Value,
        ctx: Value,
    ) -> Result<Dispatched, TrellisError> {
        debug!(node = id, method, "invoking handler");
        let call = LeafCall {
            method: method.to_owned(),
            ctx: ctx.clone(),
            params: params.clone(),
            node: self.identity(id),
        };
        let Reply {
            result,
            ctx: new_ctx,
            arrow,
        } = m
            .invoke(call)
            .await
            .map_err(|e| handler_error(id, method, e))?;

        let mut arrows = Vec::new();
        if let Some(arrow) = arrow {
            debug!(node = id, method, arrow = %arrow, "handler requested transition");
            arrows.push(ArrowPath::new(id, Some(arrow)));
        }

        Ok(Dispatched {
            arrows,
            ctx: new_ctx.unwrap_or(ctx),
            result: result.unwrap_or(Value::Null),
            handled: true,
        })
    }

    fn identity(&self, id: &str) -> NodeIdentity {
        NodeIdentity {
            id: id.to_owned(),
            instance_id: self.instance_ids.get(id).cloned(),
        }
    }
}

/// Attribute a handler error to its node, unless it already is a trellis error
/// from deeper in the tree.
fn handler_error(id: &str, method: &str, err: anyhow::Error) -> TrellisError {
    match err.downcast::<TrellisError>() {
        Ok(inner) => inner,
        Err(source) => {
            warn!(node = id, method, error = %source, "handler failed");
            TrellisError::HandlerFailure {
                node: id.to_owned(),
                method: method.to_owned(),
                source,
            }
        }
    }
}
