//! Causality tracking for nested dispatches.
//!
//! When enabled, every request passing through a scope gets an id and an
//! edge `(id, parent-id, request-type, timestamp)` appended to the scope's
//! causality chain. Nested sends issued from inside a handler see the outer
//! request's id as their parent, so the chain forms the call tree of one
//! scope.
//!
//! The stage is an [`OpenBehavior`] registered implicitly for every request
//! type when `enable_causality_tracking` is on. It requires the pipeline
//! context; without one in scope it passes straight through.

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::trace;

use crate::context::{BAGGAGE_REQUEST_ID, ITEM_CURRENT_REQUEST_ID};
use crate::core::RequestId;
use crate::handler::DispatchContext;
use crate::pipeline::{OpenBehavior, OpenNext, RequestMeta};

/// One edge in a scope's request tree.
#[derive(Debug, Clone)]
pub struct CausalityEntry {
    /// Id assigned to this request.
    pub request_id: RequestId,
    /// Id of the enclosing request, or `None` for a root.
    pub parent_id: Option<RequestId>,
    /// Concrete type name of the request.
    pub request_type: &'static str,
    /// When the edge was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl CausalityEntry {
    /// Whether this entry is a root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// The built-in causality stage.
///
/// Per invocation: adopt the `request_id` baggage value as the current id
/// (or generate a fresh one), read the parent from the reserved item key,
/// append the edge, overwrite the key for the duration of `next`, and
/// restore the parent on the way out — whether `next` succeeded or failed.
pub struct CausalityBehavior;

#[async_trait]
impl OpenBehavior for CausalityBehavior {
    async fn handle(
        &self,
        request: RequestMeta<'_>,
        ctx: &DispatchContext,
        next: OpenNext<'_>,
    ) -> anyhow::Result<Box<dyn Any + Send>> {
        let Some(context) = ctx.pipeline_context() else {
            return next.run().await;
        };

        let id = context
            .baggage(BAGGAGE_REQUEST_ID)
            .map(RequestId::from)
            .unwrap_or_default();
        // The dispatch context carries the parent; the reserved item key is
        // kept in step for sequential observers.
        let parent = ctx.current_request_id();

        trace!(
            request_type = request.type_name(),
            request_id = %id,
            parent_id = parent.as_ref().map(|p| p.as_str()),
            "recording causality edge"
        );

        context.record_causality(CausalityEntry {
            request_id: id.clone(),
            parent_id: parent.clone(),
            request_type: request.type_name(),
            recorded_at: Utc::now(),
        });
        ctx.set_current_request_id(Some(id.clone()));
        context.set_item(ITEM_CURRENT_REQUEST_ID, id);

        let result = next.run().await;

        // Restore the outer id no matter how `next` ended.
        ctx.set_current_request_id(parent.clone());
        match parent {
            Some(parent) => context.set_item(ITEM_CURRENT_REQUEST_ID, parent),
            None => {
                context.remove_item(ITEM_CURRENT_REQUEST_ID);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayOptions;
    use crate::dispatch::RelayBuilder;
    use crate::handler::RequestHandler;
    use crate::Request;

    #[derive(Debug, Clone)]
    struct Outer;

    impl Request for Outer {
        type Response = ();
    }

    #[derive(Debug, Clone)]
    struct Inner;

    impl Request for Inner {
        type Response = ();
    }

    struct OuterHandler;

    #[async_trait]
    impl RequestHandler<Outer> for OuterHandler {
        async fn handle(&self, _request: &Outer, ctx: &DispatchContext) -> anyhow::Result<()> {
            ctx.send(Inner).await
        }
    }

    struct InnerHandler;

    #[async_trait]
    impl RequestHandler<Inner> for InnerHandler {
        async fn handle(&self, _request: &Inner, _ctx: &DispatchContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn tracked_builder() -> RelayBuilder {
        RelayBuilder::new().with_options(RelayOptions::default().with_causality_tracking(true))
    }

    #[tokio::test]
    async fn test_nested_sends_form_parent_child_chain() {
        let relay = tracked_builder()
            .with_handler::<Outer, _>(OuterHandler)
            .with_handler::<Inner, _>(InnerHandler)
            .build();

        let scope = relay.create_scope();
        scope.send(Outer).await.unwrap();

        let chain = scope.context().unwrap().causality_chain();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].is_root());
        assert_eq!(chain[1].parent_id.as_ref(), Some(&chain[0].request_id));
        assert!(chain[0].request_type.contains("Outer"));
        assert!(chain[1].request_type.contains("Inner"));
    }

    struct FailingInnerHandler;

    #[async_trait]
    impl RequestHandler<Inner> for FailingInnerHandler {
        async fn handle(&self, _request: &Inner, _ctx: &DispatchContext) -> anyhow::Result<()> {
            anyhow::bail!("inner exploded")
        }
    }

    struct ObservantOuterHandler;

    #[async_trait]
    impl RequestHandler<Outer> for ObservantOuterHandler {
        async fn handle(&self, _request: &Outer, ctx: &DispatchContext) -> anyhow::Result<()> {
            let context = ctx.pipeline_context().expect("scope context");
            let my_id = (*context
                .item::<RequestId>(ITEM_CURRENT_REQUEST_ID)
                .expect("current id"))
            .clone();

            let err = ctx.send(Inner).await.unwrap_err();
            assert!(err.to_string().contains("inner exploded"));

            // The inner failure must not leak its id into our slot.
            let restored = (*context
                .item::<RequestId>(ITEM_CURRENT_REQUEST_ID)
                .expect("current id"))
            .clone();
            assert_eq!(restored, my_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_current_id_restored_after_nested_failure() {
        let relay = tracked_builder()
            .with_handler::<Outer, _>(ObservantOuterHandler)
            .with_handler::<Inner, _>(FailingInnerHandler)
            .build();

        let scope = relay.create_scope();
        scope.send(Outer).await.unwrap();

        // After the root completed, the reserved key is cleared again.
        let context = scope.context().unwrap();
        assert!(context.item::<RequestId>(ITEM_CURRENT_REQUEST_ID).is_none());
    }

    #[tokio::test]
    async fn test_no_context_means_no_chain() {
        let relay = tracked_builder()
            .with_handler::<Inner, _>(InnerHandler)
            .build();

        // Sending without a scope: the causality stage passes through.
        relay.send(Inner).await.unwrap();
    }

    #[tokio::test]
    async fn test_baggage_request_id_is_adopted() {
        let relay = tracked_builder()
            .with_handler::<Inner, _>(InnerHandler)
            .build();

        let scope = relay.create_scope();
        let context = scope.context().unwrap();
        context.set_baggage(BAGGAGE_REQUEST_ID, "edge-supplied");

        scope.send(Inner).await.unwrap();

        let chain = context.causality_chain();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].request_id.as_str(), "edge-supplied");
    }

    #[tokio::test]
    async fn test_causality_disabled_records_nothing() {
        let relay = RelayBuilder::new()
            .with_handler::<Inner, _>(InnerHandler)
            .build();

        let scope = relay.create_scope();
        scope.send(Inner).await.unwrap();

        assert!(scope.context().unwrap().causality_chain().is_empty());
    }
}
