//! Handler traits and the per-dispatch context.
//!
//! Handlers are the terminal stage of a pipeline. They are **stateless from
//! the engine's point of view** — anything they need beyond the request
//! itself comes from the service locator through the dispatch context.
//!
//! # Narrow context
//!
//! [`DispatchContext`] is intentionally narrow. A handler or stage can:
//! 1. Observe the cancellation signal
//! 2. Look up the scope's pipeline context (weak; absent outside a scope)
//! 3. Resolve services from the locator
//! 4. Issue nested dispatches that stay inside the same scope
//!
//! It cannot reach into the registry, mutate registrations, or extend the
//! lifetime of the scope it runs in.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::context::PipelineContext;
use crate::core::{Notification, Request, RequestId, StreamRequest};
use crate::dispatch::{Relay, ScopeState};
use crate::error::RelayError;

/// The sole handler for a request type.
///
/// Exactly one implementation is installed per request type; dispatching a
/// request without one fails with an unregistered-handler error before any
/// stage runs.
///
/// # Example
///
/// ```ignore
/// struct PingHandler;
///
/// #[async_trait]
/// impl RequestHandler<Ping> for PingHandler {
///     async fn handle(&self, request: &Ping, _ctx: &DispatchContext) -> anyhow::Result<Pong> {
///         Ok(Pong { reply: format!("Pong: {}", request.message) })
///     }
/// }
/// ```
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    /// Produce the response for one request.
    async fn handle(&self, request: &R, ctx: &DispatchContext) -> anyhow::Result<R::Response>;
}

/// One of the handlers a notification fans out to.
///
/// Zero or more implementations may be installed per notification type;
/// publishing with none registered succeeds immediately.
#[async_trait]
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    /// Observe one notification.
    async fn handle(&self, notification: &N, ctx: &DispatchContext) -> anyhow::Result<()>;
}

/// The sole handler for a stream request type.
///
/// Returns a lazy sequence; nothing should run until the caller polls.
/// The handler receives the request behind an `Arc` because the sequence
/// outlives the `create_stream` call, and an owned context for the same
/// reason.
pub trait StreamHandler<R: StreamRequest>: Send + Sync + 'static {
    /// Produce the lazy sequence for one stream request.
    fn handle(
        &self,
        request: Arc<R>,
        ctx: DispatchContext,
    ) -> BoxStream<'static, anyhow::Result<R::Item>>;
}

/// Per-dispatch capability surface handed to handlers and stages.
///
/// Cheap to clone; clones are semantically identical. The scope reference is
/// weak: once the owning scope is dropped, `pipeline_context()` returns
/// `None` and scoped service resolution falls back to transient.
#[derive(Clone)]
pub struct DispatchContext {
    relay: Relay,
    scope: Weak<ScopeState>,
    cancellation: CancellationToken,
    /// Id of the request this dispatch runs under. Forked per dispatch so
    /// parallel nested sends each see the right parent.
    current_request: Arc<Mutex<Option<RequestId>>>,
}

impl DispatchContext {
    pub(crate) fn new(relay: Relay, scope: Weak<ScopeState>, cancellation: CancellationToken) -> Self {
        Self {
            relay,
            scope,
            cancellation,
            current_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Derive the context for a nested dispatch: same scope and signal, own
    /// current-request slot seeded from this one.
    pub(crate) fn fork(&self) -> Self {
        Self {
            relay: self.relay.clone(),
            scope: self.scope.clone(),
            cancellation: self.cancellation.clone(),
            current_request: Arc::new(Mutex::new(self.current_request_id())),
        }
    }

    /// Id of the request currently in flight on this dispatch, when
    /// causality tracking assigned one.
    pub fn current_request_id(&self) -> Option<RequestId> {
        self.current_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_current_request_id(&self, id: Option<RequestId>) {
        *self
            .current_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
    }

    /// The caller's cancellation signal for this dispatch.
    ///
    /// Stages and handlers must observe it at their suspension points.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Fail fast with [`RelayError::Cancelled`] if the caller gave up.
    pub fn ensure_not_cancelled(&self) -> anyhow::Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(RelayError::Cancelled.into());
        }
        Ok(())
    }

    /// The scope's pipeline context, if this dispatch runs inside a live
    /// scope that has the context enabled.
    pub fn pipeline_context(&self) -> Option<Arc<PipelineContext>> {
        self.scope.upgrade()?.context.clone()
    }

    pub(crate) fn scope(&self) -> Option<Arc<ScopeState>> {
        self.scope.upgrade()
    }

    /// Resolve a single service from the locator (the most recent
    /// registration wins).
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.relay.resolve_service::<T>(self.scope().as_deref())
    }

    /// Resolve every service registered for `T`, in registration order.
    pub fn resolve_all<T: Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.relay.resolve_services::<T>(self.scope().as_deref())
    }

    /// Issue a nested send that shares this dispatch's scope and
    /// cancellation signal.
    pub async fn send<R: Request>(&self, request: R) -> anyhow::Result<R::Response> {
        self.relay.dispatch_request(request, self).await
    }

    /// Issue a nested publish that shares this dispatch's scope and
    /// cancellation signal.
    pub async fn publish<N: Notification>(&self, notification: N) -> anyhow::Result<()> {
        self.relay.dispatch_notification(notification, self).await
    }

    /// Open a nested stream that shares this dispatch's scope and
    /// cancellation signal.
    pub fn create_stream<R: StreamRequest>(
        &self,
        request: R,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<R::Item>>> {
        self.relay.dispatch_stream(request, self)
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("in_scope", &(self.scope.strong_count() > 0))
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}
