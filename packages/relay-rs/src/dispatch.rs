//! The relay façade: send, publish, stream, scopes, and the wrapper caches.
//!
//! # Wrapper caches
//!
//! Pipelines are compiled lazily: the first dispatch of a request type runs
//! the build closure captured at registration and stores the result in a
//! process-wide concurrent map keyed by `TypeId`. `get-or-build` guarantees
//! at most one *effective* build per key — two racing threads may both
//! construct, but exactly one construction is inserted and the loser's copy
//! is discarded, so the cached value is stable. Entries are never evicted.
//!
//! # Scopes
//!
//! A [`RelayScope`] owns the pipeline context (when enabled) and the caches
//! for scoped services and scoped handlers. Dispatches issued through the
//! scope — and nested dispatches issued from inside their handlers — share
//! that state through a weak reference; dropping the scope releases all of
//! it.

use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PublishStrategy, RelayOptions};
use crate::context::PipelineContext;
use crate::core::{Notification, Request, StreamRequest};
use crate::error::RelayError;
use crate::handler::{
    DispatchContext, NotificationHandler, RequestHandler, StreamHandler,
};
use crate::pipeline::{
    Behavior, ExceptionHandler, OpenBehavior, OpenExceptionHandler, OpenPostProcessor,
    OpenPreProcessor, PostProcessor, PreProcessor, RequestPipeline,
};
use crate::provider::{ServiceLocator, ServiceProvider, ServiceScope};
use crate::publish::{
    NotificationInvocation, NotificationPublisher, ParallelPublisher, SequentialPublisher,
};
use crate::registry::{Registry, RequestShape, ServiceSlot};
use crate::stream::{OpenStreamBehavior, StreamBehavior, StreamPipeline};

/// A set of registrations contributed by one part of the host application.
///
/// Modules are the discovery unit: the builder applies them at startup and
/// [`Relay::validate_registrations`] walks them again to check that every
/// request type they declare has a handler installed.
///
/// # Example
///
/// ```ignore
/// struct BillingModule;
///
/// impl RelayModule for BillingModule {
///     fn register(&self, builder: &mut RelayBuilder) {
///         builder.add_handler::<ChargeCard, _>(ChargeCardHandler);
///         builder.add_notification_handler::<InvoicePaid, _>(ReceiptMailer);
///     }
/// }
/// ```
pub trait RelayModule: Send + Sync {
    /// Install this module's handlers, stages, and declarations.
    fn register(&self, builder: &mut RelayBuilder);
}

pub(crate) struct ScopeState {
    pub(crate) context: Option<Arc<PipelineContext>>,
    pub(crate) services: ServiceScope,
    handlers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ScopeState {
    /// Scope-cached handler resolution. Two racers may both construct; the
    /// cache is stable once written.
    pub(crate) fn cached_handler<V: Clone + Send + Sync + 'static>(
        &self,
        key: TypeId,
        make: impl FnOnce() -> V,
    ) -> V {
        if let Some(entry) = self.handlers.get(&key) {
            if let Ok(cached) = entry.value().clone().downcast::<V>() {
                return (*cached).clone();
            }
        }
        let value = make();
        self.handlers.insert(key, Arc::new(value.clone()));
        value
    }
}

/// A bounded lifetime within which dispatches share a pipeline context.
///
/// Dropping the scope releases the context and every scoped service; weak
/// references held by in-flight stages stop resolving.
pub struct RelayScope {
    relay: Relay,
    state: Arc<ScopeState>,
}

impl RelayScope {
    /// The scope's pipeline context, unless disabled in the options.
    pub fn context(&self) -> Option<&Arc<PipelineContext>> {
        self.state.context.as_ref()
    }

    fn ctx(&self, cancellation: CancellationToken) -> DispatchContext {
        DispatchContext::new(self.relay.clone(), Arc::downgrade(&self.state), cancellation)
    }

    /// Send a request within this scope.
    pub async fn send<R: Request>(&self, request: R) -> anyhow::Result<R::Response> {
        self.send_with(request, CancellationToken::new()).await
    }

    /// Send a request within this scope with an explicit cancellation token.
    pub async fn send_with<R: Request>(
        &self,
        request: R,
        cancellation: CancellationToken,
    ) -> anyhow::Result<R::Response> {
        let ctx = self.ctx(cancellation);
        self.relay.dispatch_request(request, &ctx).await
    }

    /// Publish a notification within this scope.
    pub async fn publish<N: Notification>(&self, notification: N) -> anyhow::Result<()> {
        self.publish_with(notification, CancellationToken::new()).await
    }

    /// Publish a notification within this scope with an explicit token.
    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        let ctx = self.ctx(cancellation);
        self.relay.dispatch_notification(notification, &ctx).await
    }

    /// Open a stream within this scope.
    pub fn create_stream<R: StreamRequest>(
        &self,
        request: R,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<R::Item>>> {
        self.create_stream_with(request, CancellationToken::new())
    }

    /// Open a stream within this scope with an explicit token.
    pub fn create_stream_with<R: StreamRequest>(
        &self,
        request: R,
        cancellation: CancellationToken,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<R::Item>>> {
        let ctx = self.ctx(cancellation);
        self.relay.dispatch_stream(request, &ctx)
    }
}

impl std::fmt::Debug for RelayScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayScope")
            .field("has_context", &self.state.context.is_some())
            .finish()
    }
}

struct NotificationSet<N: Notification> {
    type_name: &'static str,
    handlers: Vec<(&'static str, Arc<dyn NotificationHandler<N>>)>,
}

pub(crate) struct RelayInner {
    registry: Registry,
    options: RelayOptions,
    publisher: Arc<dyn NotificationPublisher>,
    locator: Arc<dyn ServiceLocator>,
    request_wrappers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    stream_wrappers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    notification_wrappers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

/// The dispatcher façade. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Start building a relay.
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    fn root_ctx(&self, cancellation: CancellationToken) -> DispatchContext {
        DispatchContext::new(self.clone(), Weak::new(), cancellation)
    }

    /// Open a scope. Dispatches through it share one pipeline context and
    /// one set of scoped services.
    pub fn create_scope(&self) -> RelayScope {
        let context = self
            .inner
            .options
            .enable_pipeline_context
            .then(|| Arc::new(PipelineContext::new()));
        let state = Arc::new(ScopeState {
            context,
            services: self.inner.locator.create_scope(),
            handlers: DashMap::new(),
        });
        RelayScope {
            relay: self.clone(),
            state,
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // send
    // ────────────────────────────────────────────────────────────────────

    /// Dispatch a request to its sole handler and return the typed response.
    pub async fn send<R: Request>(&self, request: R) -> anyhow::Result<R::Response> {
        self.send_with(request, CancellationToken::new()).await
    }

    /// Dispatch a request with an explicit cancellation token.
    pub async fn send_with<R: Request>(
        &self,
        request: R,
        cancellation: CancellationToken,
    ) -> anyhow::Result<R::Response> {
        let ctx = self.root_ctx(cancellation);
        self.dispatch_request(request, &ctx).await
    }

    /// Untyped send: the response comes back as an opaque boxed value.
    ///
    /// Fails with null-input when no value is supplied, and with
    /// contract-violation when the value's type never declared itself a
    /// request.
    pub async fn send_erased(
        &self,
        request: Option<Box<dyn Any + Send + Sync>>,
    ) -> anyhow::Result<Box<dyn Any + Send>> {
        self.send_erased_with(request, CancellationToken::new()).await
    }

    /// Untyped send with an explicit cancellation token.
    pub async fn send_erased_with(
        &self,
        request: Option<Box<dyn Any + Send + Sync>>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<Box<dyn Any + Send>> {
        let request = request.ok_or(RelayError::NullInput)?;
        let type_id = (*request).type_id();
        let entry = match self.inner.registry.request_entry(type_id) {
            Some(entry) => entry,
            None => return Err(self.erased_miss(type_id, RequestShape::Request)),
        };
        debug!(request_type = entry.type_name, "erased send");
        let ctx = self.root_ctx(cancellation);
        (entry.erased)(self.clone(), request, ctx).await
    }

    pub(crate) async fn dispatch_request<R: Request>(
        &self,
        request: R,
        ctx: &DispatchContext,
    ) -> anyhow::Result<R::Response> {
        let pipeline = self.request_pipeline::<R>()?;
        debug!(request_type = pipeline.type_name, "dispatching request");
        let ctx = ctx.fork();
        pipeline.execute(request, &ctx).await
    }

    fn request_pipeline<R: Request>(&self) -> anyhow::Result<Arc<RequestPipeline<R>>> {
        let type_id = TypeId::of::<R>();
        let wrapper = match self.inner.request_wrappers.get(&type_id) {
            Some(entry) => entry.value().clone(),
            None => {
                let entry = self.inner.registry.request_entry(type_id).ok_or_else(|| {
                    error!(
                        request_type = std::any::type_name::<R>(),
                        "no handler registered for request type"
                    );
                    RelayError::UnregisteredHandler {
                        request_type: std::any::type_name::<R>(),
                    }
                })?;
                let built = (entry.build)(&self.inner.registry, &self.inner.options);
                self.inner
                    .request_wrappers
                    .entry(type_id)
                    .or_insert(built)
                    .value()
                    .clone()
            }
        };
        wrapper.downcast::<RequestPipeline<R>>().map_err(|_| {
            RelayError::ContractViolation {
                message: "wrapper cache entry does not match its request type".to_string(),
            }
            .into()
        })
    }

    // ────────────────────────────────────────────────────────────────────
    // publish
    // ────────────────────────────────────────────────────────────────────

    /// Fan a notification out to its handlers using the configured
    /// publisher. Zero registered handlers is an immediate success.
    pub async fn publish<N: Notification>(&self, notification: N) -> anyhow::Result<()> {
        self.publish_with(notification, CancellationToken::new()).await
    }

    /// Publish with an explicit cancellation token.
    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        let ctx = self.root_ctx(cancellation);
        self.dispatch_notification(notification, &ctx).await
    }

    pub(crate) async fn dispatch_notification<N: Notification>(
        &self,
        notification: N,
        ctx: &DispatchContext,
    ) -> anyhow::Result<()> {
        let set = self.notification_set::<N>();
        if set.handlers.is_empty() {
            return Ok(());
        }
        let ctx = ctx.fork();
        debug!(
            notification_type = set.type_name,
            handler_count = set.handlers.len(),
            "publishing notification"
        );

        let shared = Arc::new(notification);
        let invocations: Vec<NotificationInvocation> = set
            .handlers
            .iter()
            .map(|(name, handler)| {
                let handler = handler.clone();
                let notification = shared.clone();
                let ctx = ctx.clone();
                NotificationInvocation::new(
                    *name,
                    Box::pin(async move { handler.handle(notification.as_ref(), &ctx).await }),
                )
            })
            .collect();

        self.inner
            .publisher
            .publish(invocations, ctx.cancellation())
            .await
    }

    fn notification_set<N: Notification>(&self) -> Arc<NotificationSet<N>> {
        let type_id = TypeId::of::<N>();
        if let Some(entry) = self.inner.notification_wrappers.get(&type_id) {
            if let Ok(set) = entry.value().clone().downcast::<NotificationSet<N>>() {
                return set;
            }
        }
        let built = Arc::new(NotificationSet {
            type_name: std::any::type_name::<N>(),
            handlers: self.inner.registry.notification_handlers::<N>(),
        });
        let stored = self
            .inner
            .notification_wrappers
            .entry(type_id)
            .or_insert_with(|| built.clone() as Arc<dyn Any + Send + Sync>)
            .value()
            .clone();
        stored.downcast::<NotificationSet<N>>().unwrap_or(built)
    }

    // ────────────────────────────────────────────────────────────────────
    // stream
    // ────────────────────────────────────────────────────────────────────

    /// Resolve the stream pipeline for the request and return its lazy,
    /// cancellable sequence. Nothing runs until the caller polls.
    pub fn create_stream<R: StreamRequest>(
        &self,
        request: R,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<R::Item>>> {
        self.create_stream_with(request, CancellationToken::new())
    }

    /// Open a stream with an explicit cancellation token.
    pub fn create_stream_with<R: StreamRequest>(
        &self,
        request: R,
        cancellation: CancellationToken,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<R::Item>>> {
        let ctx = self.root_ctx(cancellation);
        self.dispatch_stream(request, &ctx)
    }

    /// Untyped stream: elements come back as opaque boxed values.
    pub fn create_stream_erased(
        &self,
        request: Option<Box<dyn Any + Send + Sync>>,
        cancellation: CancellationToken,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Box<dyn Any + Send>>>> {
        let request = request.ok_or(RelayError::NullInput)?;
        let type_id = (*request).type_id();
        let entry = match self.inner.registry.stream_entry(type_id) {
            Some(entry) => entry,
            None => return Err(self.erased_miss(type_id, RequestShape::Stream)),
        };
        debug!(request_type = entry.type_name, "erased stream");
        let ctx = self.root_ctx(cancellation);
        (entry.erased)(self.clone(), request, ctx)
    }

    pub(crate) fn dispatch_stream<R: StreamRequest>(
        &self,
        request: R,
        ctx: &DispatchContext,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<R::Item>>> {
        let pipeline = self.stream_pipeline::<R>()?;
        Ok(pipeline.execute(Arc::new(request), ctx.fork()))
    }

    fn stream_pipeline<R: StreamRequest>(&self) -> anyhow::Result<Arc<StreamPipeline<R>>> {
        let type_id = TypeId::of::<R>();
        let wrapper = match self.inner.stream_wrappers.get(&type_id) {
            Some(entry) => entry.value().clone(),
            None => {
                let entry = self.inner.registry.stream_entry(type_id).ok_or_else(|| {
                    error!(
                        request_type = std::any::type_name::<R>(),
                        "no handler registered for stream request type"
                    );
                    RelayError::UnregisteredHandler {
                        request_type: std::any::type_name::<R>(),
                    }
                })?;
                let built = (entry.build)(&self.inner.registry, &self.inner.options);
                self.inner
                    .stream_wrappers
                    .entry(type_id)
                    .or_insert(built)
                    .value()
                    .clone()
            }
        };
        wrapper.downcast::<StreamPipeline<R>>().map_err(|_| {
            RelayError::ContractViolation {
                message: "wrapper cache entry does not match its stream request type".to_string(),
            }
            .into()
        })
    }

    // ────────────────────────────────────────────────────────────────────
    // introspection, services, validation
    // ────────────────────────────────────────────────────────────────────

    /// An erased dispatch missed the registry: distinguish "declared but
    /// unhandled" from "never a request at all".
    fn erased_miss(&self, type_id: TypeId, shape: RequestShape) -> anyhow::Error {
        let declared = self
            .inner
            .registry
            .declared()
            .iter()
            .find(|d| d.type_id == type_id && d.shape == shape);
        match declared {
            Some(declared) => RelayError::UnregisteredHandler {
                request_type: declared.type_name,
            }
            .into(),
            None => RelayError::ContractViolation {
                message: "value does not declare a response type".to_string(),
            }
            .into(),
        }
    }

    /// Whether a handler is installed for the request type.
    pub fn has_handler<R: Request>(&self) -> bool {
        self.inner.registry.has_request_handler(TypeId::of::<R>())
    }

    /// Whether a handler is installed for the stream request type.
    pub fn has_stream_handler<R: StreamRequest>(&self) -> bool {
        self.inner.registry.has_stream_handler(TypeId::of::<R>())
    }

    pub(crate) fn resolve_service<T: Send + Sync + 'static>(
        &self,
        scope: Option<&ScopeState>,
    ) -> Option<Arc<T>> {
        let service_scope = scope.map(|s| &s.services);
        self.inner
            .locator
            .resolve_erased(TypeId::of::<T>(), service_scope)?
            .downcast::<T>()
            .ok()
    }

    pub(crate) fn resolve_services<T: Send + Sync + 'static>(
        &self,
        scope: Option<&ScopeState>,
    ) -> Vec<Arc<T>> {
        let service_scope = scope.map(|s| &s.services);
        self.inner
            .locator
            .resolve_all_erased(TypeId::of::<T>(), service_scope)
            .into_iter()
            .filter_map(|any| any.downcast::<T>().ok())
            .collect()
    }

    /// Startup check: every request or stream request type the given
    /// modules declare must have a handler installed on this relay.
    ///
    /// Idempotent; accumulates all misses before failing with
    /// [`RelayError::InvalidConfiguration`].
    pub fn validate_registrations(&self, modules: &[&dyn RelayModule]) -> anyhow::Result<()> {
        let mut probe = RelayBuilder::new();
        for module in modules {
            module.register(&mut probe);
        }

        let mut missing = Vec::new();
        for declared in probe.registry.declared() {
            let present = match declared.shape {
                RequestShape::Request => {
                    self.inner.registry.has_request_handler(declared.type_id)
                }
                RequestShape::Stream => self.inner.registry.has_stream_handler(declared.type_id),
            };
            if !present {
                missing.push(declared.type_name.to_string());
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            error!(missing = ?missing, "registration validation failed");
            Err(RelayError::InvalidConfiguration { missing }.into())
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("request_handlers", &self.inner.registry.request_count())
            .field(
                "notification_handlers",
                &self.inner.registry.notification_handler_count(),
            )
            .field("cached_wrappers", &self.inner.request_wrappers.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Relay`].
///
/// Registration methods come in pairs: consuming `with_*` for fluent
/// construction and `add_*` (borrowing) for use inside [`RelayModule`]s.
/// Handler registration panics on a duplicate; use `try_with_handler` /
/// `try_add_handler` for the fallible form.
pub struct RelayBuilder {
    registry: Registry,
    options: RelayOptions,
    publisher: Option<Arc<dyn NotificationPublisher>>,
    provider: ServiceProvider,
    locator: Option<Arc<dyn ServiceLocator>>,
}

impl RelayBuilder {
    /// Create an empty builder with default options.
    pub fn new() -> Self {
        Self {
            registry: Registry::default(),
            options: RelayOptions::default(),
            publisher: None,
            provider: ServiceProvider::new(),
            locator: None,
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Request handlers
    // ────────────────────────────────────────────────────────────────────

    /// Install the handler for `R`, panicking when one is already present.
    pub fn add_handler<R, H>(&mut self, handler: H) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        if let Err(e) = self.try_add_handler::<R, H>(handler) {
            panic!("{e}");
        }
        self
    }

    /// Fallible form of [`RelayBuilder::add_handler`].
    pub fn try_add_handler<R, H>(&mut self, handler: H) -> Result<&mut Self, RelayError>
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let instance: Arc<dyn RequestHandler<R>> = Arc::new(handler);
        self.registry.add_request_handler::<R>(Box::new(move |_options| {
            ServiceSlot::from_instance(TypeId::of::<R>(), instance.clone())
        }))?;
        Ok(self)
    }

    /// Install a handler factory for `R`, honored per the configured
    /// lifetime (transient by default).
    pub fn add_handler_factory<R, H, F>(&mut self, factory: F) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Arc<dyn Fn() -> Arc<dyn RequestHandler<R>> + Send + Sync> =
            Arc::new(move || Arc::new(factory()));
        let result = self.registry.add_request_handler::<R>(Box::new(move |options| {
            ServiceSlot::from_factory(TypeId::of::<R>(), options.lifetime, factory.clone())
        }));
        if let Err(e) = result {
            panic!("{e}");
        }
        self
    }

    /// Consuming form of [`RelayBuilder::add_handler`].
    pub fn with_handler<R, H>(mut self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.add_handler::<R, H>(handler);
        self
    }

    /// Consuming form of [`RelayBuilder::try_add_handler`].
    pub fn try_with_handler<R, H>(mut self, handler: H) -> Result<Self, RelayError>
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.try_add_handler::<R, H>(handler)?;
        Ok(self)
    }

    /// Consuming form of [`RelayBuilder::add_handler_factory`].
    pub fn with_handler_factory<R, H, F>(mut self, factory: F) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.add_handler_factory::<R, H, F>(factory);
        self
    }

    // ────────────────────────────────────────────────────────────────────
    // Stream handlers
    // ────────────────────────────────────────────────────────────────────

    /// Install the stream handler for `R`, panicking on a duplicate.
    pub fn add_stream_handler<R, H>(&mut self, handler: H) -> &mut Self
    where
        R: StreamRequest,
        H: StreamHandler<R>,
    {
        if let Err(e) = self.try_add_stream_handler::<R, H>(handler) {
            panic!("{e}");
        }
        self
    }

    /// Fallible form of [`RelayBuilder::add_stream_handler`].
    pub fn try_add_stream_handler<R, H>(&mut self, handler: H) -> Result<&mut Self, RelayError>
    where
        R: StreamRequest,
        H: StreamHandler<R>,
    {
        let instance: Arc<dyn StreamHandler<R>> = Arc::new(handler);
        self.registry.add_stream_handler::<R>(Box::new(move |_options| {
            ServiceSlot::from_instance(TypeId::of::<R>(), instance.clone())
        }))?;
        Ok(self)
    }

    /// Consuming form of [`RelayBuilder::add_stream_handler`].
    pub fn with_stream_handler<R, H>(mut self, handler: H) -> Self
    where
        R: StreamRequest,
        H: StreamHandler<R>,
    {
        self.add_stream_handler::<R, H>(handler);
        self
    }

    // ────────────────────────────────────────────────────────────────────
    // Notification handlers
    // ────────────────────────────────────────────────────────────────────

    /// Append a notification handler for `N`; multiple handlers per type
    /// are delivered in registration order.
    pub fn add_notification_handler<N, H>(&mut self, handler: H) -> &mut Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        self.registry.add_notification_handler::<N, H>(handler);
        self
    }

    /// Consuming form of [`RelayBuilder::add_notification_handler`].
    pub fn with_notification_handler<N, H>(mut self, handler: H) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        self.add_notification_handler::<N, H>(handler);
        self
    }

    // ────────────────────────────────────────────────────────────────────
    // Stages
    // ────────────────────────────────────────────────────────────────────

    /// Register a behavior for one request type.
    pub fn add_behavior<R, B>(&mut self, behavior: B) -> &mut Self
    where
        R: Request,
        B: Behavior<R>,
    {
        self.registry.add_behavior::<R>(Arc::new(behavior));
        self
    }

    /// Consuming form of [`RelayBuilder::add_behavior`].
    pub fn with_behavior<R, B>(mut self, behavior: B) -> Self
    where
        R: Request,
        B: Behavior<R>,
    {
        self.add_behavior::<R, B>(behavior);
        self
    }

    /// Register a behavior applying to every request type.
    pub fn add_open_behavior<B: OpenBehavior>(&mut self, behavior: B) -> &mut Self {
        self.registry.add_open_behavior(Arc::new(behavior));
        self
    }

    /// Consuming form of [`RelayBuilder::add_open_behavior`].
    pub fn with_open_behavior<B: OpenBehavior>(mut self, behavior: B) -> Self {
        self.add_open_behavior(behavior);
        self
    }

    /// Register a pre-processor for one request type.
    pub fn add_pre_processor<R, P>(&mut self, stage: P) -> &mut Self
    where
        R: Request,
        P: PreProcessor<R>,
    {
        self.registry.add_pre_processor::<R>(Arc::new(stage));
        self
    }

    /// Consuming form of [`RelayBuilder::add_pre_processor`].
    pub fn with_pre_processor<R, P>(mut self, stage: P) -> Self
    where
        R: Request,
        P: PreProcessor<R>,
    {
        self.add_pre_processor::<R, P>(stage);
        self
    }

    /// Register a pre-processor applying to every request type.
    pub fn add_open_pre_processor<P: OpenPreProcessor>(&mut self, stage: P) -> &mut Self {
        self.registry.add_open_pre_processor(Arc::new(stage));
        self
    }

    /// Consuming form of [`RelayBuilder::add_open_pre_processor`].
    pub fn with_open_pre_processor<P: OpenPreProcessor>(mut self, stage: P) -> Self {
        self.add_open_pre_processor(stage);
        self
    }

    /// Register a post-processor for one request type.
    pub fn add_post_processor<R, P>(&mut self, stage: P) -> &mut Self
    where
        R: Request,
        P: PostProcessor<R>,
    {
        self.registry.add_post_processor::<R>(Arc::new(stage));
        self
    }

    /// Consuming form of [`RelayBuilder::add_post_processor`].
    pub fn with_post_processor<R, P>(mut self, stage: P) -> Self
    where
        R: Request,
        P: PostProcessor<R>,
    {
        self.add_post_processor::<R, P>(stage);
        self
    }

    /// Register a post-processor applying to every request type.
    pub fn add_open_post_processor<P: OpenPostProcessor>(&mut self, stage: P) -> &mut Self {
        self.registry.add_open_post_processor(Arc::new(stage));
        self
    }

    /// Consuming form of [`RelayBuilder::add_open_post_processor`].
    pub fn with_open_post_processor<P: OpenPostProcessor>(mut self, stage: P) -> Self {
        self.add_open_post_processor(stage);
        self
    }

    /// Register an exception handler for one request type.
    pub fn add_exception_handler<R, E>(&mut self, stage: E) -> &mut Self
    where
        R: Request,
        E: ExceptionHandler<R>,
    {
        self.registry
            .add_exception_handler::<R>(std::any::type_name::<E>(), Arc::new(stage));
        self
    }

    /// Consuming form of [`RelayBuilder::add_exception_handler`].
    pub fn with_exception_handler<R, E>(mut self, stage: E) -> Self
    where
        R: Request,
        E: ExceptionHandler<R>,
    {
        self.add_exception_handler::<R, E>(stage);
        self
    }

    /// Register an exception handler applying to every request type.
    pub fn add_open_exception_handler<E: OpenExceptionHandler>(&mut self, stage: E) -> &mut Self {
        self.registry
            .add_open_exception_handler(std::any::type_name::<E>(), Arc::new(stage));
        self
    }

    /// Consuming form of [`RelayBuilder::add_open_exception_handler`].
    pub fn with_open_exception_handler<E: OpenExceptionHandler>(mut self, stage: E) -> Self {
        self.add_open_exception_handler(stage);
        self
    }

    /// Register a stream behavior for one stream request type.
    pub fn add_stream_behavior<R, B>(&mut self, behavior: B) -> &mut Self
    where
        R: StreamRequest,
        B: StreamBehavior<R>,
    {
        self.registry.add_stream_behavior::<R>(Arc::new(behavior));
        self
    }

    /// Consuming form of [`RelayBuilder::add_stream_behavior`].
    pub fn with_stream_behavior<R, B>(mut self, behavior: B) -> Self
    where
        R: StreamRequest,
        B: StreamBehavior<R>,
    {
        self.add_stream_behavior::<R, B>(behavior);
        self
    }

    /// Register a stream behavior applying to every stream request type.
    pub fn add_open_stream_behavior<B: OpenStreamBehavior>(&mut self, behavior: B) -> &mut Self {
        self.registry.add_open_stream_behavior(Arc::new(behavior));
        self
    }

    /// Consuming form of [`RelayBuilder::add_open_stream_behavior`].
    pub fn with_open_stream_behavior<B: OpenStreamBehavior>(mut self, behavior: B) -> Self {
        self.add_open_stream_behavior(behavior);
        self
    }

    // ────────────────────────────────────────────────────────────────────
    // Declarations, modules, options, services
    // ────────────────────────────────────────────────────────────────────

    /// Declare a request type without installing a handler, so validation
    /// can flag the missing binding.
    pub fn declare_request<R: Request>(&mut self) -> &mut Self {
        self.registry.declare(
            TypeId::of::<R>(),
            std::any::type_name::<R>(),
            RequestShape::Request,
        );
        self
    }

    /// Declare a stream request type without installing a handler.
    pub fn declare_stream_request<R: StreamRequest>(&mut self) -> &mut Self {
        self.registry.declare(
            TypeId::of::<R>(),
            std::any::type_name::<R>(),
            RequestShape::Stream,
        );
        self
    }

    /// Apply a module's registrations.
    pub fn with_module(mut self, module: &dyn RelayModule) -> Self {
        module.register(&mut self);
        self
    }

    /// Replace the options record.
    pub fn with_options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    /// Override the notification publisher with a custom strategy.
    pub fn with_publisher<P: NotificationPublisher>(mut self, publisher: P) -> Self {
        self.publisher = Some(Arc::new(publisher));
        self
    }

    /// Register a shared service instance on the in-crate provider.
    pub fn with_service<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.provider.register_instance(value);
        self
    }

    /// Register a service factory on the in-crate provider.
    pub fn with_service_factory<T, F>(mut self, lifetime: crate::config::Lifetime, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.provider.register_factory(lifetime, factory);
        self
    }

    /// Use the host's own service locator instead of the in-crate provider.
    pub fn with_locator<L: ServiceLocator>(mut self, locator: L) -> Self {
        self.locator = Some(Arc::new(locator));
        self
    }

    /// Freeze the registrations and produce the relay.
    pub fn build(self) -> Relay {
        let publisher = self.publisher.unwrap_or_else(|| {
            match self.options.publish_strategy {
                PublishStrategy::Sequential => {
                    Arc::new(SequentialPublisher) as Arc<dyn NotificationPublisher>
                }
                PublishStrategy::Parallel => Arc::new(ParallelPublisher),
            }
        });
        let locator: Arc<dyn ServiceLocator> = match self.locator {
            Some(locator) => {
                if !self.provider.is_empty() {
                    warn!(
                        provider_registrations = self.provider.len(),
                        "custom locator installed; provider registrations are ignored"
                    );
                }
                locator
            }
            None => Arc::new(self.provider),
        };

        info!(
            request_handlers = self.registry.request_count(),
            notification_handlers = self.registry.notification_handler_count(),
            causality = self.options.causality_active(),
            "relay built"
        );

        Relay {
            inner: Arc::new(RelayInner {
                registry: self.registry,
                options: self.options,
                publisher,
                locator,
                request_wrappers: DashMap::new(),
                stream_wrappers: DashMap::new(),
                notification_wrappers: DashMap::new(),
            }),
        }
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RelayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuilder")
            .field("request_handlers", &self.registry.request_count())
            .finish_non_exhaustive()
    }
}
