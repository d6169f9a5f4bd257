//! Registration storage and pipeline assembly.
//!
//! The registry is populated by the builder, frozen at build time, and
//! consulted on every dispatch. Handler bindings are installed per request
//! `TypeId`; stage registrations keep one ordered list per stage kind, with
//! open and closed entries interleaved in registration order so a pipeline
//! build preserves exactly the order the host registered them in.
//!
//! Pipeline *assembly* is generic and happens at registration time: each
//! binding captures a monomorphized build closure, so the lazy wrapper cache
//! can construct the typed pipeline later without knowing the type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use tracing::debug;

use crate::causality::CausalityBehavior;
use crate::config::{Lifetime, RelayOptions};
use crate::core::{Notification, Request, StreamRequest};
use crate::dispatch::Relay;
use crate::error::RelayError;
use crate::handler::{DispatchContext, NotificationHandler, RequestHandler, StreamHandler};
use crate::pipeline::{
    Behavior, ExceptionHandler, OpenBehavior, OpenBehaviorAdapter, OpenExceptionHandler,
    OpenExceptionHandlerAdapter, OpenPostProcessor, OpenPostProcessorAdapter, OpenPreProcessor,
    OpenPreProcessorAdapter, PostProcessor, PreProcessor, RequestPipeline,
};
use crate::stream::{OpenStreamBehavior, OpenStreamBehaviorAdapter, StreamBehavior, StreamPipeline};

// =============================================================================
// Handler slots
// =============================================================================

/// A handler binding with its resolution lifetime.
///
/// Resolution happens per dispatch: transient slots call the factory every
/// time, singleton slots memoize the first instance, scoped slots cache per
/// scope (falling back to transient outside one).
pub(crate) struct ServiceSlot<T: ?Sized + Send + Sync + 'static> {
    key: TypeId,
    lifetime: Lifetime,
    factory: Arc<dyn Fn() -> Arc<T> + Send + Sync>,
    singleton: OnceLock<Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> ServiceSlot<T> {
    /// A pre-built shared instance; lifetime is effectively singleton.
    pub(crate) fn from_instance(key: TypeId, instance: Arc<T>) -> Self {
        Self {
            key,
            lifetime: Lifetime::Singleton,
            factory: Arc::new(move || instance.clone()),
            singleton: OnceLock::new(),
        }
    }

    /// A factory honored per the configured lifetime.
    pub(crate) fn from_factory(
        key: TypeId,
        lifetime: Lifetime,
        factory: Arc<dyn Fn() -> Arc<T> + Send + Sync>,
    ) -> Self {
        Self {
            key,
            lifetime,
            factory,
            singleton: OnceLock::new(),
        }
    }

    pub(crate) fn resolve(&self, ctx: &DispatchContext) -> Arc<T> {
        match self.lifetime {
            Lifetime::Singleton => self.singleton.get_or_init(|| (self.factory)()).clone(),
            Lifetime::Transient => (self.factory)(),
            Lifetime::Scoped => match ctx.scope() {
                Some(scope) => scope.cached_handler(self.key, || (self.factory)()),
                None => (self.factory)(),
            },
        }
    }
}

pub(crate) type HandlerSlot<R> = ServiceSlot<dyn RequestHandler<R>>;
pub(crate) type StreamHandlerSlot<R> = ServiceSlot<dyn StreamHandler<R>>;

/// Deferred slot construction: the configured lifetime is read when the
/// pipeline wrapper is first built, so builder ordering of options vs.
/// registrations does not matter.
pub(crate) type MakeHandlerSlot<R> =
    Box<dyn Fn(&RelayOptions) -> HandlerSlot<R> + Send + Sync>;
pub(crate) type MakeStreamHandlerSlot<R> =
    Box<dyn Fn(&RelayOptions) -> StreamHandlerSlot<R> + Send + Sync>;

// =============================================================================
// Entries and stage registrations
// =============================================================================

pub(crate) type BuildPipelineFn =
    Box<dyn Fn(&Registry, &RelayOptions) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

pub(crate) type ErasedSendFn = Box<
    dyn Fn(
            Relay,
            Box<dyn Any + Send + Sync>,
            DispatchContext,
        ) -> BoxFuture<'static, anyhow::Result<Box<dyn Any + Send>>>
        + Send
        + Sync,
>;

pub(crate) type ErasedStreamFn = Box<
    dyn Fn(
            Relay,
            Box<dyn Any + Send + Sync>,
            DispatchContext,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Box<dyn Any + Send>>>>
        + Send
        + Sync,
>;

pub(crate) struct RequestEntry {
    pub(crate) type_name: &'static str,
    pub(crate) build: BuildPipelineFn,
    pub(crate) erased: ErasedSendFn,
}

pub(crate) struct StreamEntry {
    pub(crate) type_name: &'static str,
    pub(crate) build: BuildPipelineFn,
    pub(crate) erased: ErasedStreamFn,
}

pub(crate) struct NotificationEntry {
    handlers: Vec<(&'static str, Arc<dyn Any + Send + Sync>)>,
}

enum StageRegistration<O: ?Sized> {
    Open(Arc<O>),
    Closed {
        request: TypeId,
        stage: Arc<dyn Any + Send + Sync>,
    },
}

/// Which shape a declared type dispatches as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestShape {
    Request,
    Stream,
}

pub(crate) struct DeclaredRequest {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) shape: RequestShape,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
pub(crate) struct Registry {
    requests: HashMap<TypeId, RequestEntry>,
    streams: HashMap<TypeId, StreamEntry>,
    notifications: HashMap<TypeId, NotificationEntry>,
    behaviors: Vec<StageRegistration<dyn OpenBehavior>>,
    pre_processors: Vec<StageRegistration<dyn OpenPreProcessor>>,
    post_processors: Vec<StageRegistration<dyn OpenPostProcessor>>,
    exception_handlers: Vec<(&'static str, StageRegistration<dyn OpenExceptionHandler>)>,
    stream_behaviors: Vec<StageRegistration<dyn OpenStreamBehavior>>,
    declared: Vec<DeclaredRequest>,
}

impl Registry {
    // ────────────────────────────────────────────────────────────────────
    // Handler bindings
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn add_request_handler<R: Request>(
        &mut self,
        make_slot: MakeHandlerSlot<R>,
    ) -> Result<(), RelayError> {
        let type_id = TypeId::of::<R>();
        let type_name = std::any::type_name::<R>();
        if self.requests.contains_key(&type_id) {
            return Err(RelayError::HandlerAlreadyRegistered {
                request_type: type_name,
            });
        }

        let build: BuildPipelineFn = Box::new(move |registry, options| {
            let slot = Arc::new(make_slot(options));
            Arc::new(registry.build_request_pipeline::<R>(slot, options))
                as Arc<dyn Any + Send + Sync>
        });
        let erased: ErasedSendFn = Box::new(|relay, boxed, ctx| {
            Box::pin(async move {
                let request = boxed.downcast::<R>().map_err(|_| {
                    RelayError::ContractViolation {
                        message: "erased request does not match its registered type".to_string(),
                    }
                })?;
                let response = relay.dispatch_request::<R>(*request, &ctx).await?;
                Ok(Box::new(response) as Box<dyn Any + Send>)
            })
        });

        debug!(request_type = type_name, "request handler registered");
        self.requests.insert(
            type_id,
            RequestEntry {
                type_name,
                build,
                erased,
            },
        );
        self.declare(type_id, type_name, RequestShape::Request);
        Ok(())
    }

    pub(crate) fn add_stream_handler<R: StreamRequest>(
        &mut self,
        make_slot: MakeStreamHandlerSlot<R>,
    ) -> Result<(), RelayError> {
        let type_id = TypeId::of::<R>();
        let type_name = std::any::type_name::<R>();
        if self.streams.contains_key(&type_id) {
            return Err(RelayError::HandlerAlreadyRegistered {
                request_type: type_name,
            });
        }

        let build: BuildPipelineFn = Box::new(move |registry, options| {
            let slot = Arc::new(make_slot(options));
            Arc::new(registry.build_stream_pipeline::<R>(slot)) as Arc<dyn Any + Send + Sync>
        });
        let erased: ErasedStreamFn = Box::new(|relay, boxed, ctx| {
            let request = boxed.downcast::<R>().map_err(|_| {
                RelayError::ContractViolation {
                    message: "erased stream request does not match its registered type"
                        .to_string(),
                }
            })?;
            let stream = relay.dispatch_stream::<R>(*request, &ctx)?;
            Ok(stream
                .map(|item| item.map(|value| Box::new(value) as Box<dyn Any + Send>))
                .boxed())
        });

        debug!(request_type = type_name, "stream handler registered");
        self.streams.insert(
            type_id,
            StreamEntry {
                type_name,
                build,
                erased,
            },
        );
        self.declare(type_id, type_name, RequestShape::Stream);
        Ok(())
    }

    pub(crate) fn add_notification_handler<N, H>(&mut self, handler: H)
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let entry = self
            .notifications
            .entry(TypeId::of::<N>())
            .or_insert_with(|| NotificationEntry {
                handlers: Vec::new(),
            });
        let handler: Arc<dyn NotificationHandler<N>> = Arc::new(handler);
        entry
            .handlers
            .push((std::any::type_name::<H>(), Arc::new(handler)));
    }

    /// Handlers for the exact runtime type, in registration order.
    pub(crate) fn notification_handlers<N: Notification>(
        &self,
    ) -> Vec<(&'static str, Arc<dyn NotificationHandler<N>>)> {
        match self.notifications.get(&TypeId::of::<N>()) {
            Some(entry) => entry
                .handlers
                .iter()
                .filter_map(|(name, any)| {
                    any.downcast_ref::<Arc<dyn NotificationHandler<N>>>()
                        .map(|h| (*name, h.clone()))
                })
                .collect(),
            None => Vec::new(),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Stage registrations
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn add_behavior<R: Request>(&mut self, behavior: Arc<dyn Behavior<R>>) {
        self.behaviors.push(StageRegistration::Closed {
            request: TypeId::of::<R>(),
            stage: Arc::new(behavior),
        });
    }

    pub(crate) fn add_open_behavior(&mut self, behavior: Arc<dyn OpenBehavior>) {
        self.behaviors.push(StageRegistration::Open(behavior));
    }

    pub(crate) fn add_pre_processor<R: Request>(&mut self, stage: Arc<dyn PreProcessor<R>>) {
        self.pre_processors.push(StageRegistration::Closed {
            request: TypeId::of::<R>(),
            stage: Arc::new(stage),
        });
    }

    pub(crate) fn add_open_pre_processor(&mut self, stage: Arc<dyn OpenPreProcessor>) {
        self.pre_processors.push(StageRegistration::Open(stage));
    }

    pub(crate) fn add_post_processor<R: Request>(&mut self, stage: Arc<dyn PostProcessor<R>>) {
        self.post_processors.push(StageRegistration::Closed {
            request: TypeId::of::<R>(),
            stage: Arc::new(stage),
        });
    }

    pub(crate) fn add_open_post_processor(&mut self, stage: Arc<dyn OpenPostProcessor>) {
        self.post_processors.push(StageRegistration::Open(stage));
    }

    pub(crate) fn add_exception_handler<R: Request>(
        &mut self,
        name: &'static str,
        stage: Arc<dyn ExceptionHandler<R>>,
    ) {
        self.exception_handlers.push((
            name,
            StageRegistration::Closed {
                request: TypeId::of::<R>(),
                stage: Arc::new(stage),
            },
        ));
    }

    pub(crate) fn add_open_exception_handler(
        &mut self,
        name: &'static str,
        stage: Arc<dyn OpenExceptionHandler>,
    ) {
        self.exception_handlers
            .push((name, StageRegistration::Open(stage)));
    }

    pub(crate) fn add_stream_behavior<R: StreamRequest>(
        &mut self,
        behavior: Arc<dyn StreamBehavior<R>>,
    ) {
        self.stream_behaviors.push(StageRegistration::Closed {
            request: TypeId::of::<R>(),
            stage: Arc::new(behavior),
        });
    }

    pub(crate) fn add_open_stream_behavior(&mut self, behavior: Arc<dyn OpenStreamBehavior>) {
        self.stream_behaviors.push(StageRegistration::Open(behavior));
    }

    // ────────────────────────────────────────────────────────────────────
    // Declarations and lookups
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn declare(
        &mut self,
        type_id: TypeId,
        type_name: &'static str,
        shape: RequestShape,
    ) {
        let already = self
            .declared
            .iter()
            .any(|d| d.type_id == type_id && d.shape == shape);
        if !already {
            self.declared.push(DeclaredRequest {
                type_id,
                type_name,
                shape,
            });
        }
    }

    pub(crate) fn declared(&self) -> &[DeclaredRequest] {
        &self.declared
    }

    pub(crate) fn request_entry(&self, type_id: TypeId) -> Option<&RequestEntry> {
        self.requests.get(&type_id)
    }

    pub(crate) fn stream_entry(&self, type_id: TypeId) -> Option<&StreamEntry> {
        self.streams.get(&type_id)
    }

    pub(crate) fn has_request_handler(&self, type_id: TypeId) -> bool {
        self.requests.contains_key(&type_id)
    }

    pub(crate) fn has_stream_handler(&self, type_id: TypeId) -> bool {
        self.streams.contains_key(&type_id)
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn notification_handler_count(&self) -> usize {
        self.notifications.values().map(|e| e.handlers.len()).sum()
    }

    // ────────────────────────────────────────────────────────────────────
    // Pipeline assembly
    // ────────────────────────────────────────────────────────────────────

    fn build_request_pipeline<R: Request>(
        &self,
        handler: Arc<HandlerSlot<R>>,
        options: &RelayOptions,
    ) -> RequestPipeline<R> {
        let type_id = TypeId::of::<R>();

        let mut behaviors: Vec<Arc<dyn Behavior<R>>> = Vec::new();
        // The implicit causality stage brackets all user behaviors.
        if options.causality_active() {
            behaviors.push(Arc::new(OpenBehaviorAdapter::new(Arc::new(
                CausalityBehavior,
            ))));
        }
        for registration in &self.behaviors {
            match registration {
                StageRegistration::Open(open) => {
                    behaviors.push(Arc::new(OpenBehaviorAdapter::new(open.clone())));
                }
                StageRegistration::Closed { request, stage } if *request == type_id => {
                    if let Some(b) = stage.downcast_ref::<Arc<dyn Behavior<R>>>() {
                        behaviors.push(b.clone());
                    }
                }
                _ => {}
            }
        }

        let mut pre_processors: Vec<Arc<dyn PreProcessor<R>>> = Vec::new();
        for registration in &self.pre_processors {
            match registration {
                StageRegistration::Open(open) => {
                    pre_processors.push(Arc::new(OpenPreProcessorAdapter::new(open.clone())));
                }
                StageRegistration::Closed { request, stage } if *request == type_id => {
                    if let Some(p) = stage.downcast_ref::<Arc<dyn PreProcessor<R>>>() {
                        pre_processors.push(p.clone());
                    }
                }
                _ => {}
            }
        }

        let mut post_processors: Vec<Arc<dyn PostProcessor<R>>> = Vec::new();
        for registration in &self.post_processors {
            match registration {
                StageRegistration::Open(open) => {
                    post_processors.push(Arc::new(OpenPostProcessorAdapter::new(open.clone())));
                }
                StageRegistration::Closed { request, stage } if *request == type_id => {
                    if let Some(p) = stage.downcast_ref::<Arc<dyn PostProcessor<R>>>() {
                        post_processors.push(p.clone());
                    }
                }
                _ => {}
            }
        }

        let mut exception_handlers: Vec<(&'static str, Arc<dyn ExceptionHandler<R>>)> = Vec::new();
        for (name, registration) in &self.exception_handlers {
            match registration {
                StageRegistration::Open(open) => {
                    exception_handlers.push((
                        *name,
                        Arc::new(OpenExceptionHandlerAdapter::new(open.clone())),
                    ));
                }
                StageRegistration::Closed { request, stage } if *request == type_id => {
                    if let Some(h) = stage.downcast_ref::<Arc<dyn ExceptionHandler<R>>>() {
                        exception_handlers.push((*name, h.clone()));
                    }
                }
                _ => {}
            }
        }

        debug!(
            request_type = std::any::type_name::<R>(),
            behaviors = behaviors.len(),
            pre_processors = pre_processors.len(),
            post_processors = post_processors.len(),
            exception_handlers = exception_handlers.len(),
            "request pipeline built"
        );

        RequestPipeline {
            type_name: std::any::type_name::<R>(),
            handler,
            behaviors,
            pre_processors,
            post_processors,
            exception_handlers,
        }
    }

    fn build_stream_pipeline<R: StreamRequest>(
        &self,
        handler: Arc<StreamHandlerSlot<R>>,
    ) -> StreamPipeline<R> {
        let type_id = TypeId::of::<R>();

        let mut behaviors: Vec<Arc<dyn StreamBehavior<R>>> = Vec::new();
        for registration in &self.stream_behaviors {
            match registration {
                StageRegistration::Open(open) => {
                    behaviors.push(Arc::new(OpenStreamBehaviorAdapter::new(open.clone())));
                }
                StageRegistration::Closed { request, stage } if *request == type_id => {
                    if let Some(b) = stage.downcast_ref::<Arc<dyn StreamBehavior<R>>>() {
                        behaviors.push(b.clone());
                    }
                }
                _ => {}
            }
        }

        StreamPipeline { handler, behaviors }
    }
}
