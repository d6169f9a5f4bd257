//! The request/response pipeline: stages, composition, and execution.
//!
//! # Stage nesting
//!
//! For one send, the layers run outermost to innermost:
//!
//! ```text
//! exception handlers
//!   └─ pre-processors (registration order)
//!        └─ post-processor layer (runs next, then each post-processor)
//!             └─ behaviors (first registered = outermost)
//!                  └─ handler
//! ```
//!
//! With pre-processor `P`, behavior `B`, post-processor `Q` and handler `H`
//! the observation sequence is `P → B.before → H → B.after → Q`.
//!
//! Behaviors own the request on the way down, which is what lets them
//! transform it (or drop it to short-circuit). Post-processors receive the
//! *original* request — the value as it was before any behavior touched it —
//! together with the response, and can modify neither.
//!
//! # Open stages
//!
//! A *closed* stage is typed over one request type. An *open* stage applies
//! to every request type: it sees the request through [`RequestMeta`] (type
//! name plus `Any` view) and the response as a boxed `Any`. Open stages are
//! adapted into each typed pipeline when the pipeline wrapper for that
//! request type is first built, preserving the interleaved registration
//! order of open and closed stages.

use std::any::Any;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

use crate::core::Request;
use crate::error::RelayError;
use crate::handler::DispatchContext;
use crate::registry::HandlerSlot;

// =============================================================================
// Closed (typed) stage traits
// =============================================================================

/// A stage that wraps `next` with arbitrary logic.
///
/// Behaviors control whether, when, and how `next` runs: dropping `next`
/// without running it short-circuits the pipeline, and the returned response
/// may be transformed freely. The first registered behavior executes
/// outermost.
#[async_trait]
pub trait Behavior<R: Request>: Send + Sync + 'static {
    /// Wrap the rest of the pipeline.
    async fn handle(
        &self,
        request: R,
        ctx: &DispatchContext,
        next: Next<'_, R>,
    ) -> anyhow::Result<R::Response>;
}

/// Fire-and-forget stage that runs before the handler. Cannot short-circuit.
#[async_trait]
pub trait PreProcessor<R: Request>: Send + Sync + 'static {
    /// Observe the request before any behavior or the handler runs.
    async fn process(&self, request: &R, ctx: &DispatchContext) -> anyhow::Result<()>;
}

/// Stage that runs after the handler with the request and the response.
/// Cannot modify the response.
#[async_trait]
pub trait PostProcessor<R: Request>: Send + Sync + 'static {
    /// Observe the request/response pair.
    async fn process(
        &self,
        request: &R,
        response: &R::Response,
        ctx: &DispatchContext,
    ) -> anyhow::Result<()>;
}

/// Stage invoked only when an inner stage or the handler failed.
///
/// Handlers run in registration order; the first to mark the state as
/// handled supplies the recovery response and stops the iteration. If none
/// does, the original error is re-raised unchanged.
#[async_trait]
pub trait ExceptionHandler<R: Request>: Send + Sync + 'static {
    /// Inspect the failure and optionally recover.
    async fn handle(
        &self,
        request: &R,
        error: &anyhow::Error,
        state: &mut ExceptionState<R::Response>,
        ctx: &DispatchContext,
    ) -> anyhow::Result<()>;
}

/// Mutable recovery state passed through the exception handler chain.
pub struct ExceptionState<T> {
    response: Option<T>,
}

impl<T> ExceptionState<T> {
    pub(crate) fn new() -> Self {
        Self { response: None }
    }

    /// Mark the error as handled, supplying the substitute response.
    pub fn set_handled(&mut self, response: T) {
        self.response = Some(response);
    }

    /// Whether a previous handler already recovered.
    pub fn is_handled(&self) -> bool {
        self.response.is_some()
    }

    pub(crate) fn take(&mut self) -> Option<T> {
        self.response.take()
    }
}

/// Continuation handed to a behavior.
///
/// Running it executes the remaining behaviors and the terminal handler;
/// dropping it without running short-circuits the pipeline.
pub struct Next<'a, R: Request> {
    behaviors: &'a [Arc<dyn Behavior<R>>],
    pipeline: &'a RequestPipeline<R>,
}

impl<'a, R: Request> Next<'a, R> {
    /// Run the rest of the pipeline with the given (possibly transformed)
    /// request.
    pub async fn run(self, request: R, ctx: &DispatchContext) -> anyhow::Result<R::Response> {
        match self.behaviors.split_first() {
            Some((head, rest)) => {
                head.handle(
                    request,
                    ctx,
                    Next {
                        behaviors: rest,
                        pipeline: self.pipeline,
                    },
                )
                .await
            }
            None => self.pipeline.invoke_terminal(request, ctx).await,
        }
    }
}

// =============================================================================
// Open (any-request) stage traits
// =============================================================================

/// Type-erased view of a request, handed to open stages.
pub struct RequestMeta<'a> {
    type_name: &'static str,
    request: &'a (dyn Any + Send + Sync),
}

impl<'a> RequestMeta<'a> {
    pub(crate) fn new<T: Any + Send + Sync>(request: &'a T, type_name: &'static str) -> Self {
        Self { type_name, request }
    }

    /// The request's concrete type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Try to view the request as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.request.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for RequestMeta<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMeta")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Continuation handed to an open behavior. The response comes back boxed.
pub struct OpenNext<'a> {
    future: BoxFuture<'a, anyhow::Result<Box<dyn Any + Send>>>,
}

impl<'a> OpenNext<'a> {
    pub(crate) fn new(future: BoxFuture<'a, anyhow::Result<Box<dyn Any + Send>>>) -> Self {
        Self { future }
    }

    /// Run the rest of the pipeline.
    pub async fn run(self) -> anyhow::Result<Box<dyn Any + Send>> {
        self.future.await
    }
}

/// A behavior applicable to every request type.
///
/// An open behavior may pass the boxed response through untouched or
/// substitute another box; substituting a value of the wrong concrete type
/// fails the dispatch with a contract violation.
#[async_trait]
pub trait OpenBehavior: Send + Sync + 'static {
    /// Wrap the rest of the pipeline.
    async fn handle(
        &self,
        request: RequestMeta<'_>,
        ctx: &DispatchContext,
        next: OpenNext<'_>,
    ) -> anyhow::Result<Box<dyn Any + Send>>;
}

/// A pre-processor applicable to every request type.
#[async_trait]
pub trait OpenPreProcessor: Send + Sync + 'static {
    /// Observe the request before the handler runs.
    async fn process(&self, request: RequestMeta<'_>, ctx: &DispatchContext)
        -> anyhow::Result<()>;
}

/// A post-processor applicable to every request type.
#[async_trait]
pub trait OpenPostProcessor: Send + Sync + 'static {
    /// Observe the request and the (erased) response.
    async fn process(
        &self,
        request: RequestMeta<'_>,
        response: &(dyn Any + Send),
        ctx: &DispatchContext,
    ) -> anyhow::Result<()>;
}

/// Recovery state for open exception handlers; the substitute response is
/// boxed and checked against the pipeline's response type afterwards.
pub struct OpenExceptionState {
    response: Option<Box<dyn Any + Send>>,
}

impl OpenExceptionState {
    fn new() -> Self {
        Self { response: None }
    }

    /// Mark the error as handled with a boxed substitute response.
    pub fn set_handled(&mut self, response: Box<dyn Any + Send>) {
        self.response = Some(response);
    }

    /// Whether a previous handler already recovered.
    pub fn is_handled(&self) -> bool {
        self.response.is_some()
    }
}

/// An exception handler applicable to every request type.
#[async_trait]
pub trait OpenExceptionHandler: Send + Sync + 'static {
    /// Inspect the failure and optionally recover.
    async fn handle(
        &self,
        request: RequestMeta<'_>,
        error: &anyhow::Error,
        state: &mut OpenExceptionState,
        ctx: &DispatchContext,
    ) -> anyhow::Result<()>;
}

// =============================================================================
// Open → closed adapters
// =============================================================================

pub(crate) struct OpenBehaviorAdapter {
    inner: Arc<dyn OpenBehavior>,
}

impl OpenBehaviorAdapter {
    pub(crate) fn new(inner: Arc<dyn OpenBehavior>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for OpenBehaviorAdapter {
    async fn handle(
        &self,
        request: R,
        ctx: &DispatchContext,
        next: Next<'_, R>,
    ) -> anyhow::Result<R::Response> {
        // The open stage views a copy while the owned value travels on.
        let view = request.clone();
        let future = next.run(request, ctx);
        let erased = OpenNext::new(Box::pin(async move {
            future
                .await
                .map(|response| Box::new(response) as Box<dyn Any + Send>)
        }));
        let meta = RequestMeta::new(&view, std::any::type_name::<R>());
        let boxed = self.inner.handle(meta, ctx, erased).await?;
        match boxed.downcast::<R::Response>() {
            Ok(response) => Ok(*response),
            Err(_) => {
                Err(RelayError::bad_substitution(std::any::type_name::<R::Response>()).into())
            }
        }
    }
}

pub(crate) struct OpenPreProcessorAdapter {
    inner: Arc<dyn OpenPreProcessor>,
}

impl OpenPreProcessorAdapter {
    pub(crate) fn new(inner: Arc<dyn OpenPreProcessor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: Request> PreProcessor<R> for OpenPreProcessorAdapter {
    async fn process(&self, request: &R, ctx: &DispatchContext) -> anyhow::Result<()> {
        let meta = RequestMeta::new(request, std::any::type_name::<R>());
        self.inner.process(meta, ctx).await
    }
}

pub(crate) struct OpenPostProcessorAdapter {
    inner: Arc<dyn OpenPostProcessor>,
}

impl OpenPostProcessorAdapter {
    pub(crate) fn new(inner: Arc<dyn OpenPostProcessor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: Request> PostProcessor<R> for OpenPostProcessorAdapter {
    async fn process(
        &self,
        request: &R,
        response: &R::Response,
        ctx: &DispatchContext,
    ) -> anyhow::Result<()> {
        let meta = RequestMeta::new(request, std::any::type_name::<R>());
        self.inner.process(meta, response as &(dyn Any + Send), ctx).await
    }
}

pub(crate) struct OpenExceptionHandlerAdapter {
    inner: Arc<dyn OpenExceptionHandler>,
}

impl OpenExceptionHandlerAdapter {
    pub(crate) fn new(inner: Arc<dyn OpenExceptionHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: Request> ExceptionHandler<R> for OpenExceptionHandlerAdapter {
    async fn handle(
        &self,
        request: &R,
        error: &anyhow::Error,
        state: &mut ExceptionState<R::Response>,
        ctx: &DispatchContext,
    ) -> anyhow::Result<()> {
        let meta = RequestMeta::new(request, std::any::type_name::<R>());
        let mut open_state = OpenExceptionState::new();
        self.inner.handle(meta, error, &mut open_state, ctx).await?;
        if let Some(boxed) = open_state.response {
            match boxed.downcast::<R::Response>() {
                Ok(response) => state.set_handled(*response),
                Err(_) => {
                    return Err(RelayError::bad_substitution(std::any::type_name::<R::Response>())
                        .into())
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Composed pipeline
// =============================================================================

/// The compiled pipeline for one request type.
///
/// Built once on the first dispatch of the type and cached for the process
/// lifetime; contents are immutable after construction.
pub(crate) struct RequestPipeline<R: Request> {
    pub(crate) type_name: &'static str,
    pub(crate) handler: Arc<HandlerSlot<R>>,
    pub(crate) behaviors: Vec<Arc<dyn Behavior<R>>>,
    pub(crate) pre_processors: Vec<Arc<dyn PreProcessor<R>>>,
    pub(crate) post_processors: Vec<Arc<dyn PostProcessor<R>>>,
    pub(crate) exception_handlers: Vec<(&'static str, Arc<dyn ExceptionHandler<R>>)>,
}

impl<R: Request> RequestPipeline<R> {
    pub(crate) async fn execute(
        &self,
        request: R,
        ctx: &DispatchContext,
    ) -> anyhow::Result<R::Response> {
        let retained = (!self.exception_handlers.is_empty()).then(|| request.clone());
        match self.run_stages(request, ctx).await {
            Ok(response) => Ok(response),
            Err(error) => self.recover(retained, error, ctx).await,
        }
    }

    async fn run_stages(&self, request: R, ctx: &DispatchContext) -> anyhow::Result<R::Response> {
        ctx.ensure_not_cancelled()?;

        for pre in &self.pre_processors {
            pre.process(&request, ctx).await?;
        }

        // Post-processors see the request as it was before behaviors ran.
        let original = (!self.post_processors.is_empty()).then(|| request.clone());

        let response = Next {
            behaviors: &self.behaviors,
            pipeline: self,
        }
        .run(request, ctx)
        .await?;

        if let Some(original) = &original {
            for post in &self.post_processors {
                post.process(original, &response, ctx).await?;
            }
        }
        Ok(response)
    }

    async fn invoke_terminal(&self, request: R, ctx: &DispatchContext) -> anyhow::Result<R::Response> {
        let handler = self.handler.resolve(ctx);
        handler.handle(&request, ctx).await
    }

    async fn recover(
        &self,
        request: Option<R>,
        error: anyhow::Error,
        ctx: &DispatchContext,
    ) -> anyhow::Result<R::Response> {
        let Some(request) = request else {
            return Err(error);
        };
        let mut state = ExceptionState::new();
        for (name, handler) in &self.exception_handlers {
            handler.handle(&request, &error, &mut state, ctx).await?;
            if let Some(response) = state.take() {
                warn!(
                    request_type = self.type_name,
                    exception_handler = *name,
                    error = %error,
                    "error recovered by exception handler"
                );
                return Ok(response);
            }
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RelayBuilder;
    use crate::handler::RequestHandler;
    use crate::testing::ObservationLog;

    #[derive(Debug, Clone)]
    struct GetValue {
        input: i64,
    }

    impl Request for GetValue {
        type Response = i64;
    }

    struct ValueHandler;

    #[async_trait]
    impl RequestHandler<GetValue> for ValueHandler {
        async fn handle(&self, request: &GetValue, _ctx: &DispatchContext) -> anyhow::Result<i64> {
            Ok(request.input)
        }
    }

    struct Recording {
        log: ObservationLog,
        label: &'static str,
    }

    #[async_trait]
    impl Behavior<GetValue> for Recording {
        async fn handle(
            &self,
            request: GetValue,
            ctx: &DispatchContext,
            next: Next<'_, GetValue>,
        ) -> anyhow::Result<i64> {
            self.log.push(format!("{}.before", self.label));
            let response = next.run(request, ctx).await?;
            self.log.push(format!("{}.after", self.label));
            Ok(response)
        }
    }

    struct RecordingPre {
        log: ObservationLog,
    }

    #[async_trait]
    impl PreProcessor<GetValue> for RecordingPre {
        async fn process(&self, _request: &GetValue, _ctx: &DispatchContext) -> anyhow::Result<()> {
            self.log.push("pre");
            Ok(())
        }
    }

    struct RecordingPost {
        log: ObservationLog,
    }

    #[async_trait]
    impl PostProcessor<GetValue> for RecordingPost {
        async fn process(
            &self,
            _request: &GetValue,
            response: &i64,
            _ctx: &DispatchContext,
        ) -> anyhow::Result<()> {
            self.log.push(format!("post({response})"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_fidelity_with_no_stages() {
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .build();
        assert_eq!(relay.send(GetValue { input: 5 }).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_stage_ordering() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_pre_processor::<GetValue, _>(RecordingPre { log: log.clone() })
            .with_behavior::<GetValue, _>(Recording {
                log: log.clone(),
                label: "B",
            })
            .with_post_processor::<GetValue, _>(RecordingPost { log: log.clone() })
            .build();

        relay.send(GetValue { input: 1 }).await.unwrap();

        assert_eq!(
            log.entries(),
            vec!["pre", "B.before", "B.after", "post(1)"]
        );
    }

    #[tokio::test]
    async fn test_first_registered_behavior_is_outermost() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_behavior::<GetValue, _>(Recording {
                log: log.clone(),
                label: "B1",
            })
            .with_behavior::<GetValue, _>(Recording {
                log: log.clone(),
                label: "B2",
            })
            .build();

        relay.send(GetValue { input: 1 }).await.unwrap();

        assert_eq!(
            log.entries(),
            vec!["B1.before", "B2.before", "B2.after", "B1.after"]
        );
    }

    struct ShortCircuit;

    #[async_trait]
    impl Behavior<GetValue> for ShortCircuit {
        async fn handle(
            &self,
            _request: GetValue,
            _ctx: &DispatchContext,
            _next: Next<'_, GetValue>,
        ) -> anyhow::Result<i64> {
            Ok(-1)
        }
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_behavior::<GetValue, _>(ShortCircuit)
            .with_behavior::<GetValue, _>(Recording {
                log: log.clone(),
                label: "inner",
            })
            .build();

        let response = relay.send(GetValue { input: 5 }).await.unwrap();
        assert_eq!(response, -1);
        // The inner behavior (and the handler) never ran.
        assert!(log.entries().is_empty());
    }

    struct AddTen;

    #[async_trait]
    impl Behavior<GetValue> for AddTen {
        async fn handle(
            &self,
            mut request: GetValue,
            ctx: &DispatchContext,
            next: Next<'_, GetValue>,
        ) -> anyhow::Result<i64> {
            request.input += 10;
            next.run(request, ctx).await
        }
    }

    #[tokio::test]
    async fn test_behavior_transforms_request_but_post_sees_original() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_behavior::<GetValue, _>(AddTen)
            .with_post_processor::<GetValue, _>(RecordingPost { log: log.clone() })
            .build();

        let response = relay.send(GetValue { input: 5 }).await.unwrap();
        assert_eq!(response, 15);
        // Post-processor observed the transformed response...
        assert_eq!(log.entries(), vec!["post(15)"]);
    }

    struct FailingHandler;

    #[async_trait]
    impl RequestHandler<GetValue> for FailingHandler {
        async fn handle(&self, _request: &GetValue, _ctx: &DispatchContext) -> anyhow::Result<i64> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct Recover {
        with: i64,
    }

    #[async_trait]
    impl ExceptionHandler<GetValue> for Recover {
        async fn handle(
            &self,
            _request: &GetValue,
            _error: &anyhow::Error,
            state: &mut ExceptionState<i64>,
            _ctx: &DispatchContext,
        ) -> anyhow::Result<()> {
            state.set_handled(self.with);
            Ok(())
        }
    }

    struct NeverRecovers {
        log: ObservationLog,
    }

    #[async_trait]
    impl ExceptionHandler<GetValue> for NeverRecovers {
        async fn handle(
            &self,
            _request: &GetValue,
            _error: &anyhow::Error,
            _state: &mut ExceptionState<i64>,
            _ctx: &DispatchContext,
        ) -> anyhow::Result<()> {
            self.log.push("consulted");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exception_recovery_first_handled_wins() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(FailingHandler)
            .with_exception_handler::<GetValue, _>(Recover { with: 99 })
            .with_exception_handler::<GetValue, _>(NeverRecovers { log: log.clone() })
            .build();

        let response = relay.send(GetValue { input: 1 }).await.unwrap();
        assert_eq!(response, 99);
        // Iteration stopped at the first handler that recovered.
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_error_reraised_when_no_handler_recovers() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(FailingHandler)
            .with_exception_handler::<GetValue, _>(NeverRecovers { log: log.clone() })
            .build();

        let err = relay.send(GetValue { input: 1 }).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(log.entries(), vec!["consulted"]);
    }

    #[tokio::test]
    async fn test_error_reraised_unchanged_without_exception_handlers() {
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(FailingHandler)
            .build();
        let err = relay.send(GetValue { input: 1 }).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    struct PassThroughOpen {
        log: ObservationLog,
    }

    #[async_trait]
    impl OpenBehavior for PassThroughOpen {
        async fn handle(
            &self,
            request: RequestMeta<'_>,
            _ctx: &DispatchContext,
            next: OpenNext<'_>,
        ) -> anyhow::Result<Box<dyn Any + Send>> {
            self.log.push(format!("open:{}", request.type_name()));
            next.run().await
        }
    }

    #[tokio::test]
    async fn test_open_behavior_applies_to_any_request() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_open_behavior(PassThroughOpen { log: log.clone() })
            .build();

        let response = relay.send(GetValue { input: 3 }).await.unwrap();
        assert_eq!(response, 3);
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("GetValue"));
    }

    struct BadSubstitution;

    #[async_trait]
    impl OpenBehavior for BadSubstitution {
        async fn handle(
            &self,
            _request: RequestMeta<'_>,
            _ctx: &DispatchContext,
            next: OpenNext<'_>,
        ) -> anyhow::Result<Box<dyn Any + Send>> {
            let _ = next.run().await?;
            // Substitute a value of the wrong type.
            Ok(Box::new("not an i64".to_string()))
        }
    }

    #[tokio::test]
    async fn test_open_behavior_wrong_substitution_is_contract_violation() {
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_open_behavior(BadSubstitution)
            .build();

        let err = relay.send(GetValue { input: 3 }).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ContractViolation { .. })
        ));
    }

    struct OpenObserver {
        log: ObservationLog,
    }

    #[async_trait]
    impl OpenPreProcessor for OpenObserver {
        async fn process(
            &self,
            request: RequestMeta<'_>,
            _ctx: &DispatchContext,
        ) -> anyhow::Result<()> {
            // The erased view still reaches the concrete request.
            let input = request.downcast_ref::<GetValue>().map(|r| r.input);
            self.log.push(format!("open-pre({input:?})"));
            Ok(())
        }
    }

    #[async_trait]
    impl OpenPostProcessor for OpenObserver {
        async fn process(
            &self,
            _request: RequestMeta<'_>,
            response: &(dyn Any + Send),
            _ctx: &DispatchContext,
        ) -> anyhow::Result<()> {
            let response = response.downcast_ref::<i64>().copied();
            self.log.push(format!("open-post({response:?})"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_pre_and_post_processors_see_erased_views() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_open_pre_processor(OpenObserver { log: log.clone() })
            .with_open_post_processor(OpenObserver { log: log.clone() })
            .build();

        relay.send(GetValue { input: 4 }).await.unwrap();
        assert_eq!(
            log.entries(),
            vec!["open-pre(Some(4))", "open-post(Some(4))"]
        );
    }

    struct OpenRecover;

    #[async_trait]
    impl OpenExceptionHandler for OpenRecover {
        async fn handle(
            &self,
            _request: RequestMeta<'_>,
            error: &anyhow::Error,
            state: &mut OpenExceptionState,
            _ctx: &DispatchContext,
        ) -> anyhow::Result<()> {
            if error.to_string() == "boom" {
                state.set_handled(Box::new(7i64));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_exception_handler_recovers_any_request() {
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(FailingHandler)
            .with_open_exception_handler(OpenRecover)
            .build();

        let response = relay.send(GetValue { input: 1 }).await.unwrap();
        assert_eq!(response, 7);
    }

    #[tokio::test]
    async fn test_cancellation_is_recoverable_by_exception_handler() {
        let relay = RelayBuilder::new()
            .with_handler::<GetValue, _>(ValueHandler)
            .with_exception_handler::<GetValue, _>(Recover { with: -7 })
            .build();

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let response = relay
            .send_with(GetValue { input: 1 }, token)
            .await
            .unwrap();
        assert_eq!(response, -7);
    }
}
