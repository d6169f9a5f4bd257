//! The stream pipeline: lazy sequences wrapped by stream behaviors.
//!
//! Stream dispatch resolves the single stream handler for the request type
//! and wraps it with stream behaviors so the first registered executes
//! outermost. Pre/post processors and exception handlers do **not** apply to
//! streams.
//!
//! # Laziness
//!
//! `create_stream` returns without running anything: stage construction is
//! deferred to the first poll, and from there each item is produced on
//! demand. Dropping the sequence early drops the handler's stream and every
//! wrapping stage with it.
//!
//! # Cancellation
//!
//! The caller's token is checked on every poll. Once cancelled, the sequence
//! yields a single cancellation error and ends; the inner stages are dropped
//! and never polled again.

use std::any::Any;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::core::StreamRequest;
use crate::error::RelayError;
use crate::handler::DispatchContext;
use crate::registry::StreamHandlerSlot;

/// Continuation handed to a stream behavior.
///
/// Calling [`StreamNext::stream`] builds the rest of the pipeline; dropping
/// it without calling short-circuits (the behavior then supplies the whole
/// sequence itself).
pub struct StreamNext<R: StreamRequest> {
    pub(crate) make: Box<dyn FnOnce() -> BoxStream<'static, anyhow::Result<R::Item>> + Send>,
}

impl<R: StreamRequest> StreamNext<R> {
    /// Build the inner sequence.
    pub fn stream(self) -> BoxStream<'static, anyhow::Result<R::Item>> {
        (self.make)()
    }
}

/// A stage that wraps a stream pipeline for one request type.
///
/// The first registered behavior executes outermost. Behaviors typically
/// decorate the inner sequence with combinators; anything they do eagerly
/// runs on the consumer's first poll, not at `create_stream` time.
pub trait StreamBehavior<R: StreamRequest>: Send + Sync + 'static {
    /// Wrap the inner sequence.
    fn handle(
        &self,
        request: Arc<R>,
        ctx: &DispatchContext,
        next: StreamNext<R>,
    ) -> BoxStream<'static, anyhow::Result<R::Item>>;
}

/// Type-erased view of a stream request, handed to open stream behaviors.
#[derive(Clone)]
pub struct StreamMeta {
    type_name: &'static str,
    request: Arc<dyn Any + Send + Sync>,
}

impl StreamMeta {
    /// The request's concrete type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Try to view the request as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.request.downcast_ref::<T>()
    }
}

/// Continuation handed to an open stream behavior; items come back boxed.
pub struct OpenStreamNext {
    make: Box<dyn FnOnce() -> BoxStream<'static, anyhow::Result<Box<dyn Any + Send>>> + Send>,
}

impl OpenStreamNext {
    /// Build the inner sequence.
    pub fn stream(self) -> BoxStream<'static, anyhow::Result<Box<dyn Any + Send>>> {
        (self.make)()
    }
}

/// A stream behavior applicable to every stream request type.
///
/// Substituting an item of the wrong concrete type fails that element with a
/// contract violation.
pub trait OpenStreamBehavior: Send + Sync + 'static {
    /// Wrap the inner sequence.
    fn handle(
        &self,
        request: StreamMeta,
        ctx: &DispatchContext,
        next: OpenStreamNext,
    ) -> BoxStream<'static, anyhow::Result<Box<dyn Any + Send>>>;
}

pub(crate) struct OpenStreamBehaviorAdapter {
    inner: Arc<dyn OpenStreamBehavior>,
}

impl OpenStreamBehaviorAdapter {
    pub(crate) fn new(inner: Arc<dyn OpenStreamBehavior>) -> Self {
        Self { inner }
    }
}

impl<R: StreamRequest> StreamBehavior<R> for OpenStreamBehaviorAdapter {
    fn handle(
        &self,
        request: Arc<R>,
        ctx: &DispatchContext,
        next: StreamNext<R>,
    ) -> BoxStream<'static, anyhow::Result<R::Item>> {
        let erased_next = OpenStreamNext {
            make: Box::new(move || {
                next.stream()
                    .map(|item| item.map(|value| Box::new(value) as Box<dyn Any + Send>))
                    .boxed()
            }),
        };
        let meta = StreamMeta {
            type_name: std::any::type_name::<R>(),
            request: request as Arc<dyn Any + Send + Sync>,
        };
        self.inner
            .handle(meta, ctx, erased_next)
            .map(|item| {
                item.and_then(|boxed| match boxed.downcast::<R::Item>() {
                    Ok(value) => Ok(*value),
                    Err(_) => Err(
                        RelayError::bad_substitution(std::any::type_name::<R::Item>()).into(),
                    ),
                })
            })
            .boxed()
    }
}

/// The compiled stream pipeline for one request type. Cached like its
/// request/response counterpart.
pub(crate) struct StreamPipeline<R: StreamRequest> {
    pub(crate) handler: Arc<StreamHandlerSlot<R>>,
    pub(crate) behaviors: Vec<Arc<dyn StreamBehavior<R>>>,
}

impl<R: StreamRequest> StreamPipeline<R> {
    pub(crate) fn execute(
        &self,
        request: Arc<R>,
        ctx: DispatchContext,
    ) -> BoxStream<'static, anyhow::Result<R::Item>> {
        let token = ctx.cancellation().clone();
        let handler = self.handler.resolve(&ctx);

        let mut make: Box<dyn FnOnce() -> BoxStream<'static, anyhow::Result<R::Item>> + Send> = {
            let request = request.clone();
            let ctx = ctx.clone();
            Box::new(move || handler.handle(request, ctx))
        };

        // Wrap outward through the reversed list so the first registered
        // behavior lands outermost.
        for behavior in self.behaviors.iter().rev() {
            let behavior = behavior.clone();
            let request = request.clone();
            let ctx = ctx.clone();
            let inner = make;
            make = Box::new(move || behavior.handle(request, &ctx, StreamNext { make: inner }));
        }

        let stream = deferred(make);
        CancellableStream::new(stream, token).boxed()
    }
}

/// Defer stage construction to the first poll.
fn deferred<T: Send + 'static>(
    make: Box<dyn FnOnce() -> BoxStream<'static, T> + Send>,
) -> BoxStream<'static, T> {
    futures::stream::once(async move { make() }).flatten().boxed()
}

/// Terminates a sequence with a cancellation error once the token fires.
struct CancellableStream<T> {
    inner: BoxStream<'static, anyhow::Result<T>>,
    cancelled: BoxFuture<'static, ()>,
    done: bool,
}

impl<T> CancellableStream<T> {
    fn new(inner: BoxStream<'static, anyhow::Result<T>>, token: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.cancelled_owned()),
            done: false,
        }
    }
}

impl<T> Stream for CancellableStream<T> {
    type Item = anyhow::Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(Some(Err(RelayError::Cancelled.into())));
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Request;
    use crate::dispatch::RelayBuilder;
    use crate::handler::StreamHandler;
    use crate::testing::ObservationLog;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Count {
        up_to: u64,
    }

    impl StreamRequest for Count {
        type Item = u64;
    }

    struct CountHandler;

    impl StreamHandler<Count> for CountHandler {
        fn handle(
            &self,
            request: Arc<Count>,
            _ctx: DispatchContext,
        ) -> BoxStream<'static, anyhow::Result<u64>> {
            futures::stream::iter((1..=request.up_to).map(Ok)).boxed()
        }
    }

    #[tokio::test]
    async fn test_stream_yields_handler_items() {
        let relay = RelayBuilder::new()
            .with_stream_handler::<Count, _>(CountHandler)
            .build();

        let stream = relay.create_stream(Count { up_to: 3 }).unwrap();
        let items: Vec<u64> = stream.map(|i| i.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unregistered_stream_handler_fails_eagerly() {
        #[derive(Debug, Clone)]
        struct Orphan;

        impl StreamRequest for Orphan {
            type Item = u8;
        }

        let relay = RelayBuilder::new().build();
        let err = relay.create_stream(Orphan).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::UnregisteredHandler { .. })
        ));
    }

    struct LoggingStreamHandler {
        log: ObservationLog,
    }

    impl StreamHandler<Count> for LoggingStreamHandler {
        fn handle(
            &self,
            request: Arc<Count>,
            _ctx: DispatchContext,
        ) -> BoxStream<'static, anyhow::Result<u64>> {
            self.log.push("handler-built");
            futures::stream::iter((1..=request.up_to).map(Ok)).boxed()
        }
    }

    #[tokio::test]
    async fn test_stream_is_lazy_until_first_poll() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_stream_handler::<Count, _>(LoggingStreamHandler { log: log.clone() })
            .build();

        let mut stream = relay.create_stream(Count { up_to: 2 }).unwrap();
        assert!(log.entries().is_empty());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, 1);
        assert_eq!(log.entries(), vec!["handler-built"]);
    }

    struct Double;

    impl StreamBehavior<Count> for Double {
        fn handle(
            &self,
            _request: Arc<Count>,
            _ctx: &DispatchContext,
            next: StreamNext<Count>,
        ) -> BoxStream<'static, anyhow::Result<u64>> {
            next.stream().map(|item| item.map(|v| v * 2)).boxed()
        }
    }

    struct PlusOne;

    impl StreamBehavior<Count> for PlusOne {
        fn handle(
            &self,
            _request: Arc<Count>,
            _ctx: &DispatchContext,
            next: StreamNext<Count>,
        ) -> BoxStream<'static, anyhow::Result<u64>> {
            next.stream().map(|item| item.map(|v| v + 1)).boxed()
        }
    }

    #[tokio::test]
    async fn test_first_registered_stream_behavior_is_outermost() {
        // PlusOne outermost, Double inner: handler v → 2v → 2v + 1.
        let relay = RelayBuilder::new()
            .with_stream_handler::<Count, _>(CountHandler)
            .with_stream_behavior::<Count, _>(PlusOne)
            .with_stream_behavior::<Count, _>(Double)
            .build();

        let stream = relay.create_stream(Count { up_to: 3 }).unwrap();
        let items: Vec<u64> = stream.map(|i| i.unwrap()).collect().await;
        assert_eq!(items, vec![3, 5, 7]);
    }

    struct SlowHandler;

    impl StreamHandler<Count> for SlowHandler {
        fn handle(
            &self,
            request: Arc<Count>,
            _ctx: DispatchContext,
        ) -> BoxStream<'static, anyhow::Result<u64>> {
            futures::stream::unfold(0u64, move |n| {
                let up_to = request.up_to;
                async move {
                    if n >= up_to {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok(n + 1), n + 1))
                }
            })
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_mid_stream() {
        let relay = RelayBuilder::new()
            .with_stream_handler::<Count, _>(SlowHandler)
            .build();

        let token = CancellationToken::new();
        let mut stream = relay
            .create_stream_with(Count { up_to: 100 }, token.clone())
            .unwrap();

        let mut collected = Vec::new();
        for _ in 0..3 {
            collected.push(stream.next().await.unwrap().unwrap());
        }
        token.cancel();

        let next = stream.next().await.unwrap();
        assert!(crate::error::is_cancellation(&next.unwrap_err()));
        assert!(stream.next().await.is_none());
        assert_eq!(collected, vec![1, 2, 3]);
    }

    struct BoxedPassThrough {
        log: ObservationLog,
    }

    impl OpenStreamBehavior for BoxedPassThrough {
        fn handle(
            &self,
            request: StreamMeta,
            _ctx: &DispatchContext,
            next: OpenStreamNext,
        ) -> BoxStream<'static, anyhow::Result<Box<dyn Any + Send>>> {
            self.log.push(format!("open:{}", request.type_name()));
            next.stream()
        }
    }

    #[tokio::test]
    async fn test_open_stream_behavior_applies_to_any_stream() {
        let log = ObservationLog::new();
        let relay = RelayBuilder::new()
            .with_stream_handler::<Count, _>(CountHandler)
            .with_open_stream_behavior(BoxedPassThrough { log: log.clone() })
            .build();

        let stream = relay.create_stream(Count { up_to: 2 }).unwrap();
        let items: Vec<u64> = stream.map(|i| i.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2]);
        assert_eq!(log.entries().len(), 1);
        assert!(log.entries()[0].contains("Count"));
    }

    // Stream requests and plain requests are dispatched through separate
    // registries; the same type name appearing in both is not a conflict.
    #[tokio::test]
    async fn test_stream_and_request_registries_are_separate() {
        #[derive(Debug, Clone)]
        struct Dual;

        impl Request for Dual {
            type Response = u8;
        }

        impl StreamRequest for Dual {
            type Item = u8;
        }

        struct DualHandler;

        #[async_trait::async_trait]
        impl crate::handler::RequestHandler<Dual> for DualHandler {
            async fn handle(&self, _request: &Dual, _ctx: &DispatchContext) -> anyhow::Result<u8> {
                Ok(1)
            }
        }

        struct DualStreamHandler;

        impl StreamHandler<Dual> for DualStreamHandler {
            fn handle(
                &self,
                _request: Arc<Dual>,
                _ctx: DispatchContext,
            ) -> BoxStream<'static, anyhow::Result<u8>> {
                futures::stream::iter([Ok(2), Ok(3)]).boxed()
            }
        }

        let relay = RelayBuilder::new()
            .with_handler::<Dual, _>(DualHandler)
            .with_stream_handler::<Dual, _>(DualStreamHandler)
            .build();

        assert_eq!(relay.send(Dual).await.unwrap(), 1);
        let items: Vec<u8> = relay
            .create_stream(Dual)
            .unwrap()
            .map(|i| i.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![2, 3]);
    }
}
