//! # Relay
//!
//! An in-process mediator: callers hand a request to a dispatcher, the
//! dispatcher finds the sole handler registered for that request's type,
//! runs it inside a configurable pipeline of cross-cutting stages, and
//! returns the typed result.
//!
//! ## Interaction shapes
//!
//! - [`Relay::send`] — request/response, exactly one handler, one result
//! - [`Relay::publish`] — notification fan-out to 0..N handlers, no result
//! - [`Relay::create_stream`] — lazy, cancellable sequence of results
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ send / publish / create_stream
//!   ▼
//! Relay ──► wrapper cache (TypeId → compiled pipeline, built once)
//!   │
//!   ▼
//! exception handlers
//!   └─ pre-processors
//!        └─ post-processor layer
//!             └─ behaviors (first registered = outermost)
//!                  └─ handler
//! ```
//!
//! Handlers are resolved by the **exact runtime type** of the value; there
//! is no inheritance-based delivery. Stages register *closed* (one request
//! type) or *open* (every request type), and open/closed registrations keep
//! their interleaved order.
//!
//! ## Scopes, context, causality
//!
//! A [`RelayScope`] bounds a unit of work (a web request, a job run). It
//! owns a [`PipelineContext`] — thread-safe timers, metric aggregates, an
//! item bag, and string baggage — shared by every dispatch inside the
//! scope, including nested sends issued from handlers through
//! [`DispatchContext::send`]. With causality tracking enabled, each request
//! gets a short id and the context accumulates the parent/child edges of
//! the nested-dispatch tree.
//!
//! ## Example
//!
//! ```ignore
//! use relay::{Relay, RelayBuilder, Request, RequestHandler, DispatchContext, async_trait};
//!
//! #[derive(Debug, Clone)]
//! struct Ping { message: String }
//!
//! #[derive(Debug, PartialEq)]
//! struct Pong { reply: String }
//!
//! impl Request for Ping {
//!     type Response = Pong;
//! }
//!
//! struct PingHandler;
//!
//! #[async_trait]
//! impl RequestHandler<Ping> for PingHandler {
//!     async fn handle(&self, request: &Ping, _ctx: &DispatchContext) -> anyhow::Result<Pong> {
//!         Ok(Pong { reply: format!("Pong: {}", request.message) })
//!     }
//! }
//!
//! let relay = RelayBuilder::new()
//!     .with_handler::<Ping, _>(PingHandler)
//!     .build();
//!
//! let pong = relay.send(Ping { message: "Hello".into() }).await?;
//! assert_eq!(pong.reply, "Pong: Hello");
//! ```
//!
//! ## What this is not
//!
//! Relay is **not** a message queue, a transport, or a saga engine: nothing
//! is persisted, nothing crosses a process boundary, and retries or circuit
//! breaking belong in user-written behaviors.

// Core modules
mod causality;
mod config;
mod context;
mod core;
mod dispatch;
mod error;
mod handler;
mod pipeline;
mod provider;
mod publish;
mod registry;
mod stream;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;



// Re-export core traits
pub use crate::core::{Notification, Request, RequestId, StreamRequest};

// Re-export error types
pub use crate::error::{is_cancellation, RelayError};

// Re-export the façade
pub use crate::dispatch::{Relay, RelayBuilder, RelayModule, RelayScope};

// Re-export handler traits and the per-dispatch context
pub use crate::handler::{DispatchContext, NotificationHandler, RequestHandler, StreamHandler};

// Re-export pipeline stage traits
pub use crate::pipeline::{
    Behavior, ExceptionHandler, ExceptionState, Next, OpenBehavior, OpenExceptionHandler,
    OpenExceptionState, OpenNext, OpenPostProcessor, OpenPreProcessor, PostProcessor,
    PreProcessor, RequestMeta,
};

// Re-export stream pipeline types
pub use crate::stream::{
    OpenStreamBehavior, OpenStreamNext, StreamBehavior, StreamMeta, StreamNext,
};

// Re-export publishers
pub use crate::publish::{
    NotificationInvocation, NotificationPublisher, ParallelPublisher, SequentialPublisher,
};

// Re-export the pipeline context
pub use crate::context::{
    ContextTimer, MetricEntry, PipelineContext, TimingEntry, BAGGAGE_REQUEST_ID,
    ITEM_CURRENT_REQUEST_ID,
};

// Re-export causality types
pub use crate::causality::{CausalityBehavior, CausalityEntry};

// Re-export configuration
pub use crate::config::{Lifetime, PublishStrategy, RelayOptions};

// Re-export the service locator surface
pub use crate::provider::{ServiceLocator, ServiceProvider, ServiceScope};

// Re-export commonly used external types
pub use async_trait::async_trait;
