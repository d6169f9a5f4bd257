//! Notification fan-out strategies.
//!
//! A publisher receives the prepared handler invocations for one
//! notification plus the caller's cancellation signal, and decides how to
//! run them. Two built-ins:
//!
//! - [`SequentialPublisher`] — resolver order, one at a time, first error
//!   aborts the chain and surfaces as-is. The default.
//! - [`ParallelPublisher`] — all handlers start concurrently; once all have
//!   settled, any failures surface as one aggregated error carrying every
//!   inner failure. Ordering between handlers is unspecified.
//!
//! Publishers never consume handler errors: whatever a strategy surfaces
//! reaches the caller unchanged.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::RelayError;

/// One notification handler, bound to its notification and ready to run.
///
/// The inner future is lazy: nothing runs until the publisher awaits it.
pub struct NotificationInvocation {
    handler_name: &'static str,
    future: BoxFuture<'static, anyhow::Result<()>>,
}

impl NotificationInvocation {
    pub(crate) fn new(
        handler_name: &'static str,
        future: BoxFuture<'static, anyhow::Result<()>>,
    ) -> Self {
        Self {
            handler_name,
            future,
        }
    }

    /// The concrete type name of the handler, for diagnostics.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    /// Run the handler to completion.
    pub async fn run(self) -> anyhow::Result<()> {
        self.future.await
    }
}

impl std::fmt::Debug for NotificationInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationInvocation")
            .field("handler_name", &self.handler_name)
            .finish_non_exhaustive()
    }
}

/// Strategy deciding how the handlers of one notification execute.
#[async_trait]
pub trait NotificationPublisher: Send + Sync + 'static {
    /// Run the given handler invocations.
    async fn publish(
        &self,
        invocations: Vec<NotificationInvocation>,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Run handlers one at a time in resolver order; the first error aborts the
/// chain and surfaces unchanged.
#[derive(Debug, Default)]
pub struct SequentialPublisher;

#[async_trait]
impl NotificationPublisher for SequentialPublisher {
    async fn publish(
        &self,
        invocations: Vec<NotificationInvocation>,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<()> {
        for invocation in invocations {
            if cancellation.is_cancelled() {
                return Err(RelayError::Cancelled.into());
            }
            invocation.run().await?;
        }
        Ok(())
    }
}

/// Start all handlers concurrently and wait for every one to settle.
///
/// If one or more fail, the caller observes a single
/// [`RelayError::AggregatedFailure`] preserving every inner failure.
#[derive(Debug, Default)]
pub struct ParallelPublisher;

#[async_trait]
impl NotificationPublisher for ParallelPublisher {
    async fn publish(
        &self,
        invocations: Vec<NotificationInvocation>,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<()> {
        if cancellation.is_cancelled() {
            return Err(RelayError::Cancelled.into());
        }

        let total = invocations.len();
        let tagged = invocations.into_iter().map(|invocation| {
            let name = invocation.handler_name;
            async move { (name, invocation.run().await) }
        });
        let results = futures::future::join_all(tagged).await;

        let mut failures = Vec::new();
        for (name, result) in results {
            if let Err(err) = result {
                error!(handler = name, error = %err, "notification handler failed");
                failures.push(err);
            }
        }

        if failures.is_empty() {
            debug!(handler_count = total, "parallel publish complete");
            Ok(())
        } else {
            Err(RelayError::AggregatedFailure { failures }.into())
        }
    }
}
