//! Startup configuration for the dispatch engine.
//!
//! [`RelayOptions`] is a plain settings record consumed once at build time.
//! Code-valued configuration — the publisher strategy instance, stage and
//! module registrations, the service locator — lives on the builder; this
//! record carries the data-valued knobs and serializes cleanly for hosts
//! that load settings from files.

use serde::{Deserialize, Serialize};

/// Registration lifetime for handler factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    /// A fresh instance per dispatch.
    #[default]
    Transient,
    /// One instance per scope; falls back to transient outside a scope.
    Scoped,
    /// One instance for the process lifetime.
    Singleton,
}

/// Built-in notification fan-out strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStrategy {
    /// Resolver order, one handler at a time. The default.
    #[default]
    Sequential,
    /// All handlers concurrently; failures aggregate.
    Parallel,
}

/// Settings record for one relay instance.
///
/// # Example
///
/// ```ignore
/// let options = RelayOptions::default()
///     .with_lifetime(Lifetime::Scoped)
///     .with_publish_strategy(PublishStrategy::Parallel)
///     .with_causality_tracking(true);
///
/// let relay = RelayBuilder::new()
///     .with_options(options)
///     .with_handler::<Ping, _>(PingHandler)
///     .build();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    /// Lifetime applied to handler factories.
    pub lifetime: Lifetime,
    /// Which built-in publisher runs notifications (a custom publisher set
    /// on the builder overrides this).
    pub publish_strategy: PublishStrategy,
    /// Whether scopes carry a pipeline context.
    pub enable_pipeline_context: bool,
    /// Whether the causality stage is inserted for every request type.
    /// Requires the pipeline context; ignored without it.
    pub enable_causality_tracking: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            lifetime: Lifetime::Transient,
            publish_strategy: PublishStrategy::Sequential,
            enable_pipeline_context: true,
            enable_causality_tracking: false,
        }
    }
}

impl RelayOptions {
    /// Set the handler factory lifetime.
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Select the built-in publisher strategy.
    pub fn with_publish_strategy(mut self, strategy: PublishStrategy) -> Self {
        self.publish_strategy = strategy;
        self
    }

    /// Enable or disable the scope-local pipeline context.
    pub fn with_pipeline_context(mut self, enabled: bool) -> Self {
        self.enable_pipeline_context = enabled;
        self
    }

    /// Enable or disable causality tracking.
    pub fn with_causality_tracking(mut self, enabled: bool) -> Self {
        self.enable_causality_tracking = enabled;
        self
    }

    /// True when the causality stage should actually be inserted.
    pub(crate) fn causality_active(&self) -> bool {
        self.enable_causality_tracking && self.enable_pipeline_context
    }
}
