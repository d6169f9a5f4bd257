//! Service locator: the dependency surface consumed by handlers and stages.
//!
//! The engine treats the host's container as an abstract locator with three
//! capabilities: resolve one, resolve all, create scope. Hosts with a real
//! container implement [`ServiceLocator`] over it; hosts without one get
//! [`ServiceProvider`], a small in-crate implementation supporting the three
//! registration lifetimes.
//!
//! Resolution is type-erased at the trait boundary (`TypeId` in, boxed `Any`
//! out) so the trait stays object-safe; [`DispatchContext::resolve`] adds
//! the typed convenience layer on top.
//!
//! [`DispatchContext::resolve`]: crate::DispatchContext::resolve

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::config::Lifetime;

/// Per-scope cache for scoped service instances.
///
/// Created by [`ServiceLocator::create_scope`] and dropped with the scope;
/// dropping it releases every scoped instance it holds.
#[derive(Default)]
pub struct ServiceScope {
    cache: DashMap<usize, Arc<dyn Any + Send + Sync>>,
}

impl ServiceScope {
    /// Create an empty scope cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(
        &self,
        key: usize,
        make: impl FnOnce() -> Arc<dyn Any + Send + Sync>,
    ) -> Arc<dyn Any + Send + Sync> {
        self.cache.entry(key).or_insert_with(make).value().clone()
    }
}

impl std::fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceScope")
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Abstract service locator consumed by the dispatch engine.
pub trait ServiceLocator: Send + Sync + 'static {
    /// Resolve one service for the type, or `None` when nothing is
    /// registered. When several registrations exist, the most recent wins.
    fn resolve_erased(
        &self,
        ty: TypeId,
        scope: Option<&ServiceScope>,
    ) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Resolve every service registered for the type, in registration order.
    fn resolve_all_erased(
        &self,
        ty: TypeId,
        scope: Option<&ServiceScope>,
    ) -> Vec<Arc<dyn Any + Send + Sync>>;

    /// Open a scope; scoped services resolved with it are cached until it is
    /// dropped.
    fn create_scope(&self) -> ServiceScope {
        ServiceScope::new()
    }
}

struct ServiceRegistration {
    index: usize,
    lifetime: Lifetime,
    factory: Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>,
    singleton: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistration {
    fn resolve(&self, scope: Option<&ServiceScope>) -> Arc<dyn Any + Send + Sync> {
        match self.lifetime {
            Lifetime::Singleton => self.singleton.get_or_init(|| (self.factory)()).clone(),
            Lifetime::Transient => (self.factory)(),
            Lifetime::Scoped => match scope {
                Some(scope) => scope.cached(self.index, || (self.factory)()),
                None => (self.factory)(),
            },
        }
    }
}

/// In-crate service provider: a type map with lifetimes.
///
/// Populated through the builder before the relay is built; immutable
/// afterwards.
#[derive(Default)]
pub struct ServiceProvider {
    registrations: HashMap<TypeId, Vec<ServiceRegistration>>,
    next_index: usize,
}

impl ServiceProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared instance (singleton).
    pub fn register_instance<T: Send + Sync + 'static>(&mut self, value: T) {
        self.register_arc(Arc::new(value));
    }

    /// Register a pre-wrapped shared instance (singleton).
    pub fn register_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) {
        let factory = move || value.clone() as Arc<dyn Any + Send + Sync>;
        self.push::<T>(Lifetime::Singleton, Arc::new(factory));
    }

    /// Register a factory honored per the given lifetime.
    pub fn register_factory<T, F>(&mut self, lifetime: Lifetime, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory = move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>;
        self.push::<T>(lifetime, Arc::new(factory));
    }

    fn push<T: Send + Sync + 'static>(
        &mut self,
        lifetime: Lifetime,
        factory: Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>,
    ) {
        let index = self.next_index;
        self.next_index += 1;
        self.registrations
            .entry(TypeId::of::<T>())
            .or_default()
            .push(ServiceRegistration {
                index,
                lifetime,
                factory,
                singleton: OnceLock::new(),
            });
    }

    /// Number of registrations across all types.
    pub fn len(&self) -> usize {
        self.registrations.values().map(Vec::len).sum()
    }

    /// Whether anything is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl ServiceLocator for ServiceProvider {
    fn resolve_erased(
        &self,
        ty: TypeId,
        scope: Option<&ServiceScope>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let registrations = self.registrations.get(&ty)?;
        registrations.last().map(|r| r.resolve(scope))
    }

    fn resolve_all_erased(
        &self,
        ty: TypeId,
        scope: Option<&ServiceScope>,
    ) -> Vec<Arc<dyn Any + Send + Sync>> {
        match self.registrations.get(&ty) {
            Some(registrations) => registrations.iter().map(|r| r.resolve(scope)).collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("registrations", &self.len())
            .finish()
    }
}
