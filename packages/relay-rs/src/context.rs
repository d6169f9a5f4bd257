//! Scope-local pipeline context: timers, metric aggregates, items, baggage.
//!
//! A [`PipelineContext`] is created when a dispatch scope starts and released
//! when the scope ends. Every dispatch running inside the scope — including
//! nested sends issued from handlers — shares the same context through a weak
//! reference, so the context never outlives its scope because a stage held on
//! to it.
//!
//! # Locking
//!
//! All aggregate state (timings, metrics, the causality chain) lives behind
//! one mutex per context. Snapshot accessors return copies so callers can
//! iterate without holding the lock. The arbitrary item bag is a concurrent
//! map with per-key atomicity only; users racing on the same key share
//! responsibility for coordination.
//!
//! # Reserved keys
//!
//! - baggage `request_id` — adopted by the causality stage as the current id
//! - items `relay.current-request-id` — the in-flight request id
//! - items `relay.baggage` — backing storage for the baggage map
//!
//! Keys the engine owns are namespaced under `relay.` to avoid colliding
//! with user entries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::causality::CausalityEntry;

/// Reserved baggage key: the caller-supplied id for the current request.
pub const BAGGAGE_REQUEST_ID: &str = "request_id";

/// Reserved item key: the id of the request currently in flight.
pub const ITEM_CURRENT_REQUEST_ID: &str = "relay.current-request-id";

/// Reserved item key: backing storage for the baggage map.
pub(crate) const ITEM_BAGGAGE: &str = "relay.baggage";

/// An immutable recorded span.
#[derive(Debug, Clone)]
pub struct TimingEntry {
    /// The name the timer was started with.
    pub name: String,
    /// Time between start and first stop.
    pub elapsed: Duration,
    /// Wall-clock instant the timer started.
    pub started_at: DateTime<Utc>,
}

/// Aggregated statistics for one metric name.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEntry {
    /// Number of recorded observations (or accumulated increments).
    pub count: u64,
    /// Sum of all recorded values.
    pub total: f64,
    /// Smallest recorded value.
    pub min: f64,
    /// Largest recorded value.
    pub max: f64,
}

impl MetricEntry {
    fn seeded(count: u64, value: f64) -> Self {
        Self {
            count,
            total: value,
            min: value,
            max: value,
        }
    }

    /// `total / count`, or 0 when nothing has been recorded.
    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.total / self.count as f64
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct Aggregates {
    timings: Vec<TimingEntry>,
    metrics: HashMap<String, MetricEntry>,
    causality: Vec<CausalityEntry>,
}

/// Scope-local, thread-safe telemetry and state bag.
///
/// See the [module docs](self) for the locking and ownership model.
pub struct PipelineContext {
    aggregates: Arc<Mutex<Aggregates>>,
    items: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl PipelineContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            aggregates: Arc::new(Mutex::new(Aggregates::default())),
            items: DashMap::new(),
        }
    }

    /// Acquire the aggregates lock, recovering from poison if necessary.
    fn lock_aggregates(&self) -> MutexGuard<'_, Aggregates> {
        // Telemetry state: prefer availability over strict consistency.
        self.aggregates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ────────────────────────────────────────────────────────────────────
    // Timers
    // ────────────────────────────────────────────────────────────────────

    /// Start a named timer. The stopwatch starts immediately.
    ///
    /// The returned [`ContextTimer`] records exactly one [`TimingEntry`] on
    /// its first stop (explicit or on drop), no matter how many times it is
    /// stopped afterwards.
    pub fn start_timer(&self, name: impl Into<String>) -> ContextTimer {
        ContextTimer {
            name: name.into(),
            started: Instant::now(),
            started_at: Utc::now(),
            recorded: None,
            aggregates: self.aggregates.clone(),
        }
    }

    /// Snapshot of all recorded timings. Not live.
    pub fn timings(&self) -> Vec<TimingEntry> {
        self.lock_aggregates().timings.clone()
    }

    // ────────────────────────────────────────────────────────────────────
    // Metrics
    // ────────────────────────────────────────────────────────────────────

    /// Increment a counter-style metric by one.
    pub fn increment(&self, name: impl Into<String>) {
        self.increment_by(name, 1);
    }

    /// Increment a counter-style metric.
    ///
    /// Adds `delta` to both the count and the total; min and max are seeded
    /// with `delta` on first touch and left alone afterwards.
    pub fn increment_by(&self, name: impl Into<String>, delta: u64) {
        let mut agg = self.lock_aggregates();
        match agg.metrics.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let m = e.get_mut();
                m.count += delta;
                m.total += delta as f64;
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(MetricEntry::seeded(delta, delta as f64));
            }
        }
    }

    /// Record one observation of a value-style metric.
    pub fn record(&self, name: impl Into<String>, value: f64) {
        let mut agg = self.lock_aggregates();
        match agg.metrics.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let m = e.get_mut();
                m.count += 1;
                m.total += value;
                m.min = m.min.min(value);
                m.max = m.max.max(value);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(MetricEntry::seeded(1, value));
            }
        }
    }

    /// Snapshot of all metric aggregates. Not live.
    pub fn metrics(&self) -> HashMap<String, MetricEntry> {
        self.lock_aggregates().metrics.clone()
    }

    /// Snapshot of a single metric, if it has been touched.
    pub fn metric(&self, name: &str) -> Option<MetricEntry> {
        self.lock_aggregates().metrics.get(name).cloned()
    }

    // ────────────────────────────────────────────────────────────────────
    // Causality chain
    // ────────────────────────────────────────────────────────────────────

    /// Append one causality edge. Called by the causality stage.
    pub(crate) fn record_causality(&self, entry: CausalityEntry) {
        self.lock_aggregates().causality.push(entry);
    }

    /// Snapshot of the causality chain recorded so far. Not live.
    pub fn causality_chain(&self) -> Vec<CausalityEntry> {
        self.lock_aggregates().causality.clone()
    }

    // ────────────────────────────────────────────────────────────────────
    // Items
    // ────────────────────────────────────────────────────────────────────

    /// Store an arbitrary value under a string key. Last write wins.
    pub fn set_item<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.items.insert(key.into(), Arc::new(value));
    }

    /// Fetch a typed item. Returns `None` when the key is absent or holds a
    /// value of a different type.
    pub fn item<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.items.get(key)?;
        entry.value().clone().downcast::<T>().ok()
    }

    /// Remove an item, returning whether it existed.
    pub fn remove_item(&self, key: &str) -> bool {
        self.items.remove(key).is_some()
    }

    // ────────────────────────────────────────────────────────────────────
    // Baggage
    // ────────────────────────────────────────────────────────────────────

    fn baggage_map(&self) -> Arc<DashMap<String, String>> {
        let entry = self
            .items
            .entry(ITEM_BAGGAGE.to_string())
            .or_insert_with(|| Arc::new(DashMap::<String, String>::new()));
        entry
            .value()
            .clone()
            .downcast::<DashMap<String, String>>()
            .unwrap_or_else(|_| Arc::new(DashMap::new()))
    }

    /// Set a string baggage value. Keys are case-sensitive; last write wins.
    pub fn set_baggage(&self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage_map().insert(key.into(), value.into());
    }

    /// Fetch a baggage value.
    pub fn baggage(&self, key: &str) -> Option<String> {
        self.baggage_map().get(key).map(|v| v.value().clone())
    }

    /// Snapshot of all baggage entries. Not live.
    pub fn all_baggage(&self) -> HashMap<String, String> {
        self.baggage_map()
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let agg = self.lock_aggregates();
        f.debug_struct("PipelineContext")
            .field("timings", &agg.timings.len())
            .field("metrics", &agg.metrics.len())
            .field("causality", &agg.causality.len())
            .field("items", &self.items.len())
            .finish()
    }
}

/// Running stopwatch attached to a context.
///
/// Stop is idempotent: the first stop (explicit or via drop) records one
/// timing entry; later stops are no-ops.
pub struct ContextTimer {
    name: String,
    started: Instant,
    started_at: DateTime<Utc>,
    recorded: Option<Duration>,
    aggregates: Arc<Mutex<Aggregates>>,
}

impl ContextTimer {
    /// Elapsed time: live while running, frozen after the first stop.
    pub fn elapsed(&self) -> Duration {
        self.recorded.unwrap_or_else(|| self.started.elapsed())
    }

    /// Stop the timer and record its timing entry. Idempotent.
    pub fn stop(&mut self) {
        if self.recorded.is_some() {
            return;
        }
        let elapsed = self.started.elapsed();
        self.recorded = Some(elapsed);
        let entry = TimingEntry {
            name: self.name.clone(),
            elapsed,
            started_at: self.started_at,
        };
        let mut agg = self
            .aggregates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        agg.timings.push(entry);
    }
}

impl Drop for ContextTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
