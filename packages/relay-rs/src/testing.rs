//! Observation helpers for asserting stage execution order in tests.
//!
//! Enabled for this crate's own tests and, behind the `testing` feature,
//! for hosts that want to assert how their stages interleave.

use std::sync::{Arc, Mutex};

/// A shared, append-only list of labels.
///
/// Stages push a label when they run; the test asserts on the snapshot.
/// Cheap to clone; clones share the same list.
#[derive(Clone, Default)]
pub struct ObservationLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ObservationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one label.
    pub fn push(&self, label: impl Into<String>) {
        self.lock().push(label.into());
    }

    /// Snapshot of all labels pushed so far.
    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Number of labels pushed so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop all labels.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl std::fmt::Debug for ObservationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationLog")
            .field("entries", &self.len())
            .finish()
    }
}
