//! Identity-keyed listener sets with isolated fan-out.
//!
//! A listener set holds opaque callback handles: the handle returned by
//! `insert` removes exactly that registration, so the same closure can be
//! registered twice and unregistered once. Fan-out isolates each callback —
//! one panicking consumer never breaks the poll loop or its neighbors.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::warn;

/// Opaque handle identifying one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered set of callbacks keyed by registration identity.
///
/// Registration order is preserved so notification order is deterministic.
pub struct ListenerSet<F: ?Sized> {
    next_id: u64,
    entries: Vec<(ListenerId, Arc<F>)>,
}

impl<F: ?Sized> ListenerSet<F> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Add a callback; the returned handle removes exactly this registration.
    pub fn insert(&mut self, callback: Arc<F>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, callback));
        id
    }

    /// Remove a callback by its handle. Returns whether it was present.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot the callbacks for fan-out outside the state lock.
    pub fn callbacks(&self) -> Vec<Arc<F>> {
        self.entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<F: ?Sized> Default for ListenerSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke `call` once per callback, isolating panics.
///
/// A panicking consumer is logged and skipped; the remaining callbacks
/// still run. `what` names the notification in the log line.
pub fn notify_each<F: ?Sized>(callbacks: &[Arc<F>], what: &str, mut call: impl FnMut(&F)) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| call(callback))).is_err() {
            warn!("listener panicked during {what} notification; continuing");
        }
    }
}
