//! Per-track point cache with reference-counted eviction.
//!
//! One entry per watched track, holding the full point sequence fetched so
//! far plus the listeners interested in it. Entry lifetime equals listener
//! set non-emptiness: the first listener creates the entry, the last
//! unregister drops it together with its points. There is no TTL and no
//! LRU — upstream data is append-only and a re-fetch is cheap, so keeping
//! memory for unwatched tracks buys nothing.
//!
//! The cache is a synchronous state machine; all fetching happens in the
//! engine, which locks around each mutation.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::listeners::{ListenerId, ListenerSet};
use crate::types::Point;

/// Callback receiving the initial point array once, then only deltas.
pub type PointsCallback = dyn Fn(&[Point]) + Send + Sync;

/// Cached state for one watched track.
struct CacheEntry {
    points: Vec<Point>,
    listeners: ListenerSet<PointsCallback>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            points: Vec::new(),
            listeners: ListenerSet::new(),
        }
    }
}

/// Outcome of applying a freshly fetched point array to an entry.
pub struct RefreshOutcome {
    /// The suffix past the previously cached length, in fetch order.
    pub delta: Vec<Point>,
    /// Callbacks to notify with exactly that delta.
    pub callbacks: Vec<Arc<PointsCallback>>,
}

/// The reference-counted track store.
#[derive(Default)]
pub struct TrackCache {
    entries: HashMap<String, CacheEntry>,
}

impl TrackCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// True when a registration for this track must fetch before its first
    /// notification, i.e. there is no entry yet or the entry has no points.
    pub fn needs_initial_fetch(&self, track_id: &str) -> bool {
        self.entries
            .get(track_id)
            .is_none_or(|entry| entry.points.is_empty())
    }

    /// Register a listener, creating the entry on first use.
    ///
    /// `seed` fills the point buffer only while it is still empty (a
    /// concurrent registration may have seeded it first). Returns the
    /// listener handle plus a snapshot of the current points for the
    /// initial synchronous callback.
    pub fn add_listener(
        &mut self,
        track_id: &str,
        seed: Option<Vec<Point>>,
        callback: Arc<PointsCallback>,
    ) -> (ListenerId, Vec<Point>) {
        let entry = self
            .entries
            .entry(track_id.to_string())
            .or_insert_with(CacheEntry::new);
        if entry.points.is_empty() {
            if let Some(points) = seed {
                entry.points = points;
            }
        }
        let id = entry.listeners.insert(callback);
        (id, entry.points.clone())
    }

    /// Remove a listener; drops the whole entry, points included, when the
    /// last one leaves. Returns true when the entry was evicted.
    pub fn remove_listener(&mut self, track_id: &str, id: ListenerId) -> bool {
        let Some(entry) = self.entries.get_mut(track_id) else {
            return false;
        };
        entry.listeners.remove(id);
        if entry.listeners.is_empty() {
            self.entries.remove(track_id);
            debug!("evicted cache entry for '{track_id}'");
            return true;
        }
        false
    }

    /// Gate for the incremental refresh. False when there is no entry, no
    /// listener, or the reported count does not exceed the cached length —
    /// stale manifest data must never trigger a fetch or a truncation.
    pub fn needs_refresh(&self, track_id: &str, reported_count: usize) -> bool {
        match self.entries.get(track_id) {
            Some(entry) => !entry.listeners.is_empty() && reported_count > entry.points.len(),
            None => false,
        }
    }

    /// Apply a freshly fetched full point array.
    ///
    /// Returns `None` when the entry vanished while the fetch was in
    /// flight (the last listener unregistered mid-fetch; the straggler
    /// result is dropped), or when the fresh array does not extend past
    /// the cached length — the cache never truncates. Otherwise the fresh
    /// array replaces the cached one and the suffix past the old length is
    /// the delta to deliver.
    pub fn apply_refresh(&mut self, track_id: &str, fresh: Vec<Point>) -> Option<RefreshOutcome> {
        let entry = self.entries.get_mut(track_id)?;
        let cached_len = entry.points.len();
        if fresh.len() <= cached_len {
            debug!(
                "refresh for '{}' returned {} points, {} cached; keeping cache",
                track_id,
                fresh.len(),
                cached_len
            );
            return None;
        }

        let delta = fresh[cached_len..].to_vec();
        entry.points = fresh;
        Some(RefreshOutcome {
            delta,
            callbacks: entry.listeners.callbacks(),
        })
    }

    /// Whether a track currently has a cache entry.
    pub fn contains(&self, track_id: &str) -> bool {
        self.entries.contains_key(track_id)
    }

    /// Number of watched tracks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and listener.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
