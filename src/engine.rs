//! The synchronization engine: poll loop, delta fan-out, public API.
//!
//! Composes the fetcher, change detector, track cache and listener sets
//! behind one cheaply-clonable handle. One poll pass:
//! 1. fetch the manifest — a failure aborts the whole pass (logged, never
//!    surfaced to callers),
//! 2. re-fetch groups whose `edited` moved past the watermark, notifying
//!    group listeners only when the delivered content actually changed,
//! 3. evict groups that left the manifest, notifying with `None`,
//! 4. diff the live pointer,
//! 5. run the incremental point refresh for every current group member
//!    (ascending group key order) and the live track last.
//!
//! Passes are serialized by construction: the poll task awaits each pass
//! to completion before sleeping, so watermark updates never interleave.
//!
//! The state lock is never held across an await. Every step fetches first,
//! then locks, mutates, snapshots the callbacks to invoke, unlocks, and
//! notifies — callbacks may therefore re-enter the engine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{PointsCallback, TrackCache};
use crate::detector::ChangeDetector;
use crate::error::Result;
use crate::fetch::{group_path, track_path, HttpFetcher, ResourceFetcher, MANIFEST_PATH};
use crate::listeners::{notify_each, ListenerId, ListenerSet};
use crate::types::{GroupDocument, Manifest, Point, TrackSummary};

/// Callback receiving `(group id, Some(tracks))` on membership change and
/// `(group id, None)` on removal.
pub type GroupCallback = dyn Fn(&str, Option<&[TrackSummary]>) + Send + Sync;

/// Callback receiving the live track id, or `None` when nothing is live.
pub type LiveCallback = dyn Fn(Option<&str>) + Send + Sync;

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL the resource paths are resolved against.
    pub base_url: String,
    /// Poll interval of the manifest timer.
    pub poll_interval: Duration,
    /// Per-request timeout; expiry counts as a fetch failure.
    pub fetch_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/data".to_string(),
            poll_interval: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Mutable engine state, guarded by one lock.
#[derive(Default)]
struct EngineState {
    cache: TrackCache,
    detector: ChangeDetector,
    group_listeners: ListenerSet<GroupCallback>,
    live_listeners: ListenerSet<LiveCallback>,
}

struct EngineShared {
    config: SyncConfig,
    fetcher: Arc<dyn ResourceFetcher>,
    state: Mutex<EngineState>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock_state(shared: &EngineShared) -> MutexGuard<'_, EngineState> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheaply-clonable handle to the synchronization engine.
///
/// All state (cache, watermarks, listeners) belongs to this instance;
/// there are no module-level singletons. Construct, `start`, and `stop`
/// explicitly.
#[derive(Clone)]
pub struct TrackSyncEngine {
    shared: Arc<EngineShared>,
}

impl TrackSyncEngine {
    /// Create an engine backed by an HTTP fetcher for `config.base_url`.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.base_url, config.fetch_timeout)?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    /// Create an engine over any fetcher implementation. Tests use an
    /// in-memory stub here to drive whole poll passes without a network.
    pub fn with_fetcher(config: SyncConfig, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                config,
                fetcher,
                state: Mutex::new(EngineState::default()),
                poll_task: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        lock_state(&self.shared)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the poll timer: one immediate pass, then one per configured
    /// interval. Must be called from within a tokio runtime. Calling
    /// `start` while the loop is already running is a no-op.
    pub fn start(&self) {
        let mut slot = self
            .shared
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("poll loop already running");
            return;
        }

        let engine = self.clone();
        let interval = self.shared.config.poll_interval;
        info!("starting poll loop (interval {interval:?})");
        *slot = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // First tick completes immediately; each pass runs to
                // completion before the timer is polled again.
                timer.tick().await;
                engine.poll_once().await;
            }
        }));
    }

    /// Stop the poll timer and release every cache entry, listener set,
    /// group list and watermark.
    pub fn stop(&self) {
        let task = self
            .shared
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let mut state = self.state();
        state.cache.clear();
        state.detector.clear();
        state.group_listeners.clear();
        state.live_listeners.clear();
        info!("engine stopped; cache and listeners released");
    }

    // ========================================================================
    // Poll pass
    // ========================================================================

    /// Run one full synchronization pass immediately.
    ///
    /// The poll loop calls this on every timer tick; tests call it to step
    /// the engine deterministically. Fetch errors never escape: a manifest
    /// failure skips the pass, a group or track failure skips that group
    /// or track.
    pub async fn poll_once(&self) {
        let manifest_value = match self.shared.fetcher.fetch_json(MANIFEST_PATH).await {
            Ok(value) => value,
            Err(e) => {
                warn!("manifest fetch failed, skipping pass: {e}");
                return;
            }
        };
        let manifest = Manifest::from_value(&manifest_value);

        self.process_groups(&manifest).await;
        self.process_removals(&manifest);
        self.process_live(&manifest);
        self.refresh_watched_tracks(&manifest).await;
    }

    /// Re-fetch every group whose manifest timestamp outran its watermark.
    async fn process_groups(&self, manifest: &Manifest) {
        let stale = self.state().detector.stale_groups(manifest);

        for (key, edited) in stale {
            let path = group_path(&key);
            let document = match self.shared.fetcher.fetch_json(&path).await {
                Ok(value) => match serde_json::from_value::<GroupDocument>(value) {
                    Ok(document) => document,
                    Err(e) => {
                        warn!("group '{key}' body unusable, retrying next pass: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    // Watermark stays put; the next pass retries this group
                    warn!("group '{key}' fetch failed, retrying next pass: {e}");
                    continue;
                }
            };

            let (changed, callbacks, tracks) = {
                let mut state = self.state();
                let changed = state.detector.commit_group(&key, edited, document.tracks);
                if changed {
                    let tracks = state
                        .detector
                        .group_tracks(&key)
                        .map(<[TrackSummary]>::to_vec)
                        .unwrap_or_default();
                    (true, state.group_listeners.callbacks(), tracks)
                } else {
                    (false, Vec::new(), Vec::new())
                }
            };

            if changed {
                debug!("group '{}' changed ({} tracks)", key, tracks.len());
                notify_each(&callbacks, "group change", |callback| {
                    callback(&key, Some(tracks.as_slice()))
                });
            }
        }
    }

    /// Evict groups that left the manifest and signal removal with `None`.
    fn process_removals(&self, manifest: &Manifest) {
        let (removed, callbacks) = {
            let mut state = self.state();
            let removed = state.detector.removed_groups(manifest);
            for key in &removed {
                state.detector.evict_group(key);
            }
            if removed.is_empty() {
                (removed, Vec::new())
            } else {
                (removed, state.group_listeners.callbacks())
            }
        };

        for key in &removed {
            info!("group '{key}' left the manifest; evicted");
            notify_each(&callbacks, "group removal", |callback| callback(key, None));
        }
    }

    /// Diff the live pointer and notify on identity change, including the
    /// transition to "nothing live".
    fn process_live(&self, manifest: &Manifest) {
        let live_id = manifest.live.as_ref().map(|live| live.id.clone());

        let (changed, callbacks) = {
            let mut state = self.state();
            let changed = state.detector.set_live(live_id.clone());
            if changed {
                (true, state.live_listeners.callbacks())
            } else {
                (false, Vec::new())
            }
        };

        if changed {
            info!("live track is now {live_id:?}");
            notify_each(&callbacks, "live change", |callback| {
                callback(live_id.as_deref())
            });
        }
    }

    /// Run the incremental refresh for every current group member, then the
    /// live track. Order within a pass is fixed: groups ascending by key,
    /// members in group order, live last.
    async fn refresh_watched_tracks(&self, manifest: &Manifest) {
        let mut targets: Vec<(String, usize)> = {
            let state = self.state();
            state
                .detector
                .groups()
                .flat_map(|(_, tracks)| {
                    tracks
                        .iter()
                        .map(|track| (track.id.clone(), track.point_count))
                })
                .collect()
        };
        if let Some(live) = &manifest.live {
            // The live entry carries the real count while the group index
            // shows a placeholder, so the live signal comes last and wins.
            targets.push((live.id.clone(), live.point_count));
        }

        for (track_id, reported_count) in targets {
            self.refresh_if_increased(&track_id, reported_count).await;
        }
    }

    /// Re-fetch a track's points when the reported count outgrew the cache.
    ///
    /// Never fetches for unwatched tracks, never fetches when the count
    /// did not increase, and never truncates. Listeners receive exactly
    /// the suffix past the previously cached length, in order.
    pub async fn refresh_if_increased(&self, track_id: &str, reported_count: usize) {
        if !self.state().cache.needs_refresh(track_id, reported_count) {
            return;
        }

        let fresh = match self.shared.fetcher.fetch_points(&track_path(track_id)).await {
            Ok(points) => points,
            Err(e) => {
                warn!("refresh fetch for '{track_id}' failed: {e}");
                return;
            }
        };

        // The entry may have been evicted while the fetch was in flight;
        // apply_refresh treats that straggler as a no-op.
        let outcome = self.state().cache.apply_refresh(track_id, fresh);
        if let Some(outcome) = outcome {
            debug!("track '{}': {} new points", track_id, outcome.delta.len());
            notify_each(&outcome.callbacks, "point delta", |callback| {
                callback(&outcome.delta)
            });
        }
    }

    // ========================================================================
    // Listener registration
    // ========================================================================

    /// Register a per-track point listener.
    ///
    /// The callback runs synchronously within this call with whatever
    /// points are available — a fresh full fetch for the first listener,
    /// the cached array for later ones — then receives only deltas. An
    /// initial-fetch error is returned to this caller alone; other tracks
    /// and listeners are unaffected.
    pub async fn register_listener(
        &self,
        track_id: &str,
        on_points: impl Fn(&[Point]) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let callback: Arc<PointsCallback> = Arc::new(on_points);

        let seed = if self.state().cache.needs_initial_fetch(track_id) {
            Some(self.shared.fetcher.fetch_points(&track_path(track_id)).await?)
        } else {
            None
        };

        let (listener_id, initial) =
            self.state()
                .cache
                .add_listener(track_id, seed, Arc::clone(&callback));

        debug!(
            "listener registered for '{}' ({} initial points)",
            track_id,
            initial.len()
        );
        notify_each(std::slice::from_ref(&callback), "initial points", |callback| {
            callback(&initial)
        });

        Ok(Subscription {
            shared: Arc::downgrade(&self.shared),
            kind: SubscriptionKind::Track {
                track_id: track_id.to_string(),
                id: listener_id,
            },
        })
    }

    /// Register a group-membership listener.
    ///
    /// Replays every known group synchronously before returning, so a late
    /// subscriber is never behind.
    pub fn register_group_listener(
        &self,
        on_group_change: impl Fn(&str, Option<&[TrackSummary]>) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Arc<GroupCallback> = Arc::new(on_group_change);

        let (id, snapshot) = {
            let mut state = self.state();
            let id = state.group_listeners.insert(Arc::clone(&callback));
            let snapshot: Vec<(String, Vec<TrackSummary>)> = state
                .detector
                .groups()
                .map(|(key, tracks)| (key.to_string(), tracks.to_vec()))
                .collect();
            (id, snapshot)
        };

        for (key, tracks) in &snapshot {
            notify_each(std::slice::from_ref(&callback), "group replay", |callback| {
                callback(key, Some(tracks.as_slice()))
            });
        }

        Subscription {
            shared: Arc::downgrade(&self.shared),
            kind: SubscriptionKind::Group(id),
        }
    }

    /// Register a live-track listener; called synchronously with the
    /// current live id (or `None`) before returning.
    pub fn register_live_listener(
        &self,
        on_live_change: impl Fn(Option<&str>) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Arc<LiveCallback> = Arc::new(on_live_change);

        let (id, live) = {
            let mut state = self.state();
            let id = state.live_listeners.insert(Arc::clone(&callback));
            (id, state.detector.live_id().map(str::to_string))
        };

        notify_each(std::slice::from_ref(&callback), "live replay", |callback| {
            callback(live.as_deref())
        });

        Subscription {
            shared: Arc::downgrade(&self.shared),
            kind: SubscriptionKind::Live(id),
        }
    }

    // ========================================================================
    // Cache-only reads
    // ========================================================================

    /// Cached track metadata for a group; empty when the group is unknown
    /// or was removed. Synchronous, never fetches.
    pub fn get_group_entities(&self, group_id: &str) -> Vec<TrackSummary> {
        self.state()
            .detector
            .group_tracks(group_id)
            .map(<[TrackSummary]>::to_vec)
            .unwrap_or_default()
    }

    /// Current group keys, ascending.
    pub fn group_ids(&self) -> Vec<String> {
        self.state().detector.group_ids()
    }

    /// Whether any track is currently live.
    pub fn has_live(&self) -> bool {
        self.state().detector.live_id().is_some()
    }

    /// The live track id, if any.
    pub fn get_live_id(&self) -> Option<String> {
        self.state().detector.live_id().map(str::to_string)
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug)]
enum SubscriptionKind {
    Track { track_id: String, id: ListenerId },
    Group(ListenerId),
    Live(ListenerId),
}

/// Disposer for a registered listener.
///
/// Holds only a weak reference to the engine; unregistering after the
/// engine is gone (or after `stop`) is a no-op. Dropping the subscription
/// without calling [`Subscription::unregister`] leaves the listener
/// registered for the engine's lifetime.
#[derive(Debug)]
pub struct Subscription {
    shared: Weak<EngineShared>,
    kind: SubscriptionKind,
}

impl Subscription {
    /// Remove the listener, effective immediately.
    ///
    /// For a track listener this may evict the cache entry and free its
    /// points (reference-count-to-zero); an in-flight fetch for that track
    /// then lands as a no-op.
    pub fn unregister(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = lock_state(&shared);
        match self.kind {
            SubscriptionKind::Track { track_id, id } => {
                state.cache.remove_listener(&track_id, id);
            }
            SubscriptionKind::Group(id) => {
                state.group_listeners.remove(id);
            }
            SubscriptionKind::Live(id) => {
                state.live_listeners.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unregister_after_engine_dropped_is_noop() {
        let engine = TrackSyncEngine::with_fetcher(
            SyncConfig::default(),
            Arc::new(NeverFetcher),
        );
        let subscription = engine.register_live_listener(|_live: Option<&str>| {});
        drop(engine);
        subscription.unregister();
    }

    struct NeverFetcher;

    #[async_trait::async_trait]
    impl ResourceFetcher for NeverFetcher {
        async fn fetch_text(&self, path: &str) -> Result<String> {
            Err(crate::error::SyncError::Http {
                path: path.to_string(),
                status: 404,
            })
        }
    }
}
