//! Manifest change detection and group bookkeeping.
//!
//! Holds the per-group watermarks (last applied `edited` timestamps), the
//! track lists most recently delivered to group listeners, and the live
//! pointer. Decisions only — fetching and notification live in the engine.
//!
//! Watermarks move only after a successful fetch+apply for their group;
//! a skipped or failed group keeps its old watermark so the next tick
//! retries from scratch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;

use crate::types::{Manifest, TrackSummary};

/// Per-group synchronization state.
struct GroupState {
    watermark: DateTime<Utc>,
    tracks: Vec<TrackSummary>,
}

/// Decides which groups, and whether the live pointer, need refreshing.
#[derive(Default)]
pub struct ChangeDetector {
    groups: BTreeMap<String, GroupState>,
    live_id: Option<String>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manifest groups whose `edited` timestamp is strictly newer than the
    /// stored watermark (or that have no watermark yet), ascending key
    /// order. An equal or older timestamp leaves the group untouched.
    pub fn stale_groups(&self, manifest: &Manifest) -> Vec<(String, DateTime<Utc>)> {
        manifest
            .groups
            .iter()
            .filter(|(key, edited)| match self.groups.get(*key) {
                Some(state) => **edited > state.watermark,
                None => true,
            })
            .map(|(key, edited)| (key.clone(), *edited))
            .collect()
    }

    /// Previously delivered groups that no longer appear in the manifest —
    /// including keys whose `edited` became absent or unparsable, which the
    /// manifest parser already dropped.
    pub fn removed_groups(&self, manifest: &Manifest) -> Vec<String> {
        self.groups
            .keys()
            .filter(|key| !manifest.groups.contains_key(*key))
            .cloned()
            .collect()
    }

    /// Store a freshly fetched group and advance its watermark.
    ///
    /// Returns true when the delivered content actually changed: an
    /// `edited` bump with identical content moves the watermark but must
    /// not re-notify group listeners.
    pub fn commit_group(
        &mut self,
        key: &str,
        edited: DateTime<Utc>,
        tracks: Vec<TrackSummary>,
    ) -> bool {
        match self.groups.get_mut(key) {
            Some(state) => {
                state.watermark = edited;
                if state.tracks == tracks {
                    debug!("group '{key}' re-edited but content unchanged");
                    return false;
                }
                state.tracks = tracks;
                true
            }
            None => {
                self.groups
                    .insert(key.to_string(), GroupState { watermark: edited, tracks });
                true
            }
        }
    }

    /// Drop a group wholesale. Returns true when it was present.
    pub fn evict_group(&mut self, key: &str) -> bool {
        self.groups.remove(key).is_some()
    }

    /// Record the live pointer; true when the identity changed (including
    /// to or from "nothing live").
    pub fn set_live(&mut self, id: Option<String>) -> bool {
        if self.live_id == id {
            return false;
        }
        self.live_id = id;
        true
    }

    /// The current live track id, if any.
    pub fn live_id(&self) -> Option<&str> {
        self.live_id.as_deref()
    }

    /// Tracks last delivered for a group, `None` when unknown or removed.
    pub fn group_tracks(&self, key: &str) -> Option<&[TrackSummary]> {
        self.groups.get(key).map(|state| state.tracks.as_slice())
    }

    /// All current groups with their track lists, ascending key order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &[TrackSummary])> {
        self.groups
            .iter()
            .map(|(key, state)| (key.as_str(), state.tracks.as_slice()))
    }

    /// Current group keys, ascending.
    pub fn group_ids(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Drop all groups, watermarks and the live pointer.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.live_id = None;
    }
}
