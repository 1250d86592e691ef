//! Wire types for the polled JSON resources.
//!
//! Three resource shapes exist upstream:
//! - the manifest (`update.json`): per-group `edited` timestamps plus an
//!   optional `live` pointer,
//! - one group resource per group key: `{ "tracks": [...] }`,
//! - one point resource per track id: `{ "points": [...] }` or an NDJSON
//!   record log.
//!
//! Point payloads are pass-through data: only `position` and `timestamp`
//! are named, everything else rides along untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Points
// ============================================================================

/// A GPS coordinate as published by the position feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

/// One telemetry sample on a track.
///
/// Telemetry field names are arbitrary (`"SOG"`, `"Depth"`, `"COG T"`, ...)
/// and are never interpreted here; they are carried for the consumers.
/// `position` and `timestamp` are optional so a structurally odd record
/// propagates as-is instead of being rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub telemetry: Map<String, Value>,
}

// ============================================================================
// Group resources
// ============================================================================

/// Track metadata as listed in a group resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub id: String,
    #[serde(default)]
    pub point_count: usize,
    /// Aggregate fields (total distance etc.) pass through unmodified.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Group resource body: `{ "tracks": [...] }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupDocument {
    #[serde(default)]
    pub tracks: Vec<TrackSummary>,
}

// ============================================================================
// Manifest
// ============================================================================

/// The manifest's `live` entry: the one track currently being extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEntry {
    pub id: String,
    #[serde(default)]
    pub point_count: usize,
}

/// Parsed manifest resource.
///
/// Keys other than `live` name groups; a group appears in `groups` only
/// when its `edited` timestamp is present and parsable. A key with a
/// missing or malformed timestamp counts as removed, exactly like a key
/// that is absent altogether.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Valid groups with their reported edit timestamps, ascending key order.
    pub groups: BTreeMap<String, DateTime<Utc>>,
    /// The live pointer, when anything is live.
    pub live: Option<LiveEntry>,
}

impl Manifest {
    /// Interpret a fetched manifest value.
    ///
    /// Never fails: an unusable entry is dropped (and thereby treated as a
    /// removal by the change detector), a non-object manifest yields an
    /// empty result.
    pub fn from_value(value: &Value) -> Self {
        let mut manifest = Manifest::default();
        let Some(object) = value.as_object() else {
            debug!("manifest body is not a JSON object; treating as empty");
            return manifest;
        };

        for (key, entry) in object {
            if key == "live" {
                // null or malformed live entries read as "nothing live"
                manifest.live = serde_json::from_value(entry.clone()).ok();
                continue;
            }

            let edited = entry
                .get("edited")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());
            match edited {
                Some(edited) => {
                    manifest.groups.insert(key.clone(), edited.with_timezone(&Utc));
                }
                None => {
                    debug!("manifest group '{key}' has no usable edited timestamp");
                }
            }
        }

        manifest
    }
}
