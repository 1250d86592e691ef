//! End-to-end synchronization scenarios against a stub data source.
//!
//! Drives the engine through whole poll passes with canned JSON bodies,
//! asserting delta delivery, reference-count eviction, group removal and
//! live-pointer behavior without touching the network.
//!
//! Run with: `cargo test --test sync_scenarios`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracksync::{
    Point, ResourceFetcher, Result, SyncConfig, SyncError, TrackSummary, TrackSyncEngine,
};

// ============================================================================
// Stub data source
// ============================================================================

/// In-memory data source with per-path bodies and fetch counters.
#[derive(Default)]
struct StubFetcher {
    bodies: Mutex<HashMap<String, String>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl StubFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, path: &str, body: String) {
        self.bodies.lock().unwrap().insert(path.to_string(), body);
    }

    /// How many times a path was fetched.
    fn count(&self, path: &str) -> usize {
        *self.counts.lock().unwrap().get(path).unwrap_or(&0)
    }
}

#[async_trait]
impl ResourceFetcher for StubFetcher {
    async fn fetch_text(&self, path: &str) -> Result<String> {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert(0) += 1;
        match self.bodies.lock().unwrap().get(path) {
            Some(body) => Ok(body.clone()),
            None => Err(SyncError::Http {
                path: path.to_string(),
                status: 404,
            }),
        }
    }
}

// ============================================================================
// Body builders
// ============================================================================

fn point_json(seq: usize) -> String {
    format!(
        r#"{{"timestamp":"2025-06-01T12:{:02}:00+00:00","position":{{"lat":{},"lng":8.54}},"SOG":4.2,"seq":{}}}"#,
        seq % 60,
        47.2 + seq as f64 * 0.001,
        seq
    )
}

fn points_body(count: usize) -> String {
    let points: Vec<String> = (0..count).map(point_json).collect();
    format!(r#"{{"points":[{}]}}"#, points.join(","))
}

fn group_body(tracks: &[(&str, usize)]) -> String {
    let entries: Vec<String> = tracks
        .iter()
        .map(|(id, count)| format!(r#"{{"id":"{id}","pointCount":{count}}}"#))
        .collect();
    format!(r#"{{"tracks":[{}]}}"#, entries.join(","))
}

fn manifest_body(groups: &[(&str, &str)], live: Option<(&str, usize)>) -> String {
    let mut entries: Vec<String> = groups
        .iter()
        .map(|(key, edited)| format!(r#""{key}":{{"edited":"{edited}"}}"#))
        .collect();
    if let Some((id, count)) = live {
        entries.push(format!(r#""live":{{"id":"{id}","pointCount":{count}}}"#));
    }
    format!("{{{}}}", entries.join(","))
}

fn engine_with(fetcher: &Arc<StubFetcher>) -> TrackSyncEngine {
    TrackSyncEngine::with_fetcher(
        SyncConfig::default(),
        Arc::clone(fetcher) as Arc<dyn ResourceFetcher>,
    )
}

/// Helper: collect every point delivery for later inspection.
fn recording_listener() -> (
    Arc<Mutex<Vec<Vec<Point>>>>,
    impl Fn(&[Point]) + Send + Sync + 'static,
) {
    let deliveries: Arc<Mutex<Vec<Vec<Point>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    (deliveries, move |points: &[Point]| {
        sink.lock().unwrap().push(points.to_vec())
    })
}

fn seq_of(point: &Point) -> usize {
    point.telemetry["seq"].as_u64().unwrap() as usize
}

const T1: &str = "2025-06-01T13:00:00+00:00";
const T2: &str = "2025-06-01T14:00:00+00:00";
const TRACK: &str = "20250601-1200";

// ============================================================================
// Scenario A: initial full delivery, then exactly the delta
// ============================================================================

#[tokio::test]
async fn test_initial_points_then_delta_only() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fetcher = StubFetcher::new();
    fetcher.set("update.json", manifest_body(&[("2025", T1)], None));
    fetcher.set("tracks-2025.json", group_body(&[(TRACK, 3)]));
    fetcher.set("20250601-1200.json", points_body(3));

    let engine = engine_with(&fetcher);
    let (deliveries, listener) = recording_listener();
    let _subscription = engine.register_listener(TRACK, listener).await.unwrap();

    // Registration fetched once and delivered the full array synchronously
    assert_eq!(fetcher.count("20250601-1200.json"), 1);
    assert_eq!(deliveries.lock().unwrap().len(), 1);
    assert_eq!(deliveries.lock().unwrap()[0].len(), 3);

    // First pass: counts match the cache, nothing re-fetched
    engine.poll_once().await;
    assert_eq!(fetcher.count("20250601-1200.json"), 1);
    assert_eq!(deliveries.lock().unwrap().len(), 1);

    // Upstream grows to 5 points and the manifest advances
    fetcher.set("20250601-1200.json", points_body(5));
    fetcher.set("tracks-2025.json", group_body(&[(TRACK, 5)]));
    fetcher.set("update.json", manifest_body(&[("2025", T2)], None));
    engine.poll_once().await;

    // Exactly one additional fetch, delivering exactly the 2 new points
    assert_eq!(fetcher.count("20250601-1200.json"), 2);
    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 2);
    let delta: Vec<usize> = deliveries[1].iter().map(seq_of).collect();
    assert_eq!(delta, vec![3, 4]);
}

// ============================================================================
// Scenario B: group removal
// ============================================================================

#[tokio::test]
async fn test_group_removal_notifies_with_none() {
    let fetcher = StubFetcher::new();
    fetcher.set("update.json", manifest_body(&[("2025", T1)], None));
    fetcher.set("tracks-2025.json", group_body(&[(TRACK, 3)]));

    let engine = engine_with(&fetcher);
    let events: Arc<Mutex<Vec<(String, Option<usize>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _subscription =
        engine.register_group_listener(move |group: &str, tracks: Option<&[TrackSummary]>| {
            sink.lock()
                .unwrap()
                .push((group.to_string(), tracks.map(<[TrackSummary]>::len)));
        });

    engine.poll_once().await;
    assert_eq!(engine.group_ids(), vec!["2025".to_string()]);
    assert_eq!(engine.get_group_entities("2025").len(), 1);

    // The group disappears from the manifest entirely
    fetcher.set("update.json", "{}".to_string());
    engine.poll_once().await;

    let events = events.lock().unwrap();
    assert_eq!(events.last(), Some(&("2025".to_string(), None)));
    assert!(engine.get_group_entities("2025").is_empty());
    assert!(engine.group_ids().is_empty());
}

// ============================================================================
// Scenario C: live pointer cleared
// ============================================================================

#[tokio::test]
async fn test_live_cleared_notifies_exactly_once() {
    let fetcher = StubFetcher::new();
    fetcher.set("update.json", manifest_body(&[], Some(("X", 0))));

    let engine = engine_with(&fetcher);
    let calls: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let _subscription = engine.register_live_listener(move |live: Option<&str>| {
        sink.lock().unwrap().push(live.map(str::to_string));
    });

    // Immediate replay of current state (nothing live before the first pass)
    assert_eq!(*calls.lock().unwrap(), vec![None]);

    engine.poll_once().await;
    assert!(engine.has_live());
    assert_eq!(engine.get_live_id().as_deref(), Some("X"));
    assert_eq!(calls.lock().unwrap().last(), Some(&Some("X".to_string())));

    // Live session ends: the field disappears
    fetcher.set("update.json", manifest_body(&[], None));
    engine.poll_once().await;
    engine.poll_once().await;

    let calls = calls.lock().unwrap();
    assert_eq!(*calls, vec![None, Some("X".to_string()), None]);
    assert!(!engine.has_live());
    assert!(engine.get_live_id().is_none());
}

// ============================================================================
// Idempotent manifest timestamps
// ============================================================================

#[tokio::test]
async fn test_unchanged_manifest_causes_no_extra_fetches() {
    let fetcher = StubFetcher::new();
    fetcher.set("update.json", manifest_body(&[("2025", T1)], None));
    fetcher.set("tracks-2025.json", group_body(&[(TRACK, 3)]));
    fetcher.set("20250601-1200.json", points_body(3));

    let engine = engine_with(&fetcher);
    let (_deliveries, listener) = recording_listener();
    let _subscription = engine.register_listener(TRACK, listener).await.unwrap();

    engine.poll_once().await;
    engine.poll_once().await;
    engine.poll_once().await;

    // Only the cheap manifest probe repeats
    assert_eq!(fetcher.count("update.json"), 3);
    assert_eq!(fetcher.count("tracks-2025.json"), 1);
    assert_eq!(fetcher.count("20250601-1200.json"), 1);
}

// ============================================================================
// Reference-count eviction
// ============================================================================

#[tokio::test]
async fn test_refcount_eviction_and_refetch() {
    let fetcher = StubFetcher::new();
    fetcher.set("20250601-1200.json", points_body(3));

    let engine = engine_with(&fetcher);
    let (_first_deliveries, first) = recording_listener();
    let (second_deliveries, second) = recording_listener();

    let first_sub = engine.register_listener(TRACK, first).await.unwrap();
    let second_sub = engine.register_listener(TRACK, second).await.unwrap();

    // Second registration reuses the cached points: still one fetch
    assert_eq!(fetcher.count("20250601-1200.json"), 1);
    assert_eq!(second_deliveries.lock().unwrap()[0].len(), 3);

    // Dropping one listener keeps the entry and its points
    first_sub.unregister();
    let (third_deliveries, third) = recording_listener();
    let third_sub = engine.register_listener(TRACK, third).await.unwrap();
    assert_eq!(fetcher.count("20250601-1200.json"), 1);
    assert_eq!(third_deliveries.lock().unwrap()[0].len(), 3);

    // Dropping the last listener evicts; the next registration re-fetches
    second_sub.unregister();
    third_sub.unregister();
    let (_fourth_deliveries, fourth) = recording_listener();
    let _fourth_sub = engine.register_listener(TRACK, fourth).await.unwrap();
    assert_eq!(fetcher.count("20250601-1200.json"), 2);
}

// ============================================================================
// Listener isolation
// ============================================================================

#[tokio::test]
async fn test_panicking_listener_does_not_break_neighbors() {
    let fetcher = StubFetcher::new();
    fetcher.set("update.json", manifest_body(&[], Some((TRACK, 5))));
    fetcher.set("20250601-1200.json", points_body(3));

    let engine = engine_with(&fetcher);
    let _bad_sub = engine
        .register_listener(TRACK, |_points: &[Point]| panic!("bad consumer"))
        .await
        .unwrap();
    let (deliveries, listener) = recording_listener();
    let _good_sub = engine.register_listener(TRACK, listener).await.unwrap();

    // Grow the track; the panicking listener must not block the delta
    fetcher.set("20250601-1200.json", points_body(5));
    engine.poll_once().await;

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1].len(), 2);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_registration_fetch_error_propagates_to_caller_only() {
    let fetcher = StubFetcher::new();
    fetcher.set("other.json", points_body(2));

    let engine = engine_with(&fetcher);
    let error = engine
        .register_listener("missing", |_points: &[Point]| {})
        .await
        .unwrap_err();
    assert!(matches!(error, SyncError::Http { status: 404, .. }));

    // Other registrations are unaffected
    let (deliveries, listener) = recording_listener();
    let _subscription = engine.register_listener("other", listener).await.unwrap();
    assert_eq!(deliveries.lock().unwrap()[0].len(), 2);
}

#[tokio::test]
async fn test_group_fetch_failure_skips_group_and_retries_next_pass() {
    let fetcher = StubFetcher::new();
    fetcher.set(
        "update.json",
        manifest_body(&[("2025", T1), ("2026", T1)], None),
    );
    fetcher.set("tracks-2026.json", group_body(&[("20260101-0900", 4)]));
    // tracks-2025.json is missing for now

    let engine = engine_with(&fetcher);
    engine.poll_once().await;

    // The healthy group still came through
    assert_eq!(engine.group_ids(), vec!["2026".to_string()]);

    // The resource appears; an unchanged manifest still retries the group
    // because its watermark never advanced
    fetcher.set("tracks-2025.json", group_body(&[(TRACK, 3)]));
    engine.poll_once().await;

    assert_eq!(
        engine.group_ids(),
        vec!["2025".to_string(), "2026".to_string()]
    );
    assert_eq!(fetcher.count("tracks-2025.json"), 2);
    assert_eq!(fetcher.count("tracks-2026.json"), 1);
}

#[tokio::test]
async fn test_manifest_failure_aborts_pass_without_side_effects() {
    let fetcher = StubFetcher::new();
    // No manifest at all: every pass fails its probe and does nothing else
    fetcher.set("tracks-2025.json", group_body(&[(TRACK, 3)]));

    let engine = engine_with(&fetcher);
    engine.poll_once().await;
    engine.poll_once().await;

    assert_eq!(fetcher.count("update.json"), 2);
    assert_eq!(fetcher.count("tracks-2025.json"), 0);
    assert!(engine.group_ids().is_empty());
}

// ============================================================================
// Live track point growth
// ============================================================================

#[tokio::test]
async fn test_live_point_count_drives_refresh() {
    let fetcher = StubFetcher::new();
    fetcher.set("update.json", manifest_body(&[], Some(("live1", 2))));
    fetcher.set("live1.json", points_body(2));

    let engine = engine_with(&fetcher);
    let (deliveries, listener) = recording_listener();
    let _subscription = engine.register_listener("live1", listener).await.unwrap();
    engine.poll_once().await;
    assert_eq!(deliveries.lock().unwrap().len(), 1);

    // Two more points arrive on the live track
    fetcher.set("update.json", manifest_body(&[], Some(("live1", 4))));
    fetcher.set("live1.json", points_body(4));
    engine.poll_once().await;

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 2);
    let delta: Vec<usize> = deliveries[1].iter().map(seq_of).collect();
    assert_eq!(delta, vec![2, 3]);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_releases_state() {
    let fetcher = StubFetcher::new();
    fetcher.set("update.json", manifest_body(&[("2025", T1)], Some(("X", 0))));
    fetcher.set("tracks-2025.json", group_body(&[(TRACK, 3)]));
    fetcher.set("20250601-1200.json", points_body(3));

    let engine = engine_with(&fetcher);
    let (_deliveries, listener) = recording_listener();
    let subscription = engine.register_listener(TRACK, listener).await.unwrap();
    engine.start();
    engine.poll_once().await;
    assert!(engine.has_live());

    engine.stop();
    assert!(!engine.has_live());
    assert!(engine.group_ids().is_empty());

    // Unregistering a listener released by stop() is harmless
    subscription.unregister();
}
