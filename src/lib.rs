//! # tracksync
//!
//! Incremental synchronization and caching engine for GPS track data
//! published as static JSON resources.
//!
//! The engine polls a lightweight manifest for per-group `edited`
//! timestamps, re-fetches only what moved, keeps exactly one cached copy
//! of each watched track's point history, and notifies listeners with just
//! the new points. Memory for a track is reclaimed the moment its last
//! listener unregisters.
//!
//! ## Quick start
//!
//! ```no_run
//! use tracksync::{SyncConfig, TrackSyncEngine};
//!
//! # async fn run() -> tracksync::Result<()> {
//! let engine = TrackSyncEngine::new(SyncConfig {
//!     base_url: "https://example.com/data".to_string(),
//!     ..SyncConfig::default()
//! })?;
//!
//! // Initial call delivers the full point array, later calls only deltas.
//! let subscription = engine
//!     .register_listener("20250601-1200", |points| {
//!         println!("{} new points", points.len());
//!     })
//!     .await?;
//!
//! engine.start();
//! // ... later: releases the track's cache entry if this was the last listener
//! subscription.unregister();
//! engine.stop();
//! # Ok(())
//! # }
//! ```

// Unified error handling
pub mod error;
pub use error::{Result, SyncError};

// Wire types for the polled JSON resources
pub mod types;
pub use types::{GroupDocument, LiveEntry, Manifest, Point, Position, TrackSummary};

// Resource fetching and the dual-mode point parser
pub mod fetch;
pub use fetch::{HttpFetcher, ResourceFetcher};

// Identity-keyed listener sets with isolated fan-out
pub mod listeners;
pub use listeners::{ListenerId, ListenerSet};

// Reference-counted per-track point cache
pub mod cache;
pub use cache::{PointsCallback, TrackCache};

// Manifest change detection and group bookkeeping
pub mod detector;
pub use detector::ChangeDetector;

// The orchestrating engine and its public API
pub mod engine;
pub use engine::{GroupCallback, LiveCallback, Subscription, SyncConfig, TrackSyncEngine};
