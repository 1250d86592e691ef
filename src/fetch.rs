//! Resource fetching and the dual-mode point parser.
//!
//! All upstream data is static JSON under one base URL:
//! - `update.json` — the manifest,
//! - `tracks-<group>.json` — one group index per group key,
//! - `<track id>.json` — per-track point data, either an object with a
//!   `points` array or a newline-delimited record log.
//!
//! Fetches do not retry; the poll loop's next tick is the retry.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::types::Point;

/// Path of the manifest resource under the base URL.
pub const MANIFEST_PATH: &str = "update.json";

/// Path of the group resource for a group key.
pub fn group_path(group: &str) -> String {
    format!("tracks-{group}.json")
}

/// Path of the point resource for a track id.
pub fn track_path(track_id: &str) -> String {
    format!("{track_id}.json")
}

#[derive(Debug, Default, Deserialize)]
struct PointsDocument {
    #[serde(default)]
    points: Vec<Point>,
}

/// Parse a point resource body.
///
/// Modes are attempted in a fixed, documented order:
/// 1. NDJSON — only when the body holds multiple newline-separated
///    top-level values; each non-empty line is parsed independently and
///    the result is the concatenation of the successfully parsed lines.
/// 2. Object form `{ "points": [...] }`, `points` defaulting to empty
///    when the field is absent.
///
/// A mode failing on its own never surfaces an error; only a body that
/// yields no NDJSON records and fails the object parse returns `Parse`.
pub fn parse_points(path: &str, body: &str) -> Result<Vec<Point>> {
    let lines: Vec<&str> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.len() > 1 {
        let records: Vec<Point> = lines
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if !records.is_empty() {
            debug!(
                "parsed {}/{} NDJSON records from '{}'",
                records.len(),
                lines.len(),
                path
            );
            return Ok(records);
        }
    }

    let document: PointsDocument = serde_json::from_str(body).map_err(|e| SyncError::Parse {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    Ok(document.points)
}

/// Read side of the static JSON data source.
///
/// The engine only talks to the data source through this trait, so tests
/// can substitute an in-memory stub and count fetches per path.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the raw body of a resource under the base URL. No retries.
    async fn fetch_text(&self, path: &str) -> Result<String>;

    /// Fetch a resource and parse it as a single JSON value.
    async fn fetch_json(&self, path: &str) -> Result<Value> {
        let body = self.fetch_text(path).await?;
        serde_json::from_str(&body).map_err(|e| SyncError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Fetch a point resource using the dual-mode parse.
    async fn fetch_points(&self, path: &str) -> Result<Vec<Point>> {
        let body = self.fetch_text(path).await?;
        parse_points(path, &body)
    }
}

/// HTTP implementation backed by a pooled reqwest client.
pub struct HttpFetcher {
    client: Client,
    base_url: String,
}

impl HttpFetcher {
    /// Build a fetcher for `base_url` with a bounded per-request timeout.
    /// Timeout expiry surfaces as a `Network` error like any other
    /// transport failure.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network {
                path: base_url.to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch_text(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Network {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Http {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| SyncError::Network {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}
