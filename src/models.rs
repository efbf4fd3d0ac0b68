//! Core data models used throughout the prerender pipeline.
//!
//! These types represent the pages, index records, and results that flow
//! through the render and publish pipeline. The data lifecycle is:
//!
//! ```text
//! URL → render() → RenderedPage → analyze() → SeoAnalysis
//!                                      ↓
//!                         sync() → IndexRecord (KV) + blob (R2)
//!                                      ↓
//!                              PipelineResult → RunSummary
//! ```
//!
//! # Type Relationships
//!
//! - A **[`RenderedPage`]** is the raw capture of one browser render:
//!   DOM-serialized HTML plus the response status, final URL, and the
//!   readiness reason that ended the wait.
//! - An **[`IndexRecord`]** is the KV value describing the current blob for
//!   a canonical URL. A record exists iff the corresponding blob exists or
//!   existed; the synchronizer uploads the blob before flipping the record.
//! - A **[`PipelineResult`]** records which stages succeeded for one URL.
//! - A **[`RunSummary`]** aggregates a whole batch job for reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::readiness::ReadyReason;

/// The outcome of successfully rendering one URL in the headless browser.
///
/// | Field | Description |
/// |-------|-------------|
/// | `html` | DOM-serialized HTML at snapshot time (UTF-8) |
/// | `status_code` | HTTP status of the navigation response (100–599) |
/// | `final_url` | URL after redirects; may differ from the target |
/// | `x_robots_tag` | `X-Robots-Tag` response header, if present |
/// | `ready_reason` | Why the readiness controller stopped waiting |
///
/// All four readiness reasons are successes: a `HardTimeout` render still
/// carries whatever HTML was in the DOM at the deadline.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// DOM-serialized HTML captured from the live page.
    pub html: String,
    /// HTTP status code of the navigation response.
    pub status_code: u16,
    /// The page's final URL after any redirects.
    pub final_url: String,
    /// Value of the `X-Robots-Tag` response header, if the server sent one.
    pub x_robots_tag: Option<String>,
    /// The termination reason reported by the readiness controller.
    pub ready_reason: ReadyReason,
}

/// The KV value describing the current blob for a canonical URL.
///
/// Serialized as camelCase JSON for wire compatibility with existing
/// records. `url` keeps the original render target; the cache keys are
/// derived from the final URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    /// The original target URL this record was produced for.
    pub url: String,
    /// Blob store key holding the HTML body.
    pub object_key: String,
    /// Lowercase hex SHA-256 of the HTML body.
    pub digest: String,
    /// Creation instant (ISO-8601).
    pub created_at: DateTime<Utc>,
    /// Always `text/html; charset=utf-8`.
    pub content_type: String,
    /// Body length in bytes.
    pub content_length: u64,
    /// Cache key schema version.
    pub cache_version: String,
    /// User agent the page was rendered with.
    pub user_agent: String,
    /// `Accept` header override used for the render, if any.
    pub accept: Option<String>,
}

/// Settings the synchronizer needs beyond the stores themselves.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// TTL in seconds applied to both the KV record and the blob cache-control.
    pub cache_ttl: u64,
    /// User agent recorded in the index record and blob metadata.
    pub user_agent: String,
    /// `Accept` header override recorded alongside the user agent.
    pub accept: Option<String>,
}

/// Per-URL pipeline outcome: which stages completed.
///
/// A failure at any stage short-circuits the remaining stages for that URL,
/// so `is_analyzed` implies `is_rendered`, and the sync flags imply both.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// The target URL as it entered the pipeline.
    pub url: String,
    /// The browser produced a snapshot for this URL.
    pub is_rendered: bool,
    /// SEO analysis ran over the snapshot.
    pub is_analyzed: bool,
    /// The HTML body was uploaded to the blob store.
    pub is_cached_to_r2: bool,
    /// The index record was written to KV.
    pub is_cached_to_kv: bool,
}

impl PipelineResult {
    /// A result with every stage failed, used for URLs that never started
    /// (unparsable target) or whose task died.
    pub fn failed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_rendered: false,
            is_analyzed: false,
            is_cached_to_r2: false,
            is_cached_to_kv: false,
        }
    }
}

/// Aggregate outcome of one batch job, reported to stdout and the webhooks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Total number of targets the pipeline attempted.
    pub total_targets: usize,
    /// URLs that produced a snapshot.
    pub count_rendered: usize,
    /// URLs whose snapshot was analyzed.
    pub count_analyzed: usize,
    /// URLs whose index record reached KV.
    pub count_kv_synced: usize,
    /// URLs whose body reached the blob store.
    pub count_r2_synced: usize,
    /// URLs that failed to render.
    pub render_failures: Vec<String>,
    /// URLs that rendered but failed either sync side.
    pub sync_failures: Vec<String>,
    /// Per-URL stage outcomes.
    pub results: Vec<PipelineResult>,
}
