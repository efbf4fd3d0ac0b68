//! Cache synchronizer: publish a rendered page into the two-tier store.
//!
//! One invocation per successfully rendered URL, ordered so readers never
//! follow a dangling index pointer:
//!
//! 1. Upload the new HTML body to the blob store.
//! 2. Read the prior index record; if it points at a *different* blob,
//!    delete that blob (best-effort — a failed delete orphans a blob that
//!    will TTL-expire, which is acceptable).
//! 3. Write the new index record with the cache TTL.
//!
//! The blob goes up before the index flips: a reader racing the flip finds
//! either the old record (old blob still present) or the new record (new
//! blob already present). The synchronizer never rolls back a successful
//! blob put on KV failure and never retries — the next run's invalidation
//! step reclaims anything left behind.

use chrono::Utc;
use log::{error, warn};
use url::Url;

use crate::keys;
use crate::models::{IndexRecord, SyncSettings};
use crate::seo::SeoAnalysis;
use crate::store::{BlobStore, BlobUpload, KvStore};

/// Content type recorded on every blob and index record.
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Which sides of the two-tier store were updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub kv_synced: bool,
    pub r2_synced: bool,
}

impl SyncOutcome {
    fn nothing() -> Self {
        Self {
            kv_synced: false,
            r2_synced: false,
        }
    }
}

/// Publish one rendered page.
///
/// Both cache keys are derived from `final_url` (the URL after redirects);
/// the index record's `url` field keeps the original `target_url`. All
/// failures are absorbed into the returned [`SyncOutcome`] — a URL-level
/// sync problem must never abort the batch.
pub async fn sync_rendered_page(
    blob: &dyn BlobStore,
    kv: &dyn KvStore,
    target_url: &str,
    final_url: &str,
    html: &str,
    seo: &SeoAnalysis,
    settings: &SyncSettings,
) -> SyncOutcome {
    let url = match Url::parse(final_url) {
        Ok(url) => url,
        Err(e) => {
            error!("cache sync skipped, final URL does not parse: {final_url}: {e}");
            return SyncOutcome::nothing();
        }
    };

    let digest = keys::sha256_hex(html);
    let created_at = Utc::now();

    let object_key = match keys::build_object_key(&url, &digest, created_at) {
        Ok(key) => key,
        Err(e) => {
            error!("cache sync skipped for {final_url}: {e:#}");
            return SyncOutcome::nothing();
        }
    };
    let kv_key = match keys::build_kv_key(&url) {
        Ok(key) => key,
        Err(e) => {
            error!("cache sync skipped for {final_url}: {e:#}");
            return SyncOutcome::nothing();
        }
    };

    let body = html.as_bytes().to_vec();
    let record = IndexRecord {
        url: target_url.to_string(),
        object_key: object_key.clone(),
        digest: digest.clone(),
        created_at,
        content_type: HTML_CONTENT_TYPE.to_string(),
        content_length: body.len() as u64,
        cache_version: keys::CACHE_VERSION.to_string(),
        user_agent: settings.user_agent.clone(),
        accept: settings.accept.clone(),
    };

    let mut metadata = seo.to_metadata();
    metadata.insert("url".to_string(), record.url.clone());
    metadata.insert("digest".to_string(), digest);
    metadata.insert("createdAt".to_string(), created_at.to_rfc3339());
    metadata.insert("cacheVersion".to_string(), record.cache_version.clone());
    metadata.insert("userAgent".to_string(), record.user_agent.clone());
    metadata.insert(
        "accept".to_string(),
        record.accept.clone().unwrap_or_default(),
    );

    let ttl = settings.cache_ttl;
    let upload = BlobUpload {
        key: object_key.clone(),
        body,
        content_type: HTML_CONTENT_TYPE.to_string(),
        cache_control: format!("public, max-age={ttl}, s-maxage={ttl}"),
        metadata,
    };

    if let Err(e) = blob.put(upload).await {
        error!("blob put failed for {final_url} ({object_key}): {e:#}");
        return SyncOutcome::nothing();
    }

    invalidate_stale_blob(blob, kv, &kv_key, &object_key).await;

    let value = match serde_json::to_string(&record) {
        Ok(value) => value,
        Err(e) => {
            error!("index record for {final_url} does not serialize: {e}");
            return SyncOutcome {
                kv_synced: false,
                r2_synced: true,
            };
        }
    };

    match kv.put(&kv_key, &value, ttl).await {
        Ok(()) => SyncOutcome {
            kv_synced: true,
            r2_synced: true,
        },
        Err(e) => {
            error!("index record put failed for {kv_key}: {e:#}");
            SyncOutcome {
                kv_synced: false,
                r2_synced: true,
            }
        }
    }
}

/// Delete the blob the prior index record points at, if it is not the one
/// just uploaded. Every failure here is logged and swallowed; the index
/// flip must not depend on cleanup succeeding.
async fn invalidate_stale_blob(
    blob: &dyn BlobStore,
    kv: &dyn KvStore,
    kv_key: &str,
    new_object_key: &str,
) {
    let prior = match kv.get(kv_key).await {
        Ok(Some(value)) => value,
        Ok(None) => return,
        Err(e) => {
            warn!("could not read prior index record at {kv_key}: {e:#}");
            return;
        }
    };

    let record: IndexRecord = match serde_json::from_str(&prior) {
        Ok(record) => record,
        Err(e) => {
            warn!("prior index record at {kv_key} does not parse, leaving blob alone: {e}");
            return;
        }
    };

    // Equal keys can only happen on clock-resolution collisions.
    if record.object_key == new_object_key {
        return;
    }

    if let Err(e) = blob.delete(&record.object_key).await {
        warn!(
            "failed to delete stale blob {} (will TTL-expire): {e:#}",
            record.object_key
        );
    }
}
