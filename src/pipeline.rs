//! Pipeline orchestration: fixed-size concurrent batches over the URL set.
//!
//! The target list is partitioned into batches of `concurrency`; each batch
//! spawns one task per URL and waits for the whole batch before the next
//! one starts (a strict barrier — the single backpressure knob). Each task
//! runs Render → Analyze → Sync; a failed stage short-circuits the rest for
//! that URL and is recorded in the per-URL result. Nothing here retries and
//! nothing aborts the batch: URL-level failures are data, not errors.

use std::sync::Arc;

use chromiumoxide::browser::Browser;
use log::{error, info};
use url::Url;

use crate::keys;
use crate::models::{PipelineResult, RunSummary, SyncSettings};
use crate::render::{self, RenderOptions};
use crate::seo;
use crate::store::{BlobStore, KvStore};
use crate::sync;

/// The two production stores, absent when `--skip-cache-sync` is set.
#[derive(Clone)]
pub struct PipelineStores {
    pub blob: Arc<dyn BlobStore>,
    pub kv: Arc<dyn KvStore>,
}

/// Everything one pipeline invocation needs besides the browser.
pub struct PipelineContext {
    pub render_options: RenderOptions,
    pub sync_settings: SyncSettings,
    pub stores: Option<PipelineStores>,
    pub concurrency: usize,
}

/// Run the full pipeline over a deduplicated target list.
pub async fn run_pipeline(
    browser: Arc<Browser>,
    targets: Vec<String>,
    ctx: Arc<PipelineContext>,
) -> RunSummary {
    let concurrency = ctx.concurrency.max(1);
    let cache_sync_enabled = ctx.stores.is_some();
    let mut results = Vec::with_capacity(targets.len());

    for batch in targets.chunks(concurrency) {
        let handles: Vec<_> = batch
            .iter()
            .map(|url| {
                let browser = Arc::clone(&browser);
                let ctx = Arc::clone(&ctx);
                let url = url.clone();
                tokio::spawn(async move { process_target(&browser, &url, &ctx).await })
            })
            .collect();

        // Barrier: the next batch starts only after every task has settled.
        for (url, handle) in batch.iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("pipeline task for {url} died: {e}");
                    results.push(PipelineResult::failed(url.clone()));
                }
            }
        }
    }

    summarize(results, cache_sync_enabled)
}

async fn process_target(
    browser: &Browser,
    target_url: &str,
    ctx: &PipelineContext,
) -> PipelineResult {
    // Fail closed: a target that cannot produce a cache key never reaches
    // the browser.
    let parsed = match Url::parse(target_url) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("skipping unparsable target {target_url}: {e}");
            return PipelineResult::failed(target_url);
        }
    };
    if let Err(e) = keys::build_kv_key(&parsed) {
        error!("skipping target without a cache key {target_url}: {e:#}");
        return PipelineResult::failed(target_url);
    }

    let rendered = match render::render_page(browser, target_url, &ctx.render_options).await {
        Ok(rendered) => rendered,
        Err(e) => {
            error!("render failed for {target_url}: {e:#}");
            return PipelineResult::failed(target_url);
        }
    };
    info!(
        "rendered {target_url} (HTTP {}, {})",
        rendered.status_code,
        rendered.ready_reason.as_str()
    );

    let analysis = seo::analyze(
        &rendered.html,
        rendered.status_code,
        &rendered.final_url,
        rendered.x_robots_tag.as_deref(),
    );

    let mut result = PipelineResult {
        url: target_url.to_string(),
        is_rendered: true,
        is_analyzed: true,
        is_cached_to_r2: false,
        is_cached_to_kv: false,
    };

    let Some(stores) = &ctx.stores else {
        return result;
    };

    let outcome = sync::sync_rendered_page(
        stores.blob.as_ref(),
        stores.kv.as_ref(),
        target_url,
        &rendered.final_url,
        &rendered.html,
        &analysis,
        &ctx.sync_settings,
    )
    .await;
    result.is_cached_to_r2 = outcome.r2_synced;
    result.is_cached_to_kv = outcome.kv_synced;

    result
}

/// Aggregate per-URL results into the run summary.
fn summarize(results: Vec<PipelineResult>, cache_sync_enabled: bool) -> RunSummary {
    let render_failures: Vec<String> = results
        .iter()
        .filter(|r| !r.is_rendered)
        .map(|r| r.url.clone())
        .collect();

    let sync_failures: Vec<String> = if cache_sync_enabled {
        results
            .iter()
            .filter(|r| r.is_rendered && !(r.is_cached_to_r2 && r.is_cached_to_kv))
            .map(|r| r.url.clone())
            .collect()
    } else {
        Vec::new()
    };

    RunSummary {
        total_targets: results.len(),
        count_rendered: results.iter().filter(|r| r.is_rendered).count(),
        count_analyzed: results.iter().filter(|r| r.is_analyzed).count(),
        count_kv_synced: results.iter().filter(|r| r.is_cached_to_kv).count(),
        count_r2_synced: results.iter().filter(|r| r.is_cached_to_r2).count(),
        render_failures,
        sync_failures,
        results,
    }
}
