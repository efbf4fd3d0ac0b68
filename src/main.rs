//! # Prerender CLI
//!
//! The `prerender` binary runs one batch prerendering job: render the given
//! URLs (plus sitemap discoveries) through a headless browser and publish
//! the snapshots to R2 + Workers KV.
//!
//! ## Usage
//!
//! ```bash
//! prerender run https://example.com/ https://example.com/pricing \
//!     --sitemap-url https://example.com/sitemap.xml \
//!     --sitemap-updated-within 7d \
//!     --concurrency 3
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `prerender run` | Render the target set and sync it into the cache |
//! | `prerender plan` | Resolve and print the target set without rendering |
//!
//! ## Environment
//!
//! | Variable | Purpose |
//! |----------|---------|
//! | `R2_ACCOUNT_ID` / `R2_ACCESS_KEY_ID` / `R2_SECRET_ACCESS_KEY` / `R2_BUCKET` | Blob store credentials |
//! | `CF_ACCOUNT_ID` / `CF_API_TOKEN` / `KV_NAMESPACE_ID` | Workers KV credentials |
//! | `REPORT_WEBHOOK_URL` / `CHAT_WEBHOOK_URL` | Optional result hooks |
//! | `PRERENDER_IGNORED_HOSTS` | Extra third-party hosts to ignore |
//! | `RUST_LOG` | Log filter (e.g. `prerender=debug`) |
//!
//! Credentials are required unless `--skip-cache-sync` is set. Fatal
//! conditions (invalid configuration, browser launch failure) exit
//! non-zero; per-URL failures are reported in the summary instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use log::warn;

use prerender::config::{self, Config, JobInput};
use prerender::keys;
use prerender::kv::WorkersKvStore;
use prerender::models::{RunSummary, SyncSettings};
use prerender::pipeline::{self, PipelineContext, PipelineStores};
use prerender::r2::R2BlobStore;
use prerender::render::{self, RenderOptions};
use prerender::report;
use prerender::sitemap;

/// Prerender — batch-render JavaScript pages to static HTML and publish
/// them to a two-tier cache.
#[derive(Parser)]
#[command(
    name = "prerender",
    about = "Batch prerendering pipeline: headless renders published to R2 + Workers KV",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the target set and sync the snapshots into the cache.
    Run(JobArgs),

    /// Resolve and print the deduplicated target set without rendering.
    ///
    /// Fetches and filters the sitemap exactly like `run`, so the printed
    /// list is the list `run` would process.
    Plan(JobArgs),
}

/// Job parameters shared by `run` and `plan`.
#[derive(Args)]
struct JobArgs {
    /// Seed URLs to render; all must live on one host.
    urls: Vec<String>,

    /// Sitemap to expand the target set from.
    #[arg(long)]
    sitemap_url: Option<String>,

    /// Only take sitemap entries modified within this window.
    #[arg(long, default_value = "all", value_parser = ["1d", "3d", "7d", "30d", "all"])]
    sitemap_updated_within: String,

    /// User agent for rendering (and sitemap fetches).
    #[arg(long)]
    user_agent: Option<String>,

    /// `Accept` request header override for renders.
    #[arg(long)]
    accept: Option<String>,

    /// Parallel renders per batch.
    #[arg(long, default_value_t = 3)]
    concurrency: usize,

    /// TTL in seconds for the KV record and blob cache-control.
    #[arg(long, default_value_t = 86_400)]
    cache_ttl: u64,

    /// Render and analyze only; do not touch R2 or KV.
    #[arg(long)]
    skip_cache_sync: bool,

    /// Ignore the sitemap even when --sitemap-url is set.
    #[arg(long)]
    skip_sitemap_parsing: bool,
}

impl From<JobArgs> for JobInput {
    fn from(args: JobArgs) -> Self {
        JobInput {
            urls: args.urls,
            sitemap_url: args.sitemap_url,
            sitemap_updated_within: args.sitemap_updated_within,
            user_agent: args.user_agent,
            accept: args.accept,
            concurrency: args.concurrency,
            cache_ttl: args.cache_ttl,
            skip_cache_sync: args.skip_cache_sync,
            skip_sitemap_parsing: args.skip_sitemap_parsing,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(config::load_config(args.into())?).await,
        Commands::Plan(args) => plan(config::load_config(args.into())?).await,
    }
}

/// Build the HTTP client used for sitemap fetches and reporting.
fn http_client(config: &Config) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(30))
        .build()?)
}

/// Seeds plus sitemap discoveries, normalized and deduplicated.
async fn resolve_targets(config: &Config, http: &reqwest::Client) -> Vec<String> {
    let mut targets = config.urls.clone();

    if !config.skip_sitemap_parsing {
        if let Some(sitemap_url) = &config.sitemap_url {
            let discovered = sitemap::collect_sitemap_targets(
                http,
                sitemap_url,
                config.sitemap_updated_within,
                &config.host,
            )
            .await;
            targets.extend(
                discovered
                    .into_iter()
                    .filter_map(|url| keys::normalize_target_url(&url)),
            );
        }
    }

    keys::dedupe_targets(targets)
}

async fn plan(config: Config) -> Result<()> {
    let http = http_client(&config)?;
    let targets = resolve_targets(&config, &http).await;

    println!("plan");
    println!("  host: {}", config.host);
    println!("  seeds: {}", config.urls.len());
    println!("  window: {}", config.sitemap_updated_within.as_str());
    println!("  targets: {}", targets.len());
    for url in &targets {
        println!("  {}", url);
    }
    println!("ok");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let http = http_client(&config)?;
    let targets = resolve_targets(&config, &http).await;

    if targets.is_empty() {
        println!("prerender run");
        println!("  targets: 0");
        println!("ok");
        return Ok(());
    }

    let stores = if config.skip_cache_sync {
        None
    } else {
        let r2 = config
            .r2
            .clone()
            .ok_or_else(|| anyhow!("R2 configuration missing"))?;
        let kv = config
            .kv
            .clone()
            .ok_or_else(|| anyhow!("KV configuration missing"))?;
        Some(PipelineStores {
            blob: Arc::new(R2BlobStore::new(r2)),
            kv: Arc::new(WorkersKvStore::new(kv)?),
        })
    };

    let mut render_options = RenderOptions::new(config.user_agent.clone());
    render_options.accept = config.accept.clone();
    render_options.extra_ignored_hosts = config.ignored_hosts.clone();

    let ctx = Arc::new(PipelineContext {
        render_options,
        sync_settings: SyncSettings {
            cache_ttl: config.cache_ttl,
            user_agent: config.user_agent.clone(),
            accept: config.accept.clone(),
        },
        stores,
        concurrency: config.concurrency,
    });

    // A browser that cannot launch is fatal; per-URL failures are not.
    let (browser, handler_task) = render::launch_browser().await?;
    let browser = Arc::new(browser);

    let summary = pipeline::run_pipeline(Arc::clone(&browser), targets, ctx).await;

    match Arc::try_unwrap(browser) {
        Ok(mut browser) => {
            if let Err(e) = browser.close().await {
                warn!("browser close failed: {e}");
            }
            let _ = browser.wait().await;
        }
        Err(_) => warn!("browser still referenced at shutdown; skipping close"),
    }
    handler_task.abort();

    print_summary(&summary);
    report::dispatch(
        &http,
        &summary,
        config.report_webhook_url.as_deref(),
        config.chat_webhook_url.as_deref(),
    )
    .await;

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("prerender run");
    println!("  targets: {}", summary.total_targets);
    println!("  rendered: {}", summary.count_rendered);
    println!("  analyzed: {}", summary.count_analyzed);
    println!("  synced to r2: {}", summary.count_r2_synced);
    println!("  synced to kv: {}", summary.count_kv_synced);
    if !summary.render_failures.is_empty() {
        println!("  render failures:");
        for url in &summary.render_failures {
            println!("    {}", url);
        }
    }
    if !summary.sync_failures.is_empty() {
        println!("  sync failures:");
        for url in &summary.sync_failures {
            println!("    {}", url);
        }
    }
    println!("ok");
}
