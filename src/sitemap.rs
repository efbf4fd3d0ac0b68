//! Sitemap discovery: expand the seed list from `sitemap.xml`.
//!
//! Fetches the configured sitemap, parses `<urlset>` entries and recurses
//! into `<sitemapindex>` children, and keeps entries on the job's host
//! whose `lastmod` falls inside the requested freshness window. The XML
//! here is shallow and regular, so it is scanned with plain string
//! searches rather than a parser dependency.
//!
//! Discovery is best-effort: a sitemap that cannot be fetched or parsed is
//! logged and contributes nothing, and the job proceeds with its seeds.

use std::collections::HashSet;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::warn;
use url::Url;

/// Upper bound on sitemap fetches per job, index recursion included.
const MAX_SITEMAP_FETCHES: usize = 50;

/// Freshness window applied to sitemap `lastmod` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitemapWindow {
    OneDay,
    ThreeDays,
    SevenDays,
    ThirtyDays,
    All,
}

impl SitemapWindow {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "1d" => Ok(Self::OneDay),
            "3d" => Ok(Self::ThreeDays),
            "7d" => Ok(Self::SevenDays),
            "30d" => Ok(Self::ThirtyDays),
            "all" => Ok(Self::All),
            other => bail!("Unknown sitemap window: '{}'. Use 1d, 3d, 7d, 30d, or all.", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneDay => "1d",
            Self::ThreeDays => "3d",
            Self::SevenDays => "7d",
            Self::ThirtyDays => "30d",
            Self::All => "all",
        }
    }

    fn max_age(&self) -> Option<Duration> {
        match self {
            Self::OneDay => Some(Duration::days(1)),
            Self::ThreeDays => Some(Duration::days(3)),
            Self::SevenDays => Some(Duration::days(7)),
            Self::ThirtyDays => Some(Duration::days(30)),
            Self::All => None,
        }
    }
}

/// One `<url>` entry from a sitemap.
#[derive(Debug, Clone)]
struct SitemapEntry {
    loc: String,
    lastmod: Option<DateTime<Utc>>,
}

/// Fetch a sitemap (recursing into index children) and return the entry
/// URLs on `allowed_host` that pass the freshness window.
pub async fn collect_sitemap_targets(
    client: &reqwest::Client,
    sitemap_url: &str,
    window: SitemapWindow,
    allowed_host: &str,
) -> Vec<String> {
    let now = Utc::now();
    let mut collected = Vec::new();
    let mut visited = HashSet::new();
    collect_recursive(
        client,
        sitemap_url,
        window,
        allowed_host,
        now,
        &mut collected,
        &mut visited,
    )
    .await;
    collected
}

#[allow(clippy::too_many_arguments)]
async fn collect_recursive(
    client: &reqwest::Client,
    sitemap_url: &str,
    window: SitemapWindow,
    allowed_host: &str,
    now: DateTime<Utc>,
    collected: &mut Vec<String>,
    visited: &mut HashSet<String>,
) {
    if visited.len() >= MAX_SITEMAP_FETCHES || !visited.insert(sitemap_url.to_string()) {
        return;
    }

    let xml = match fetch_sitemap(client, sitemap_url).await {
        Ok(xml) => xml,
        Err(e) => {
            warn!("sitemap fetch failed for {sitemap_url}: {e:#}");
            return;
        }
    };

    let (entries, children) = parse_sitemap(&xml);

    for entry in entries {
        if !entry_selected(&entry, window, allowed_host, now) {
            continue;
        }
        collected.push(entry.loc);
    }

    for child in children {
        Box::pin(collect_recursive(
            client,
            &child,
            window,
            allowed_host,
            now,
            collected,
            visited,
        ))
        .await;
    }
}

async fn fetch_sitemap(client: &reqwest::Client, sitemap_url: &str) -> Result<String> {
    let resp = client.get(sitemap_url).send().await?;
    if !resp.status().is_success() {
        bail!("HTTP {}", resp.status());
    }
    Ok(resp.text().await?)
}

fn entry_selected(
    entry: &SitemapEntry,
    window: SitemapWindow,
    allowed_host: &str,
    now: DateTime<Utc>,
) -> bool {
    let on_host = Url::parse(&entry.loc)
        .ok()
        .and_then(|u| u.host_str().map(|h| h == allowed_host))
        .unwrap_or(false);
    if !on_host {
        return false;
    }

    match window.max_age() {
        None => true,
        // A windowed run only re-renders entries that can prove freshness.
        Some(max_age) => entry
            .lastmod
            .map(|lastmod| now.signed_duration_since(lastmod) <= max_age)
            .unwrap_or(false),
    }
}

/// Parse a sitemap document into its `<url>` entries and `<sitemap>`
/// children (for index files). Unknown or malformed blocks are skipped.
fn parse_sitemap(xml: &str) -> (Vec<SitemapEntry>, Vec<String>) {
    let mut entries = Vec::new();
    for block in scan_blocks(xml, "url") {
        let Some(loc) = extract_xml_value(block, "loc") else {
            continue;
        };
        if loc.is_empty() {
            continue;
        }
        entries.push(SitemapEntry {
            loc,
            lastmod: extract_xml_value(block, "lastmod").and_then(|v| parse_lastmod(&v)),
        });
    }

    let mut children = Vec::new();
    for block in scan_blocks(xml, "sitemap") {
        if let Some(loc) = extract_xml_value(block, "loc") {
            if !loc.is_empty() {
                children.push(loc);
            }
        }
    }

    (entries, children)
}

/// Yield the inner text of each `<tag>…</tag>` block. `<url>` does not
/// match `<urlset>` because the opening tag is matched with its closing
/// angle bracket.
fn scan_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    let mut blocks = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        let block_start = start + open.len();
        let Some(end) = remaining[block_start..].find(&close) else {
            break;
        };
        blocks.push(&remaining[block_start..block_start + end]);
        remaining = &remaining[block_start + end + close.len()..];
    }
    blocks
}

/// Pull the trimmed text between `<tag>` and `</tag>`. Sitemap fields are
/// flat, so nesting never comes up.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)?;
    let value_start = start + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].trim().to_string())
}

/// Sitemaps carry either full RFC 3339 timestamps or bare dates.
fn parse_lastmod(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
