use anyhow::{bail, Context, Result};
use url::Url;

use crate::keys;
use crate::sitemap::SitemapWindow;

/// User agent used when the job does not configure one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 prerender-bot";

/// Comma-separated extension of the ignored third-party host set.
const IGNORED_HOSTS_ENV: &str = "PRERENDER_IGNORED_HOSTS";

/// Validated job configuration, merged from CLI arguments and environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Normalized, validated seed URLs.
    pub urls: Vec<String>,
    /// The single host every target must live on.
    pub host: String,
    pub sitemap_url: Option<String>,
    pub sitemap_updated_within: SitemapWindow,
    pub user_agent: String,
    pub accept: Option<String>,
    pub concurrency: usize,
    /// TTL in seconds for both stores.
    pub cache_ttl: u64,
    pub skip_cache_sync: bool,
    pub skip_sitemap_parsing: bool,
    /// Extra hosts excluded from network-idleness tracking.
    pub ignored_hosts: Vec<String>,
    /// Present unless `skip_cache_sync`.
    pub r2: Option<R2Config>,
    /// Present unless `skip_cache_sync`.
    pub kv: Option<KvConfig>,
    pub report_webhook_url: Option<String>,
    pub chat_webhook_url: Option<String>,
}

/// R2 credentials and bucket, from environment.
#[derive(Debug, Clone)]
pub struct R2Config {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
}

impl R2Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            account_id: require_env("R2_ACCOUNT_ID")?,
            access_key_id: require_env("R2_ACCESS_KEY_ID")?,
            secret_access_key: require_env("R2_SECRET_ACCESS_KEY")?,
            bucket: require_env("R2_BUCKET")?,
        })
    }
}

/// Workers KV credentials and namespace, from environment.
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub account_id: String,
    pub api_token: String,
    pub namespace_id: String,
}

impl KvConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            account_id: require_env("CF_ACCOUNT_ID")?,
            api_token: require_env("CF_API_TOKEN")?,
            namespace_id: require_env("KV_NAMESPACE_ID")?,
        })
    }
}

/// Raw job parameters as they arrive from the CLI, before validation.
#[derive(Debug, Clone, Default)]
pub struct JobInput {
    pub urls: Vec<String>,
    pub sitemap_url: Option<String>,
    pub sitemap_updated_within: String,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub concurrency: usize,
    pub cache_ttl: u64,
    pub skip_cache_sync: bool,
    pub skip_sitemap_parsing: bool,
}

/// Validate the job input and pull credentials from the environment.
///
/// Every failure here is fatal: a misconfigured job exits non-zero before
/// touching the browser or the stores.
pub fn load_config(input: JobInput) -> Result<Config> {
    if input.urls.is_empty() && input.sitemap_url.is_none() {
        bail!("Nothing to render: provide at least one URL or --sitemap-url");
    }

    let mut urls = Vec::with_capacity(input.urls.len());
    for raw in &input.urls {
        let Some(normalized) = keys::normalize_target_url(raw) else {
            bail!("Invalid seed URL: '{}'", raw);
        };
        urls.push(normalized);
    }

    let host = shared_host(&urls, input.sitemap_url.as_deref())?;

    let sitemap_updated_within = if input.sitemap_updated_within.is_empty() {
        SitemapWindow::All
    } else {
        SitemapWindow::parse(&input.sitemap_updated_within)?
    };

    if input.concurrency < 1 {
        bail!("concurrency must be >= 1");
    }
    if input.cache_ttl < 1 {
        bail!("cache-ttl must be >= 1 second");
    }

    let (r2, kv) = if input.skip_cache_sync {
        (None, None)
    } else {
        (Some(R2Config::from_env()?), Some(KvConfig::from_env()?))
    };

    let ignored_hosts = std::env::var(IGNORED_HOSTS_ENV)
        .map(|v| {
            v.split(',')
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(Config {
        urls,
        host,
        sitemap_url: input.sitemap_url,
        sitemap_updated_within,
        user_agent: input
            .user_agent
            .filter(|ua| !ua.is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        accept: input.accept.filter(|a| !a.is_empty()),
        concurrency: input.concurrency,
        cache_ttl: input.cache_ttl,
        skip_cache_sync: input.skip_cache_sync,
        skip_sitemap_parsing: input.skip_sitemap_parsing,
        ignored_hosts,
        r2,
        kv,
        report_webhook_url: std::env::var("REPORT_WEBHOOK_URL").ok(),
        chat_webhook_url: std::env::var("CHAT_WEBHOOK_URL").ok(),
    })
}

/// All targets must live on one host; it anchors first-party request
/// tracking and sitemap filtering. Falls back to the sitemap URL's host
/// when no seeds were given.
fn shared_host(urls: &[String], sitemap_url: Option<&str>) -> Result<String> {
    let mut host: Option<String> = None;

    for url in urls {
        let parsed = Url::parse(url).with_context(|| format!("Invalid URL: '{}'", url))?;
        let Some(this_host) = parsed.host_str() else {
            bail!("URL has no host: '{}'", url);
        };
        match &host {
            None => host = Some(this_host.to_string()),
            Some(existing) if existing != this_host => {
                bail!(
                    "All URLs must share one host: found '{}' and '{}'",
                    existing,
                    this_host
                );
            }
            Some(_) => {}
        }
    }

    if let Some(host) = host {
        return Ok(host);
    }

    let sitemap_url = sitemap_url.expect("caller checked urls or sitemap present");
    let parsed =
        Url::parse(sitemap_url).with_context(|| format!("Invalid sitemap URL: '{}'", sitemap_url))?;
    parsed
        .host_str()
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("Sitemap URL has no host: '{}'", sitemap_url))
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} environment variable not set", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_host_accepts_one_host() {
        let urls = vec![
            "https://example.com/a".to_string(),
            "https://example.com/b?x=1".to_string(),
        ];
        assert_eq!(shared_host(&urls, None).unwrap(), "example.com");
    }

    #[test]
    fn test_shared_host_rejects_mixed_hosts() {
        let urls = vec![
            "https://example.com/a".to_string(),
            "https://sub.example.com/b".to_string(),
        ];
        assert!(shared_host(&urls, None).is_err());
    }

    #[test]
    fn test_shared_host_falls_back_to_sitemap() {
        assert_eq!(
            shared_host(&[], Some("https://example.com/sitemap.xml")).unwrap(),
            "example.com"
        );
    }
}
