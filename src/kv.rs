//! Cloudflare Workers KV client for the index records.
//!
//! Uses the KV REST API (`accounts/{account}/storage/kv/namespaces/{ns}/
//! values/{key}`) with a Bearer token. A 404 on read is translated to
//! `Ok(None)` at this boundary so the synchronizer never sees provider
//! error shapes.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::KvConfig;
use crate::r2::uri_encode;
use crate::store::KvStore;

const KV_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`KvStore`] implementation over the Workers KV REST API.
pub struct WorkersKvStore {
    config: KvConfig,
    client: reqwest::Client,
}

impl WorkersKvStore {
    pub fn new(config: KvConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { config, client })
    }

    fn value_url(&self, key: &str) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            KV_API_BASE,
            self.config.account_id,
            self.config.namespace_id,
            uri_encode(key)
        )
    }
}

#[async_trait]
impl KvStore for WorkersKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(self.value_url(key))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "KV read failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(200).collect::<String>()
            );
        }

        Ok(Some(resp.text().await?))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let url = format!("{}?expiration_ttl={}", self.value_url(key), ttl_secs);
        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.config.api_token)
            .body(value.to_string())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "KV write failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(200).collect::<String>()
            );
        }

        // The API wraps results in an envelope; a 2xx with success=false
        // still means the write did not land.
        if let Ok(envelope) = resp.json::<serde_json::Value>().await {
            if envelope.get("success").and_then(|v| v.as_bool()) == Some(false) {
                bail!("KV write reported failure for key '{}'", key);
            }
        }

        Ok(())
    }
}
