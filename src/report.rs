//! Outbound reporting of the run summary.
//!
//! Two hooks, both optional and best-effort: a webhook that receives the
//! full [`RunSummary`] as JSON, and a chat hook that receives a one-line
//! text digest. Reporting failures are logged and never change the job's
//! exit status.

use anyhow::{bail, Result};
use log::warn;

use crate::models::RunSummary;

/// Post the full summary JSON to the report webhook.
pub async fn post_webhook(
    client: &reqwest::Client,
    webhook_url: &str,
    summary: &RunSummary,
) -> Result<()> {
    let resp = client.post(webhook_url).json(summary).send().await?;
    if !resp.status().is_success() {
        bail!("report webhook returned HTTP {}", resp.status());
    }
    Ok(())
}

/// Post the one-line digest to the chat hook (`{"text": …}` payload).
pub async fn notify_chat(
    client: &reqwest::Client,
    webhook_url: &str,
    summary: &RunSummary,
) -> Result<()> {
    let payload = serde_json::json!({ "text": summary_text(summary) });
    let resp = client.post(webhook_url).json(&payload).send().await?;
    if !resp.status().is_success() {
        bail!("chat webhook returned HTTP {}", resp.status());
    }
    Ok(())
}

/// Fire both hooks where configured, logging failures.
pub async fn dispatch(
    client: &reqwest::Client,
    summary: &RunSummary,
    report_webhook_url: Option<&str>,
    chat_webhook_url: Option<&str>,
) {
    if let Some(url) = report_webhook_url {
        if let Err(e) = post_webhook(client, url, summary).await {
            warn!("report webhook failed: {e:#}");
        }
    }
    if let Some(url) = chat_webhook_url {
        if let Err(e) = notify_chat(client, url, summary).await {
            warn!("chat notification failed: {e:#}");
        }
    }
}

/// Human-readable digest for chat.
pub fn summary_text(summary: &RunSummary) -> String {
    let mut text = format!(
        "prerender: {}/{} rendered, {} synced to KV, {} synced to R2",
        summary.count_rendered,
        summary.total_targets,
        summary.count_kv_synced,
        summary.count_r2_synced,
    );
    if !summary.render_failures.is_empty() {
        text.push_str(&format!(
            ", {} render failures",
            summary.render_failures.len()
        ));
    }
    if !summary.sync_failures.is_empty() {
        text.push_str(&format!(", {} sync failures", summary.sync_failures.len()));
    }
    text
}
