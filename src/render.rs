//! Render driver: take one URL through a headless browser tab.
//!
//! Per render: open a fresh tab, install the pre-navigation instrumentation
//! (prerender sentinel + DOM mutation observer), subscribe to the network
//! request lifecycle, navigate, hand control to the readiness controller,
//! and capture the DOM-serialized HTML plus the navigation response's
//! status and `X-Robots-Tag`. The tab is closed on every exit path; the
//! browser itself is shared and owned by the orchestrator.
//!
//! The instrumentation must be installed through the browser's
//! on-new-document hook *before* navigation starts — an observer attached
//! after first paint misses the initial mutation burst and reports the DOM
//! stable too early.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, Headers, ResourceType, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use log::{debug, warn};
use tokio::task::JoinHandle;
use url::Url;

use crate::models::RenderedPage;
use crate::readiness::{self, PageProbe, ReadinessConfig, RequestTracker, HARD_TIMEOUT_MS};

/// Marker header identifying prerender traffic to the origin.
const RENDER_MARKER_HEADER: &str = "x-lovablehtml-render";

/// Script installed before every document in the tab is created.
///
/// Sets the prerender sentinel, seeds the last-DOM-change clock, and arms a
/// whole-tree mutation observer as soon as `document.documentElement`
/// exists.
const BOOTSTRAP_JS: &str = r#"
(() => {
  window.__TO_HTML = true;
  window.__lastDomChange = Date.now();
  const arm = () => {
    if (!document.documentElement) {
      setTimeout(arm, 5);
      return;
    }
    new MutationObserver(() => {
      window.__lastDomChange = Date.now();
    }).observe(document.documentElement, {
      childList: true,
      subtree: true,
      attributes: true,
      characterData: true,
    });
  };
  arm();
})();
"#;

const APP_SIGNAL_JS: &str = "window.prerenderReady === true || window.htmlSnapshot === true";

const DOM_IDLE_JS: &str = "Date.now() - (window.__lastDomChange || Date.now())";

/// Per-render options derived from the job configuration.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub user_agent: String,
    pub accept: Option<String>,
    pub readiness: ReadinessConfig,
    pub extra_ignored_hosts: Vec<String>,
    /// Budget for `goto` + load. Twice the readiness hard timeout: slow
    /// origins get their chance, but the readiness budget stays intact.
    pub navigation_timeout: Duration,
}

impl RenderOptions {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            accept: None,
            readiness: ReadinessConfig::default(),
            extra_ignored_hosts: Vec::new(),
            navigation_timeout: Duration::from_millis(2 * HARD_TIMEOUT_MS),
        }
    }
}

/// Launch the shared headless browser and spawn its CDP message pump.
///
/// The returned task drives the connection and must stay alive for as long
/// as the browser is in use; abort it after the browser closes.
pub async fn launch_browser() -> Result<(Browser, JoinHandle<()>)> {
    let config = BrowserConfig::builder()
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-gpu")
        .arg("--hide-scrollbars")
        .build()
        .map_err(|e| anyhow!("browser config error: {e}"))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("Failed to launch browser")?;

    let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

    Ok((browser, handler_task))
}

/// Render one URL to a snapshot.
///
/// Any readiness outcome is a success; failures here are navigation or
/// protocol errors. The tab is closed before returning, success or not.
pub async fn render_page(
    browser: &Browser,
    target_url: &str,
    options: &RenderOptions,
) -> Result<RenderedPage> {
    let target = Url::parse(target_url).with_context(|| format!("invalid URL: {target_url}"))?;
    let host = target
        .host_str()
        .ok_or_else(|| anyhow!("URL has no host: {target_url}"))?
        .to_string();

    let guard = TabGuard::new(
        browser
            .new_page("about:blank")
            .await
            .context("Failed to open tab")?,
        target_url,
    );
    let page = guard.page();

    page.set_user_agent(options.user_agent.as_str())
        .await
        .context("Failed to set user agent")?;

    page.execute(EnableParams::default())
        .await
        .context("Failed to enable network tracking")?;

    let mut header_map = serde_json::Map::new();
    header_map.insert(
        "Accept-Language".to_string(),
        serde_json::Value::String("en-US,en;q=0.9".to_string()),
    );
    header_map.insert(
        RENDER_MARKER_HEADER.to_string(),
        serde_json::Value::String("true".to_string()),
    );
    if let Some(accept) = &options.accept {
        header_map.insert(
            "Accept".to_string(),
            serde_json::Value::String(accept.clone()),
        );
    }
    let headers_params = SetExtraHttpHeadersParams::builder()
        .headers(Headers::new(serde_json::Value::Object(header_map)))
        .build()
        .map_err(|e| anyhow!("invalid extra headers: {e}"))?;
    page.execute(headers_params)
        .await
        .context("Failed to set extra headers")?;

    let bootstrap = AddScriptToEvaluateOnNewDocumentParams::builder()
        .source(BOOTSTRAP_JS)
        .build()
        .map_err(|e| anyhow!("invalid bootstrap script: {e}"))?;
    page.execute(bootstrap)
        .await
        .context("Failed to install pre-navigation instrumentation")?;

    let tracker = Arc::new(
        RequestTracker::new(host).with_extra_ignored_hosts(&options.extra_ignored_hosts),
    );
    let nav_response: Arc<Mutex<Option<NavResponse>>> = Arc::new(Mutex::new(None));
    let telemetry = spawn_telemetry(page, Arc::clone(&tracker), Arc::clone(&nav_response)).await?;
    let _telemetry_guard = AbortOnDrop(telemetry.abort_handle());

    let navigation = async {
        page.goto(target_url).await.map_err(|e| anyhow!("{e}"))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| anyhow!("{e}"))?;
        Ok::<_, anyhow::Error>(())
    };
    match tokio::time::timeout(options.navigation_timeout, navigation).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => bail!("Failed to navigate to {target_url}: {e}"),
        Err(_) => bail!(
            "Failed to navigate to {target_url}: timed out after {:?}",
            options.navigation_timeout
        ),
    }

    let probe = LivePage { page };
    let ready_reason = readiness::wait_for_ready(&probe, &tracker, &options.readiness).await;
    debug!("{target_url} ready: {}", ready_reason.as_str());

    let html = page
        .content()
        .await
        .context("Failed to capture rendered HTML")?;
    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| target_url.to_string());

    let nav = nav_response
        .lock()
        .expect("navigation response slot poisoned")
        .clone();
    let (status_code, x_robots_tag) = match nav {
        Some(nav) => (nav.status, nav.x_robots_tag),
        None => (200, None),
    };

    guard.close().await;

    Ok(RenderedPage {
        html,
        status_code,
        final_url,
        x_robots_tag,
        ready_reason,
    })
}

/// The navigation response as observed on the CDP event stream.
#[derive(Debug, Clone)]
struct NavResponse {
    status: u16,
    x_robots_tag: Option<String>,
}

/// Subscribe to the page's request lifecycle and pump events into the
/// tracker. The first Document-type response is the navigation response
/// (Chrome emits it first even across redirects) and supplies the status
/// code and `X-Robots-Tag`.
async fn spawn_telemetry(
    page: &Page,
    tracker: Arc<RequestTracker>,
    nav_response: Arc<Mutex<Option<NavResponse>>>,
) -> Result<JoinHandle<()>> {
    let mut started = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .context("Failed to subscribe to request events")?;
    let mut finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .context("Failed to subscribe to loading-finished events")?;
    let mut failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .context("Failed to subscribe to loading-failed events")?;
    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .context("Failed to subscribe to response events")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = started.next() => {
                    let Some(event) = event else { break };
                    if let Some(resource_type) = &event.r#type {
                        tracker.request_started(
                            event.request_id.inner(),
                            &event.request.url,
                            resource_tag(resource_type),
                        );
                    }
                }
                event = finished.next() => {
                    let Some(event) = event else { break };
                    tracker.request_finished(event.request_id.inner());
                }
                event = failed.next() => {
                    let Some(event) = event else { break };
                    tracker.request_failed(event.request_id.inner());
                }
                event = responses.next() => {
                    let Some(event) = event else { break };
                    if event.r#type == ResourceType::Document {
                        let mut slot = nav_response
                            .lock()
                            .expect("navigation response slot poisoned");
                        if slot.is_none() {
                            *slot = Some(NavResponse {
                                status: event.response.status as u16,
                                x_robots_tag: header_value(&event.response.headers, "x-robots-tag"),
                            });
                        }
                    }
                }
            }
        }
    }))
}

/// Map a CDP resource type onto the tracker's lowercase tag vocabulary.
fn resource_tag(resource_type: &ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Document => "document",
        ResourceType::Stylesheet => "stylesheet",
        ResourceType::Image => "image",
        ResourceType::Font => "font",
        ResourceType::Script => "script",
        ResourceType::Xhr => "xhr",
        ResourceType::Fetch => "fetch",
        ResourceType::Media => "media",
        ResourceType::WebSocket => "websocket",
        ResourceType::Ping => "ping",
        _ => "other",
    }
}

/// Case-insensitive header lookup on a CDP header map.
fn header_value(headers: &Headers, name: &str) -> Option<String> {
    let value = serde_json::to_value(headers).ok()?;
    value.as_object()?.iter().find_map(|(header, v)| {
        if header.eq_ignore_ascii_case(name) {
            v.as_str().map(str::to_string)
        } else {
            None
        }
    })
}

/// Live [`PageProbe`]: evaluates the readiness observables in the page.
struct LivePage<'a> {
    page: &'a Page,
}

#[async_trait]
impl PageProbe for LivePage<'_> {
    async fn app_signaled(&self) -> Result<bool> {
        let value = self.page.evaluate(APP_SIGNAL_JS).await?;
        Ok(value.into_value::<bool>()?)
    }

    async fn ms_since_dom_change(&self) -> Result<f64> {
        let value = self.page.evaluate(DOM_IDLE_JS).await?;
        Ok(value.into_value::<f64>()?)
    }
}

/// RAII guard for a browser tab.
///
/// `Page` has no Drop of its own; the CDP target must be closed
/// explicitly. The success path calls [`TabGuard::close`] and awaits it;
/// error paths fall back to a spawned close from `Drop`.
struct TabGuard {
    page: Option<Page>,
    url: String,
}

impl TabGuard {
    fn new(page: Page, url: &str) -> Self {
        Self {
            page: Some(page),
            url: url.to_string(),
        }
    }

    fn page(&self) -> &Page {
        self.page.as_ref().expect("tab already closed")
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("failed to close tab for {}: {e}", self.url);
            }
        }
    }
}

impl Drop for TabGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            let url = self.url.clone();
            tokio::spawn(async move {
                if let Err(e) = page.close().await {
                    warn!("tab cleanup failed for {url}: {e}");
                }
            });
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
