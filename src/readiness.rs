//! Render readiness: decide the earliest safe point to snapshot a page.
//!
//! A `load` event is not enough for single-page applications — the shell
//! document loads long before the content exists — and waiting a fixed
//! interval wastes the job's wall-clock budget. The controller instead
//! combines three observables under a hard deadline:
//!
//! 1. **App signal** — page scripts may set `window.prerenderReady = true`
//!    (or `window.htmlSnapshot = true`) to declare the page snapshot-ready.
//!    This wins immediately.
//! 2. **Network idleness** — no in-flight first-party requests of a
//!    content-bearing resource type for [`NETWORK_QUIET_MS`]. Third-party
//!    analytics/fonts/ads/error-reporting hosts are ignored so a slow
//!    tracking pixel cannot hold the snapshot hostage.
//! 3. **DOM stability** — no mutation observed for [`DOM_STABLE_MS`],
//!    measured by an observer installed before the document was created.
//!
//! # Decision procedure
//!
//! Once per [`POLL_INTERVAL_MS`], in order: hard deadline, app signal,
//! network + DOM bookkeeping, then the two combined exits. Pages whose DOM
//! never settles (carousels, tickers) fall through to
//! [`ReadyReason::NetworkStableDomTimeout`] once the network has been quiet
//! and the extended DOM window has expired; everything else hits the
//! 15-second [`ReadyReason::HardTimeout`]. Every reason is a success — the
//! driver snapshots whatever is in the DOM at that moment.
//!
//! # Concurrency
//!
//! The pending-request set is written by the CDP event task and read by the
//! polling loop, both on the same runtime. It sits behind a `std` mutex;
//! no lock is held across an await point.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use url::Url;

/// Absolute ceiling on the readiness wait, in milliseconds.
pub const HARD_TIMEOUT_MS: u64 = 15_000;

/// The pending-request set must be empty for this long before the network
/// counts as stable.
pub const NETWORK_QUIET_MS: u64 = 500;

/// The DOM must go unmutated for this long before it counts as stable.
pub const DOM_STABLE_MS: u64 = 300;

/// Cadence of the polling loop.
pub const POLL_INTERVAL_MS: u64 = 100;

/// Minimum wait before the network-only exit may fire.
pub const MIN_WAIT_MS: u64 = 500;

/// Extra budget granted to a never-settling DOM once the network is quiet.
pub const DOM_EXTENDED_WAIT_MS: u64 = 3_000;

/// Third-party hosts whose requests never count toward network idleness:
/// analytics, tag managers, fonts, ads, session-replay, support widgets,
/// and error reporting. A host matches an entry exactly or as a subdomain.
pub const IGNORED_THIRD_PARTY_HOSTS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "fonts.googleapis.com",
    "fonts.gstatic.com",
    "analytics.google.com",
    "facebook.com",
    "connect.facebook.net",
    "doubleclick.net",
    "googlesyndication.com",
    "hotjar.com",
    "hotjar.io",
    "clarity.ms",
    "segment.io",
    "segment.com",
    "mixpanel.com",
    "amplitude.com",
    "posthog.com",
    "intercom.io",
    "crisp.chat",
    "sentry.io",
];

/// Resource types that count toward first-party network idleness. Media,
/// websockets, pings and the like are excluded: they can stay open forever.
const TRACKED_RESOURCE_TYPES: &[&str] = &[
    "document",
    "script",
    "xhr",
    "fetch",
    "stylesheet",
    "image",
    "font",
];

/// Why the readiness controller stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyReason {
    /// The page set `window.prerenderReady` or `window.htmlSnapshot`.
    AppSignaled,
    /// First-party network and DOM both went quiet.
    NetworkAndDomStable,
    /// Network quiet, but the DOM never settled within the extended window.
    NetworkStableDomTimeout,
    /// The hard deadline expired.
    HardTimeout,
}

impl ReadyReason {
    /// Stable string form, used in logs and blob metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyReason::AppSignaled => "app_signaled",
            ReadyReason::NetworkAndDomStable => "network_and_dom_stable",
            ReadyReason::NetworkStableDomTimeout => "network_stable_dom_timeout",
            ReadyReason::HardTimeout => "hard_timeout",
        }
    }
}

/// Tunable thresholds for one readiness wait. [`Default`] yields the
/// normative constants; tests shrink them to keep scenarios fast.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub hard_timeout: Duration,
    pub network_quiet: Duration,
    pub dom_stable: Duration,
    pub poll_interval: Duration,
    pub min_wait: Duration,
    pub dom_extended_wait: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            hard_timeout: Duration::from_millis(HARD_TIMEOUT_MS),
            network_quiet: Duration::from_millis(NETWORK_QUIET_MS),
            dom_stable: Duration::from_millis(DOM_STABLE_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            min_wait: Duration::from_millis(MIN_WAIT_MS),
            dom_extended_wait: Duration::from_millis(DOM_EXTENDED_WAIT_MS),
        }
    }
}

/// The two page observables the polling loop cannot derive from request
/// events. The live implementation evaluates JavaScript in the page; tests
/// script both against the (paused) tokio clock.
#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Whether the page has declared itself snapshot-ready. Evaluation
    /// failures are treated as "not signaled".
    async fn app_signaled(&self) -> Result<bool>;

    /// Milliseconds since the last observed DOM mutation. Evaluation
    /// failures are treated as zero (the DOM appears active).
    async fn ms_since_dom_change(&self) -> Result<f64>;
}

/// Tracks in-flight first-party requests for one page.
///
/// Request-lifecycle callbacks add and remove entries; the polling loop
/// reads the count. A request is tracked iff its URL has a parsable host,
/// the host is not in the ignored third-party set, the host equals the
/// render target's host, and the resource type is content-bearing.
pub struct RequestTracker {
    target_host: String,
    extra_ignored_hosts: Vec<String>,
    pending: Mutex<HashSet<String>>,
}

impl RequestTracker {
    /// Create a tracker for a page served from `target_host`.
    pub fn new(target_host: impl Into<String>) -> Self {
        Self {
            target_host: target_host.into(),
            extra_ignored_hosts: Vec::new(),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Extend the ignored third-party set with configured hosts.
    pub fn with_extra_ignored_hosts(mut self, hosts: &[String]) -> Self {
        self.extra_ignored_hosts = hosts.to_vec();
        self
    }

    /// Record a request start. Untracked requests are ignored entirely.
    pub fn request_started(&self, request_id: &str, url: &str, resource_type: &str) {
        if !self.should_track(url, resource_type) {
            return;
        }
        self.pending_set().insert(request_id.to_string());
    }

    /// Record a request completing normally.
    pub fn request_finished(&self, request_id: &str) {
        self.pending_set().remove(request_id);
    }

    /// Record a request failing. Failures release the slot just like
    /// completions do.
    pub fn request_failed(&self, request_id: &str) {
        self.pending_set().remove(request_id);
    }

    /// Number of in-flight tracked requests.
    pub fn pending_count(&self) -> usize {
        self.pending_set().len()
    }

    fn should_track(&self, url: &str, resource_type: &str) -> bool {
        if !TRACKED_RESOURCE_TYPES.contains(&resource_type) {
            return false;
        }
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(String::from)) else {
            return false;
        };
        if self.is_ignored_host(&host) {
            return false;
        }
        host == self.target_host
    }

    fn is_ignored_host(&self, host: &str) -> bool {
        IGNORED_THIRD_PARTY_HOSTS
            .iter()
            .any(|entry| host_matches(host, entry))
            || self
                .extra_ignored_hosts
                .iter()
                .any(|entry| host_matches(host, entry))
    }

    fn pending_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.pending.lock().expect("pending request set poisoned")
    }
}

/// Exact match or subdomain match (`host` ends with `.entry`).
fn host_matches(host: &str, entry: &str) -> bool {
    host == entry || host.ends_with(&format!(".{}", entry))
}

/// Wait until the page is safe to snapshot and report why.
///
/// Called after the browser reports a completed initial navigation. Polls
/// at [`POLL_INTERVAL_MS`] and returns exactly once; no observable is
/// consulted after the reason is emitted.
pub async fn wait_for_ready(
    probe: &dyn PageProbe,
    tracker: &RequestTracker,
    config: &ReadinessConfig,
) -> ReadyReason {
    let started = Instant::now();
    let mut network_idle_since: Option<Instant> = None;
    let mut dom_stable_since: Option<Instant> = None;

    loop {
        let now = Instant::now();
        let elapsed = now.duration_since(started);

        if elapsed >= config.hard_timeout {
            return ReadyReason::HardTimeout;
        }

        if probe.app_signaled().await.unwrap_or(false) {
            return ReadyReason::AppSignaled;
        }

        if tracker.pending_count() == 0 {
            if network_idle_since.is_none() {
                network_idle_since = Some(now);
            }
        } else {
            network_idle_since = None;
        }

        let dom_idle_ms = probe.ms_since_dom_change().await.unwrap_or(0.0);
        if dom_idle_ms >= config.dom_stable.as_millis() as f64 {
            if dom_stable_since.is_none() {
                dom_stable_since = Some(now);
            }
        } else {
            dom_stable_since = None;
        }

        let network_idle_for = network_idle_since
            .map(|since| now.duration_since(since))
            .unwrap_or(Duration::ZERO);
        let network_stable = network_idle_for >= config.network_quiet;
        let dom_stable = dom_stable_since.is_some();

        if network_stable && dom_stable {
            return ReadyReason::NetworkAndDomStable;
        }

        if elapsed >= config.min_wait
            && network_stable
            && elapsed >= config.min_wait + config.dom_extended_wait
        {
            return ReadyReason::NetworkStableDomTimeout;
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RequestTracker {
        RequestTracker::new("example.com")
    }

    #[test]
    fn test_tracks_first_party_content_request() {
        let t = tracker();
        t.request_started("1", "https://example.com/api/data", "fetch");
        assert_eq!(t.pending_count(), 1);
        t.request_finished("1");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_failure_releases_pending_slot() {
        let t = tracker();
        t.request_started("1", "https://example.com/app.js", "script");
        t.request_failed("1");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_ignores_third_party_host() {
        let t = tracker();
        t.request_started("1", "https://cdn.other.com/lib.js", "script");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_ignores_analytics_host_and_subdomains() {
        let t = tracker();
        t.request_started("1", "https://google-analytics.com/collect", "xhr");
        t.request_started("2", "https://www.google-analytics.com/collect", "xhr");
        t.request_started("3", "https://o1234.ingest.sentry.io/api/envelope", "fetch");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_suffix_matching_is_not_substring_matching() {
        // "notsentry.io" must not match the "sentry.io" entry.
        let t = RequestTracker::new("notsentry.io");
        t.request_started("1", "https://notsentry.io/api", "fetch");
        assert_eq!(t.pending_count(), 1);
    }

    #[test]
    fn test_ignores_untracked_resource_types() {
        let t = tracker();
        t.request_started("1", "https://example.com/stream", "websocket");
        t.request_started("2", "https://example.com/video.mp4", "media");
        t.request_started("3", "https://example.com/ping", "ping");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_ignores_unparsable_urls() {
        let t = tracker();
        t.request_started("1", "not a url at all", "fetch");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_extra_ignored_hosts() {
        let t = RequestTracker::new("example.com")
            .with_extra_ignored_hosts(&["example.com".to_string()]);
        t.request_started("1", "https://example.com/api", "fetch");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_request_ids_collapse() {
        let t = tracker();
        t.request_started("1", "https://example.com/a", "fetch");
        t.request_started("1", "https://example.com/a", "fetch");
        assert_eq!(t.pending_count(), 1);
        t.request_finished("1");
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_ready_reason_strings() {
        assert_eq!(ReadyReason::AppSignaled.as_str(), "app_signaled");
        assert_eq!(ReadyReason::HardTimeout.as_str(), "hard_timeout");
    }
}
