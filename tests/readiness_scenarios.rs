//! Clock-driven scenarios for the readiness controller.
//!
//! These run under paused tokio time (`start_paused`), so the 15-second
//! hard-timeout scenario completes instantly and every assertion about
//! elapsed time is deterministic: the runtime auto-advances the clock to
//! the next pending timer instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use prerender::readiness::{
    wait_for_ready, PageProbe, ReadinessConfig, ReadyReason, RequestTracker,
};

/// A page whose observables follow a fixed schedule relative to its start.
struct ScriptedPage {
    started: Instant,
    /// Elapsed millis at which the app signal flips on, if ever.
    app_signal_at: Option<u64>,
    /// Whether reading the app signal throws.
    app_signal_fails: bool,
    dom: DomSchedule,
}

enum DomSchedule {
    /// Last mutation happens at this elapsed offset; quiet afterwards.
    QuietAfter(u64),
    /// Mutations repeat every `n` millis forever.
    Every(u64),
    /// Reading the mutation clock throws.
    Fails,
}

impl ScriptedPage {
    fn new(dom: DomSchedule) -> Self {
        Self {
            started: Instant::now(),
            app_signal_at: None,
            app_signal_fails: false,
            dom,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[async_trait]
impl PageProbe for ScriptedPage {
    async fn app_signaled(&self) -> Result<bool> {
        if self.app_signal_fails {
            bail!("evaluation failed");
        }
        Ok(self
            .app_signal_at
            .map(|at| self.elapsed_ms() >= at)
            .unwrap_or(false))
    }

    async fn ms_since_dom_change(&self) -> Result<f64> {
        let elapsed = self.elapsed_ms();
        match self.dom {
            DomSchedule::QuietAfter(at) => Ok(elapsed.saturating_sub(at) as f64),
            DomSchedule::Every(n) => Ok((elapsed % n) as f64),
            DomSchedule::Fails => bail!("evaluation failed"),
        }
    }
}

/// App signal set at +700 ms while first-party requests stay pending:
/// the controller returns `AppSignaled` at the next tick, long before the
/// hard timeout.
#[tokio::test(start_paused = true)]
async fn app_signal_wins_while_requests_pend() {
    let tracker = RequestTracker::new("example.com");
    tracker.request_started("1", "https://example.com/api/slow", "fetch");

    let mut page = ScriptedPage::new(DomSchedule::Every(50));
    page.app_signal_at = Some(700);

    let started = Instant::now();
    let reason = wait_for_ready(&page, &tracker, &ReadinessConfig::default()).await;
    let waited = started.elapsed();

    assert_eq!(reason, ReadyReason::AppSignaled);
    assert!(waited >= Duration::from_millis(700));
    assert!(waited < Duration::from_millis(1000));
}

/// Network idle from ~1 s, last DOM mutation at 1.1 s: both observables
/// stabilize and the controller returns `NetworkAndDomStable` around 1.5 s.
#[tokio::test(start_paused = true)]
async fn network_and_dom_stable() {
    let tracker = Arc::new(RequestTracker::new("example.com"));
    tracker.request_started("1", "https://example.com/data.json", "xhr");

    let finisher = Arc::clone(&tracker);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(950)).await;
        finisher.request_finished("1");
    });

    let page = ScriptedPage::new(DomSchedule::QuietAfter(1100));

    let started = Instant::now();
    let reason = wait_for_ready(&page, &tracker, &ReadinessConfig::default()).await;
    let waited = started.elapsed();

    assert_eq!(reason, ReadyReason::NetworkAndDomStable);
    assert!(waited >= Duration::from_millis(1400));
    assert!(waited < Duration::from_millis(1800));
}

/// Network quiet from ~0.6 s but the DOM mutates every 50 ms forever: the
/// extended DOM window expires and the controller settles for
/// `NetworkStableDomTimeout` at ~3.5 s.
#[tokio::test(start_paused = true)]
async fn network_stable_dom_never_settles() {
    let tracker = Arc::new(RequestTracker::new("example.com"));
    tracker.request_started("1", "https://example.com/app.js", "script");

    let finisher = Arc::clone(&tracker);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(550)).await;
        finisher.request_finished("1");
    });

    let page = ScriptedPage::new(DomSchedule::Every(50));

    let started = Instant::now();
    let reason = wait_for_ready(&page, &tracker, &ReadinessConfig::default()).await;
    let waited = started.elapsed();

    assert_eq!(reason, ReadyReason::NetworkStableDomTimeout);
    assert!(waited >= Duration::from_millis(3500));
    assert!(waited < Duration::from_millis(3900));
}

/// Requests never stop: the controller gives up with `HardTimeout` within
/// one poll interval of the 15-second deadline.
#[tokio::test(start_paused = true)]
async fn hard_timeout_bounds_the_wait() {
    let tracker = RequestTracker::new("example.com");
    tracker.request_started("1", "https://example.com/stream", "fetch");

    let page = ScriptedPage::new(DomSchedule::Every(50));

    let started = Instant::now();
    let reason = wait_for_ready(&page, &tracker, &ReadinessConfig::default()).await;
    let waited = started.elapsed();

    assert_eq!(reason, ReadyReason::HardTimeout);
    assert!(waited >= Duration::from_millis(15_000));
    // Termination law: within HARD_TIMEOUT + one poll interval.
    assert!(waited <= Duration::from_millis(15_100));
}

/// Probe failures degrade safely: the app signal reads as "not signaled"
/// and the DOM reads as "active now", so a page with no pending requests
/// exits through the extended DOM timeout instead of hanging or erroring.
#[tokio::test(start_paused = true)]
async fn evaluation_failures_degrade_safely() {
    let tracker = RequestTracker::new("example.com");

    let mut page = ScriptedPage::new(DomSchedule::Fails);
    page.app_signal_fails = true;

    let started = Instant::now();
    let reason = wait_for_ready(&page, &tracker, &ReadinessConfig::default()).await;
    let waited = started.elapsed();

    assert_eq!(reason, ReadyReason::NetworkStableDomTimeout);
    assert!(waited >= Duration::from_millis(3500));
}

/// Third-party and off-host requests never hold the snapshot: with only
/// ignored traffic in flight, a quiet DOM resolves as fully stable.
#[tokio::test(start_paused = true)]
async fn ignored_requests_do_not_block_stability() {
    let tracker = RequestTracker::new("example.com");
    tracker.request_started("1", "https://www.googletagmanager.com/gtm.js", "script");
    tracker.request_started("2", "https://cdn.elsewhere.net/widget.js", "script");
    assert_eq!(tracker.pending_count(), 0);

    let page = ScriptedPage::new(DomSchedule::QuietAfter(100));

    let reason = wait_for_ready(&page, &tracker, &ReadinessConfig::default()).await;
    assert_eq!(reason, ReadyReason::NetworkAndDomStable);
}
