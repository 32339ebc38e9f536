//! The render engine.
//!
//! Owns the single shared headless Chrome process. Each render runs in its
//! own browser context (isolated cookies and storage) with a fresh page, a
//! resource-type filter, and a multi-stage readiness protocol. Admission is
//! strict: when the active counter is at capacity a render fails fast
//! instead of queuing. Cleanup is bounded by its own timeout and can never
//! leak an admission slot.

use crate::classify::RENDER_USER_AGENT;
use crate::config::{EffectiveConfig, Strategy};
use crate::error::RenderError;
use crate::optimizer;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    BrowserContextId, SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
    FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, Headers, ResourceType, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Hard bound on page/context teardown. The admission slot is released
/// whether or not teardown finishes in time.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback root selectors tried after the configured one.
const FALLBACK_ROOT_SELECTORS: &[&str] = &["#app", "[data-reactroot]", "body > *"];

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One render request against the loopback listener (or, for the auxiliary
/// endpoint, an arbitrary URL).
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub url: String,
    pub user_agent: String,
    /// Forwarded onto every request the page makes.
    pub origin: Option<String>,
}

impl RenderJob {
    /// A loopback job as dispatched by the router.
    pub fn loopback(port: u16, original_url: &str, origin: Option<String>) -> Self {
        Self {
            url: format!("http://localhost:{port}{original_url}"),
            user_agent: RENDER_USER_AGENT.to_string(),
            origin,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrowserStatus {
    pub available: bool,
    pub error: Option<String>,
}

/// Rendering interface. The engine is the production implementation; tests
/// substitute [`StubRenderer`].
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, job: RenderJob, config: &EffectiveConfig)
        -> Result<String, RenderError>;

    fn active_renders(&self) -> usize;

    async fn status(&self) -> BrowserStatus;

    async fn shutdown(&self);
}

/// Active-render counter with fail-fast admission. The increment is a
/// single atomic compare-exchange, so no additional lock is needed on a
/// preemptive runtime; the guard releases exactly once on drop.
#[derive(Debug, Default)]
pub(crate) struct AdmissionCounter {
    active: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub(crate) struct AdmissionGuard {
    active: Arc<AtomicUsize>,
}

impl AdmissionCounter {
    pub fn admit(&self, limit: usize) -> Result<AdmissionGuard, RenderError> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n >= limit {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map(|_| AdmissionGuard {
                active: self.active.clone(),
            })
            .map_err(RenderError::AtCapacity)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Remaining readiness budget: never less than one second.
pub(crate) fn remaining_budget(started: Instant, total: Duration) -> Duration {
    total
        .saturating_sub(started.elapsed())
        .max(Duration::from_secs(1))
}

struct SharedBrowser {
    browser: Arc<Mutex<Browser>>,
    handler: tokio::task::JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

/// The production engine. At most one Chrome process per server; launch is
/// lazy and single-flight (concurrent callers wait on the same slot), and a
/// disconnect clears the slot so the next render re-launches.
pub struct RenderEngine {
    slot: Mutex<Option<SharedBrowser>>,
    admission: AdmissionCounter,
    last_launch_error: std::sync::Mutex<Option<String>>,
}

impl RenderEngine {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            admission: AdmissionCounter::default(),
            last_launch_error: std::sync::Mutex::new(None),
        }
    }

    async fn ensure_browser(&self) -> Result<Arc<Mutex<Browser>>, RenderError> {
        let mut slot = self.slot.lock().await;
        if let Some(shared) = slot.as_ref() {
            if shared.alive.load(Ordering::SeqCst) {
                return Ok(shared.browser.clone());
            }
            warn!("browser disconnected, discarding stale handle");
            if let Some(stale) = slot.take() {
                stale.handler.abort();
            }
        }

        info!("launching headless browser");
        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--disable-extensions")
            .build()
            .map_err(|e| self.record_launch_failure(e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| self.record_launch_failure(e.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("browser handler error: {}", e);
                    break;
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
            warn!("browser event stream ended");
        });

        let browser = Arc::new(Mutex::new(browser));
        *slot = Some(SharedBrowser {
            browser: browser.clone(),
            handler: handler_task,
            alive,
        });
        if let Ok(mut last) = self.last_launch_error.lock() {
            *last = None;
        }
        info!("browser launched");
        Ok(browser)
    }

    fn record_launch_failure(&self, message: impl Into<String>) -> RenderError {
        let message = message.into();
        if let Ok(mut last) = self.last_launch_error.lock() {
            *last = Some(message.clone());
        }
        RenderError::LaunchFailed(message)
    }

    async fn create_context(
        &self,
        browser: &Arc<Mutex<Browser>>,
    ) -> Result<BrowserContextId, RenderError> {
        let guard = browser.lock().await;
        let response = guard
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;
        let context_id = response.result.browser_context_id.clone();

        let deny_downloads = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Deny)
            .browser_context_id(context_id.clone())
            .build()
            .map_err(RenderError::PageSetup)?;
        guard
            .execute(deny_downloads)
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;
        Ok(context_id)
    }

    async fn open_page(
        &self,
        browser: &Arc<Mutex<Browser>>,
        context_id: &BrowserContextId,
    ) -> Result<Page, RenderError> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(RenderError::PageSetup)?;
        let guard = browser.lock().await;
        guard
            .new_page(params)
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))
    }

    /// Permit only document/script/xhr/fetch traffic; everything else is
    /// aborted before it leaves the browser.
    async fn install_resource_filter(&self, page: &Page) -> Result<(), RenderError> {
        page.execute(FetchEnableParams::default())
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;
        let page = page.clone();
        tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let allowed = matches!(
                    event.resource_type,
                    ResourceType::Document
                        | ResourceType::Script
                        | ResourceType::Xhr
                        | ResourceType::Fetch
                );
                let outcome = if allowed {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                } else {
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::Aborted,
                    ))
                    .await
                    .map(|_| ())
                };
                if let Err(e) = outcome {
                    // The page is usually gone at this point; the stream
                    // will end shortly after.
                    debug!("resource filter command failed: {}", e);
                }
            }
        });
        Ok(())
    }

    async fn drive_page(
        &self,
        page: &Page,
        job: &RenderJob,
        config: &EffectiveConfig,
        started: Instant,
    ) -> Result<String, RenderError> {
        let total = Duration::from_millis(config.timeout_ms);

        page.set_user_agent(job.user_agent.as_str())
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(1920)
            .height(1080)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(RenderError::PageSetup)?;
        page.execute(metrics)
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;

        // The loopback listener recognizes these and never re-renders.
        let mut headers = json!({ "X-RenderX-Internal": "true" });
        if let Some(origin) = &job.origin {
            headers["Origin"] = json!(origin);
        }
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;

        page.execute(
            SetLifecycleEventsEnabledParams::builder()
                .enabled(true)
                .build()
                .map_err(RenderError::PageSetup)?,
        )
        .await
        .map_err(|e| RenderError::PageSetup(e.to_string()))?;
        let mut lifecycle = page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(|e| RenderError::PageSetup(e.to_string()))?;

        self.install_resource_filter(page).await?;

        // Stage 1: navigation. The only fatal stage; everything after this
        // degrades to "continue with whatever we have".
        match timeout(total, page.goto(job.url.clone())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(RenderError::NavigationFailed(e.to_string())),
            Err(_) => return Err(RenderError::NavigationTimeout(config.timeout_ms)),
        }

        // Stage 2: first network idle.
        let budget = remaining_budget(started, total).min(Duration::from_secs(15));
        wait_for_network_idle(&mut lifecycle, budget).await;

        // Stage 3: a populated root element, trying fallbacks in order.
        self.wait_for_root(page, config, started, total).await;

        // Stage 4: non-empty root text.
        self.wait_for_root_text(page, &config.root_selector, started, total)
            .await;

        // Stage 5: settle once more.
        let budget = remaining_budget(started, total).min(Duration::from_secs(10));
        wait_for_network_idle(&mut lifecycle, budget).await;

        page.content()
            .await
            .map_err(|e| RenderError::ContentExtraction(e.to_string()))
    }

    async fn wait_for_root(
        &self,
        page: &Page,
        config: &EffectiveConfig,
        started: Instant,
        total: Duration,
    ) {
        let mut selectors = vec![config.root_selector.as_str()];
        for fallback in FALLBACK_ROOT_SELECTORS {
            if *fallback != config.root_selector {
                selectors.push(fallback);
            }
        }
        for selector in selectors {
            let budget = remaining_budget(started, total).max(Duration::from_secs(15));
            if self
                .poll_until(page, &populated_selector_js(selector), budget)
                .await
            {
                debug!(selector, "root selector matched");
                return;
            }
        }
        debug!("no root selector matched, continuing with current DOM");
    }

    async fn wait_for_root_text(
        &self,
        page: &Page,
        root_selector: &str,
        started: Instant,
        total: Duration,
    ) {
        let budget = remaining_budget(started, total).max(Duration::from_secs(10));
        if !self
            .poll_until(page, &non_empty_text_js(root_selector), budget)
            .await
        {
            debug!("root text still empty after budget, continuing");
        }
    }

    /// Poll a boolean page expression every 100ms until it holds or the
    /// budget runs out.
    async fn poll_until(&self, page: &Page, expression: &str, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            let holds = page
                .evaluate(expression)
                .await
                .ok()
                .and_then(|v| v.into_value::<bool>().ok())
                .unwrap_or(false);
            if holds {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    async fn cleanup_context(&self, browser: &Arc<Mutex<Browser>>, context_id: BrowserContextId) {
        let guard = browser.lock().await;
        if let Err(e) = guard
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
        {
            warn!("browser context dispose failed: {}", e);
        }
    }

    async fn cleanup(
        &self,
        browser: &Arc<Mutex<Browser>>,
        page: Page,
        context_id: BrowserContextId,
    ) {
        let teardown = async {
            if let Err(e) = page.close().await {
                warn!("page close failed: {}", e);
            }
            let guard = browser.lock().await;
            if let Err(e) = guard
                .execute(DisposeBrowserContextParams::new(context_id))
                .await
            {
                warn!("browser context dispose failed: {}", e);
            }
        };
        if timeout(CLEANUP_TIMEOUT, teardown).await.is_err() {
            warn!(
                "render cleanup did not finish within {:?}, releasing slot anyway",
                CLEANUP_TIMEOUT
            );
        }
    }
}

impl Default for RenderEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Renderer for RenderEngine {
    async fn render(
        &self,
        job: RenderJob,
        config: &EffectiveConfig,
    ) -> Result<String, RenderError> {
        let _guard = self.admission.admit(config.parallel_renders)?;
        let started = Instant::now();

        let browser = self.ensure_browser().await?;
        let context_id = self.create_context(&browser).await?;
        let result = match self.open_page(&browser, &context_id).await {
            Ok(page) => {
                let result = self.drive_page(&page, &job, config, started).await;
                self.cleanup(&browser, page, context_id).await;
                result
            }
            Err(e) => {
                self.cleanup_context(&browser, context_id).await;
                Err(e)
            }
        };

        let html = result?;
        debug!(
            url = %job.url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "render finished"
        );
        // Full-SSR sites may depend on the scripts and styles the optimizer
        // strips, so ssr passes through unchanged.
        if config.strategy == Strategy::Ssr {
            Ok(html)
        } else {
            Ok(optimizer::optimize(&html, &config.optimizer_options))
        }
    }

    fn active_renders(&self) -> usize {
        self.admission.active()
    }

    async fn status(&self) -> BrowserStatus {
        let slot = self.slot.lock().await;
        let available = slot
            .as_ref()
            .is_some_and(|s| s.alive.load(Ordering::SeqCst));
        let error = self
            .last_launch_error
            .lock()
            .ok()
            .and_then(|last| last.clone());
        BrowserStatus { available, error }
    }

    async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(shared) = slot.take() {
            info!("closing browser");
            let mut browser = shared.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!("browser close failed: {}", e);
            }
            shared.handler.abort();
        }
    }
}

async fn wait_for_network_idle(
    events: &mut (impl Stream<Item = Arc<EventLifecycleEvent>> + Unpin),
    budget: Duration,
) {
    let idle = async {
        while let Some(event) = events.next().await {
            if event.name == "networkIdle" {
                break;
            }
        }
    };
    if timeout(budget, idle).await.is_err() {
        debug!("network idle wait timed out, continuing");
    }
}

fn populated_selector_js(selector: &str) -> String {
    let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"#root\"".to_string());
    format!("(() => {{ const el = document.querySelector({quoted}); return !!(el && el.firstChild); }})()")
}

fn non_empty_text_js(selector: &str) -> String {
    let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"#root\"".to_string());
    format!(
        "(() => {{ const el = document.querySelector({quoted}); return !!(el && el.textContent && el.textContent.trim().length > 0); }})()"
    )
}

/// Canned renderer for tests: returns a fixed document (or a fixed
/// failure) and records every job it sees, while still enforcing the
/// admission contract.
pub struct StubRenderer {
    html: String,
    fail: bool,
    admission: AdmissionCounter,
    jobs: Mutex<Vec<RenderJob>>,
}

impl StubRenderer {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            fail: false,
            admission: AdmissionCounter::default(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            html: String::new(),
            fail: true,
            admission: AdmissionCounter::default(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub async fn jobs(&self) -> Vec<RenderJob> {
        self.jobs.lock().await.clone()
    }
}

#[async_trait]
impl Renderer for StubRenderer {
    async fn render(
        &self,
        job: RenderJob,
        config: &EffectiveConfig,
    ) -> Result<String, RenderError> {
        let _guard = self.admission.admit(config.parallel_renders)?;
        self.jobs.lock().await.push(job);
        if self.fail {
            Err(RenderError::NavigationFailed("stubbed failure".to_string()))
        } else {
            Ok(self.html.clone())
        }
    }

    fn active_renders(&self) -> usize {
        self.admission.active()
    }

    async fn status(&self) -> BrowserStatus {
        BrowserStatus {
            available: true,
            error: None,
        }
    }

    async fn shutdown(&self) {}
}
