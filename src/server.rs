//! The HTTP router.
//!
//! One listener serves everything: the health endpoint, the auxiliary
//! `/render` endpoint, cache administration, and the catch-all route that
//! classifies each request and either serves the static bundle or
//! dispatches a render. Render and cache failures never surface to end
//! users on the catch-all path; they degrade to the unrendered bundle.

use crate::cache::ContentCache;
use crate::classify::{self, RequestClass, ServeMode, INTERNAL_HEADER, RENDER_USER_AGENT};
use crate::config::{EffectiveConfig, GlobalConfig, HostMatch, LogsMode};
use crate::renderer::{RenderJob, Renderer};
use crate::static_files;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};
use url::Url;

/// Overall budget for a single request before the router answers 504.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `/render` rate limit: 100 requests per 15-minute window per client IP.
const RENDER_RATE_LIMIT: usize = 100;
const RENDER_RATE_WINDOW: Duration = Duration::from_secs(15 * 60);

const DEVICE_TYPES: &[&str] = &["desktop", "mobile", "tablet"];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GlobalConfig>,
    pub renderer: Arc<dyn Renderer>,
    pub cache: Arc<dyn ContentCache>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        config: Arc<GlobalConfig>,
        renderer: Arc<dyn Renderer>,
        cache: Arc<dyn ContentCache>,
    ) -> Self {
        Self {
            config,
            renderer,
            cache,
            rate_limiter: Arc::new(RateLimiter::new(RENDER_RATE_LIMIT, RENDER_RATE_WINDOW)),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/render", get(render_url))
        .route("/cache/invalidate", post(cache_invalidate))
        .route("/cache/clear", post(cache_clear))
        .fallback(route_request)
        .layer(middleware::from_fn(request_timeout))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Startup sweep: a full clear by default, a single cleanup otherwise.
pub async fn startup_sweep(config: &GlobalConfig, cache: &Arc<dyn ContentCache>) {
    if config.clear_cache_on_startup {
        match cache.clear().await {
            Ok(()) => info!("cache cleared on startup"),
            Err(e) => warn!("startup cache clear failed: {}", e),
        }
    } else {
        let stats = cache.cleanup().await;
        info!(
            removed = stats.removed,
            errors = stats.errors,
            "startup cache cleanup finished"
        );
    }
}

/// Periodic maintenance: expiry sweeps on the configured interval and
/// rate-limiter pruning on the rate window.
pub fn spawn_maintenance(
    config: Arc<GlobalConfig>,
    cache: Arc<dyn ContentCache>,
    rate_limiter: Arc<RateLimiter>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(config.cleanup_interval());
        let mut prune = tokio::time::interval(RENDER_RATE_WINDOW);
        // Both intervals fire immediately; the startup sweep already ran.
        sweep.tick().await;
        prune.tick().await;
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let stats = cache.cleanup().await;
                    info!(
                        removed = stats.removed,
                        errors = stats.errors,
                        "scheduled cache cleanup finished"
                    );
                }
                _ = prune.tick() => {
                    rate_limiter.prune();
                }
            }
        }
    })
}

// ── Middleware ───────────────────────────────────────────────────────────

async fn request_id(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn request_timeout(req: Request, next: Next) -> Response {
    match timeout(REQUEST_TIMEOUT, next.run(req)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "request timed out").into_response(),
    }
}

// ── Health ───────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    let browser = state.renderer.status().await;
    let cache_error = state
        .cache
        .verify_writable()
        .await
        .err()
        .map(|e| e.to_string());
    let writable = cache_error.is_none();

    let body = json!({
        "status": if writable { "ok" } else { "degraded" },
        "activeRequests": state.renderer.active_renders(),
        "maxConcurrency": state.config.parallel_renders,
        "hosts": state.config.hosts.len(),
        "browser": { "available": browser.available, "error": browser.error },
        "cache": { "writable": writable, "error": cache_error },
    });
    let status = if writable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ── Cache administration ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InvalidateBody {
    url: String,
    device: Option<String>,
}

async fn cache_invalidate(
    State(state): State<AppState>,
    Json(body): Json<InvalidateBody>,
) -> Response {
    let device = body.device.as_deref().unwrap_or("desktop");
    let success = match state.cache.invalidate(&body.url, device).await {
        Ok(()) => true,
        Err(e) => {
            warn!("cache invalidate failed: {}", e);
            false
        }
    };
    Json(json!({ "success": success })).into_response()
}

async fn cache_clear(State(state): State<AppState>) -> Response {
    let success = match state.cache.clear().await {
        Ok(()) => true,
        Err(e) => {
            warn!("cache clear failed: {}", e);
            false
        }
    };
    Json(json!({ "success": success })).into_response()
}

// ── Auxiliary /render endpoint ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RenderQuery {
    url: Option<String>,
    device: Option<String>,
}

async fn render_url(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<RenderQuery>,
    headers: HeaderMap,
) -> Response {
    if !state.rate_limiter.check(addr.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }

    let Some(raw_url) = query.url else {
        return (StatusCode::BAD_REQUEST, "missing url parameter").into_response();
    };
    let target = match Url::parse(&raw_url) {
        Ok(url) => url,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid url parameter").into_response(),
    };
    if !matches!(target.scheme(), "http" | "https") {
        return (StatusCode::BAD_REQUEST, "unsupported url scheme").into_response();
    }
    let Some(target_host) = target.host_str().map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, "url has no host").into_response();
    };
    if !is_safe_render_target(&target_host) {
        return (StatusCode::BAD_REQUEST, "url target not allowed").into_response();
    }

    let device = query.device.unwrap_or_else(|| "desktop".to_string());
    if !DEVICE_TYPES.contains(&device.as_str()) {
        return (StatusCode::BAD_REQUEST, "unknown device type").into_response();
    }

    // The caller's own hostname wins; failing that, the target URL's
    // hostname may still be permitted.
    let effective = match derive_hostname(&headers) {
        Ok(hostname) => match state.config.effective(&hostname) {
            HostMatch::Active(eff) => Some(eff),
            _ => None,
        },
        Err(_) => None,
    };
    let effective = match effective {
        Some(eff) => eff,
        None => match state.config.effective(&target_host) {
            HostMatch::Active(eff) => eff,
            _ => return (StatusCode::FORBIDDEN, "unknown host").into_response(),
        },
    };

    let user_agent = header_str(&headers, "user-agent").unwrap_or_default();
    let class = classify::classify(
        header_str(&headers, INTERNAL_HEADER),
        user_agent,
        target.path(),
        &effective.bots,
    );
    if effective.bot_only && !class.is_bot {
        return Redirect::temporary(&raw_url).into_response();
    }

    if let Some(html) = state.cache.get(&raw_url, &device).await {
        return html_response(html, "HIT");
    }

    let job = RenderJob {
        url: raw_url.clone(),
        user_agent: RENDER_USER_AGENT.to_string(),
        origin: None,
    };
    match state.renderer.render(job, &effective).await {
        Ok(html) => {
            if let Err(e) = state
                .cache
                .set(&raw_url, &html, &device, state.config.cache_ttl())
                .await
            {
                warn!("cache write failed for {}: {}", raw_url, e);
            }
            html_response(html, "MISS")
        }
        Err(e) => {
            warn!("render of {} failed: {}", raw_url, e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("render failed: {e}")).into_response()
        }
    }
}

/// SSRF filter for `/render` targets. `localhost` stays allowed for
/// development; literal loopback, unspecified and private addresses do not.
fn is_safe_render_target(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    match host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
    {
        Ok(IpAddr::V4(ip)) => !(ip.is_loopback() || ip.is_unspecified() || ip.is_private()),
        Ok(IpAddr::V6(ip)) => !(ip.is_loopback() || ip.is_unspecified()),
        Err(_) => true,
    }
}

// ── Catch-all routing ────────────────────────────────────────────────────

async fn route_request(State(state): State<AppState>, req: Request) -> Response {
    let original_url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let path = req.uri().path().to_string();
    let headers = req.headers();
    let user_agent = header_str(headers, "user-agent").unwrap_or_default();
    let origin = header_str(headers, "origin").map(str::to_string);

    let class = classify::classify(
        header_str(headers, INTERNAL_HEADER),
        user_agent,
        &path,
        &state.config.bots,
    );

    // Loopback requests from our own browser: serve files directly across
    // hosts and never render again.
    if class.is_internal {
        let hostname = derive_hostname(headers).ok();
        return serve_loopback(&state, hostname.as_deref(), &path).await;
    }

    let hostname = match derive_hostname(headers) {
        Ok(hostname) => hostname,
        Err(response) => return response,
    };

    let effective = match state.config.effective(&hostname) {
        HostMatch::Active(eff) => eff,
        HostMatch::Inactive => {
            return (StatusCode::SERVICE_UNAVAILABLE, "host is inactive").into_response()
        }
        HostMatch::NoMatch => return (StatusCode::FORBIDDEN, "unknown host").into_response(),
    };

    // Bot detection uses the host's effective list, which may be narrower
    // than the global one.
    let class = RequestClass {
        is_bot: classify::classify(None, user_agent, &path, &effective.bots).is_bot,
        ..class
    };

    match classify::decide(effective.strategy, &class) {
        ServeMode::Static => {
            let label = if class.never_render() { "STATIC" } else { "CSR" };
            log_class(state.config.logs, label, &hostname, &original_url);
            serve_static(&state, &effective, &path).await
        }
        ServeMode::Render => {
            dispatch_render(&state, &effective, &hostname, &original_url, origin).await
        }
    }
}

/// Cache lookup, render on miss, static fallback on failure.
async fn dispatch_render(
    state: &AppState,
    effective: &EffectiveConfig,
    hostname: &str,
    original_url: &str,
    origin: Option<String>,
) -> Response {
    let cache_key = match &origin {
        Some(origin) => format!("{origin}{original_url}"),
        None => format!("http://{hostname}{original_url}"),
    };

    if let Some(html) = state.cache.get(&cache_key, "desktop").await {
        log_class(state.config.logs, "SSR-CACHE", hostname, original_url);
        return html_response(html, "HIT");
    }

    let job = RenderJob::loopback(state.config.port, original_url, origin);
    let started = Instant::now();
    match state.renderer.render(job, effective).await {
        Ok(html) => {
            if let Err(e) = state
                .cache
                .set(&cache_key, &html, "desktop", state.config.cache_ttl())
                .await
            {
                warn!("cache write failed for {}: {}", cache_key, e);
            }
            log_class(state.config.logs, "SSR", hostname, original_url);
            info!(
                host = hostname,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "rendered {}",
                original_url
            );
            html_response(html, "MISS")
        }
        Err(e) => {
            // A broken browser must never break the site for end users.
            warn!("render failed for {}{}: {}", hostname, original_url, e);
            log_class(state.config.logs, "SSR-FALLBACK", hostname, original_url);
            let source_dir = state.config.source_dir(&effective.source);
            match static_files::index_html(&source_dir) {
                Some(index) => serve_file(&index).await,
                None => (StatusCode::NOT_FOUND, "not found").into_response(),
            }
        }
    }
}

/// Static serving with SPA fallback. Traversal attempts 404 outright and
/// never reach the fallback.
async fn serve_static(state: &AppState, effective: &EffectiveConfig, path: &str) -> Response {
    if static_files::sanitize_request_path(path).is_none() {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    let source_dir = state.config.source_dir(&effective.source);
    if let Some(file) = static_files::resolve_existing(&source_dir, path) {
        return serve_file(&file).await;
    }
    match static_files::index_html(&source_dir) {
        Some(index) => serve_file(&index).await,
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Loopback serving for the headless browser: the matching host first,
/// then any active host that has the file, then any host's index.html.
async fn serve_loopback(state: &AppState, hostname: Option<&str>, path: &str) -> Response {
    if static_files::sanitize_request_path(path).is_none() {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    log_class(
        state.config.logs,
        "INTERNAL",
        hostname.unwrap_or("-"),
        path,
    );

    if let Some(hostname) = hostname {
        if let HostMatch::Active(effective) = state.config.effective(hostname) {
            let source_dir = state.config.source_dir(&effective.source);
            if let Some(file) = static_files::resolve_existing(&source_dir, path) {
                return serve_file(&file).await;
            }
        }
    }
    for host in state.config.active_hosts() {
        let source_dir = state.config.source_dir(&host.source);
        if let Some(file) = static_files::resolve_existing(&source_dir, path) {
            return serve_file(&file).await;
        }
    }
    for host in state.config.active_hosts() {
        if let Some(index) = static_files::index_html(&state.config.source_dir(&host.source)) {
            return serve_file(&index).await;
        }
    }
    (StatusCode::NOT_FOUND, "not found").into_response()
}

async fn serve_file(path: &Path) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", static_files::mime_from_extension(path))
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            warn!("failed to read {}: {}", path.display(), e);
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
    }
}

fn html_response(html: String, cache_state: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .header("x-cache", cache_state)
        .body(Body::from(html))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Clients identify themselves by `Origin` (preferred) or `Host`.
fn derive_hostname(headers: &HeaderMap) -> Result<String, Response> {
    if let Some(origin) = header_str(headers, "origin") {
        let parsed = Url::parse(origin)
            .map_err(|_| (StatusCode::BAD_REQUEST, "invalid Origin header").into_response())?;
        return parsed
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "invalid Origin header").into_response());
    }
    if let Some(host) = header_str(headers, "host") {
        return Ok(strip_port(host).to_string());
    }
    Err((StatusCode::BAD_REQUEST, "missing Origin and Host headers").into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal.
        return rest.split(']').next().unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

fn log_class(mode: LogsMode, class: &str, host: &str, path: &str) {
    let render_related = class.starts_with("SSR");
    match mode {
        LogsMode::None => return,
        LogsMode::Ssr if !render_related => return,
        _ => {}
    }
    info!("{} {} {}", class, host, path);
}

// ── Rate limiting ────────────────────────────────────────────────────────

struct Window {
    count: usize,
    reset: Instant,
}

/// Fixed-window request counter per client IP, process-local.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    entries: std::sync::Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Record one request; false means over the limit for this window.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else {
            return true;
        };
        let entry = entries.entry(ip).or_insert(Window {
            count: 0,
            reset: now + self.window,
        });
        if now >= entry.reset {
            entry.count = 0;
            entry.reset = now + self.window;
        }
        if entry.count < self.max {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Drop windows that have expired.
    pub fn prune(&self) {
        let now = Instant::now();
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, window| window.reset > now);
        }
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}
