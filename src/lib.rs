//! # RenderX
//!
//! An HTTP prerender gateway for single-page applications. For each
//! request it decides, from the client's user-agent, the host's strategy
//! and the request path, whether to return the static SPA bundle or a
//! fully-rendered HTML snapshot produced by driving a shared headless
//! Chrome against the same bundle over loopback. Snapshots are cached on
//! disk and served to repeat crawlers within milliseconds.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use renderx::{AppState, FileCache, GlobalConfig, RenderEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = GlobalConfig::load(std::path::Path::new("./config.json"))?;
//!     config.apply_env();
//!     let config = Arc::new(config);
//!
//!     let state = AppState::new(
//!         config.clone(),
//!         Arc::new(RenderEngine::new()),
//!         Arc::new(FileCache::new(config.cache_dir.clone())),
//!     );
//!     let router = renderx::build_router(state);
//!     let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
//!     axum::serve(
//!         listener,
//!         router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

/// Configuration document, environment overlay and per-host resolution
pub mod config;

/// Error taxonomy for the render and cache subsystems
pub mod error;

/// File-backed snapshot cache with metadata-driven expiry
pub mod cache;

/// Post-render HTML optimizer
pub mod optimizer;

/// Request classification and the serving decision
pub mod classify;

/// Traversal-safe static bundle resolution
pub mod static_files;

/// The render engine driving the shared headless browser
pub mod renderer;

/// The HTTP router and auxiliary endpoints
pub mod server;


pub use cache::{fingerprint, CleanupStats, ContentCache, FileCache, MemoryCache};
pub use classify::{classify, decide, RequestClass, ServeMode};
pub use config::{
    EffectiveConfig, GlobalConfig, HostConfig, HostMatch, LogsMode, OptimizerOptions, Strategy,
};
pub use error::{CacheError, RenderError};
pub use optimizer::optimize;
pub use renderer::{BrowserStatus, RenderEngine, RenderJob, Renderer, StubRenderer};
pub use server::{build_router, spawn_maintenance, startup_sweep, AppState, RateLimiter};
