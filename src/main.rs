use clap::Parser;
use renderx::server::{build_router, spawn_maintenance, startup_sweep, AppState};
use renderx::{ContentCache, FileCache, GlobalConfig, RenderEngine, Renderer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "renderx", about = "HTTP prerender gateway for single-page applications")]
struct Cli {
    /// Path to the configuration document
    #[arg(long, default_value = "./config.json")]
    config: PathBuf,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    setup_logging(args.verbose);

    info!("starting renderx v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GlobalConfig::load(&args.config)?;
    config.apply_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);
    info!(
        port = config.port,
        hosts = config.hosts.len(),
        parallel_renders = config.parallel_renders,
        "configuration loaded"
    );

    let renderer: Arc<dyn Renderer> = Arc::new(RenderEngine::new());
    let cache: Arc<dyn ContentCache> = Arc::new(FileCache::new(config.cache_dir.clone()));

    startup_sweep(&config, &cache).await;
    let state = AppState::new(config.clone(), renderer.clone(), cache.clone());
    let maintenance = spawn_maintenance(config.clone(), cache, state.rate_limiter.clone());

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("listening on 0.0.0.0:{}", config.port);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // In-flight renders are not awaited; shutdown is best-effort.
    info!("shutting down");
    maintenance.abort();
    renderer.shutdown().await;
    info!("renderx stopped");
    Ok(())
}

fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "renderx=debug,info" } else { "renderx=info,warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!("failed to install SIGTERM handler: {}", e);
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
