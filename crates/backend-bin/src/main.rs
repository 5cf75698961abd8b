use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use crowdpulse_backend_lib::{
    config::{Settings, DEFAULT_CONFIG_PATH},
    spawn_background_tasks,
    storage::MemoryStorage,
    ws_router, AppState,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Real-time session server for live polls, quizzes, word clouds and Q&A
#[derive(Debug, Parser)]
#[command(name = "crowdpulse-server", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Keep responses in memory instead of the data directory
    #[arg(long)]
    memory: bool,
}

fn init_tracing(settings: &Settings) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_ascii_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);
    if settings.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }

    init_tracing(&settings);

    let state = if args.memory {
        info!("using in-memory storage");
        AppState::new(Arc::new(MemoryStorage::new()), settings)
    } else {
        info!(data_dir = %settings.data_dir.display(), "using flat-file storage");
        AppState::with_flat_files(settings).context("initialising storage")?
    };

    let _maintenance = spawn_background_tasks(&state);

    let addr = state.settings.bind_addr;
    let app = ws_router::create_router(Arc::new(state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("server stopped");
    Ok(())
}
