use anyhow::Context;
use clap::Parser;
use hissrv_config::ConfigLoader;
use hissrv_logging::init_logging;
use hissrv_server::{create_router, AppState};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "HISSRV history collection and query service")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/hissrv.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::new(&args.config)
        .load()
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    info!(config = %args.config.display(), "Starting HISSRV");

    let state = AppState::from_config(&config)?;
    info!(groups = ?state.collector.group_names(), "Collection groups configured");
    state
        .scheduler
        .start()
        .await
        .context("failed to start scheduler")?;

    let app = create_router(state.clone(), &config.server.api_prefix);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, prefix = %config.server.api_prefix, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down");
    if let Err(e) = state.scheduler.shutdown().await {
        warn!(error = %e, "Scheduler shutdown failed");
    }
    let flushed = state.collector.flush_all().await;
    info!(points = flushed, "Final flush completed");

    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
