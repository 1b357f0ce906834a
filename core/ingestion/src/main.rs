use anyhow::{Context, Result};
use clap::Parser;
use jarvis_ingestion::{build_router, AppState, Database, ServiceConfig, SessionSweeper};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// OMI webhook service: buffers transcripts and answers when addressed
#[derive(Debug, Parser)]
#[command(name = "jarvis", version)]
struct Args {
    /// Path to the SQLite database (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Address to listen on (overrides JARVIS_BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("Jarvis webhook service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::from_env()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    // Create directory if it doesn't exist
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let db = Database::new(&config.db_path)?;
    info!("Database initialized at: {}", config.db_path.display());

    let state = AppState::from_config(&config, db)?;

    let shutdown = CancellationToken::new();
    let sweeper = SessionSweeper::new(
        state.db.clone(),
        state.buffers.clone(),
        state.guard.clone(),
        state.clock.clone(),
        config.sweep,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    let app = build_router(state);

    info!("Starting HTTP server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        error!("Session sweeper task failed: {}", e);
    }

    info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM and stop background work
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
