//! Backup Orchestrator - Main Entry Point

use std::path::PathBuf;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use backup_orchestrator::App;
use backup_orchestrator::config::AppConfig;
use backup_orchestrator::logging::init_tracing;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "backup-orchestrator")]
#[command(about = "Scheduled, concurrency-limited restic backups across a fleet")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level; overrides the config file.
    #[arg(long, env = "ORCHESTRATOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Inventory file; overrides the config file.
    #[arg(short, long, env = "ORCHESTRATOR_INVENTORY")]
    inventory: Option<PathBuf>,

    /// Validate the configuration and inventory, then exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(inventory) = args.inventory {
        config.inventory.path = Some(inventory);
    }
    init_tracing(&config.logging)?;

    tracing::info!("Starting backup orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let app = App::build(&config)?;
    if args.check_config {
        tracing::info!("Configuration OK");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    app.start(&cancel).await?;

    shutdown_signal().await;
    cancel.cancel();
    tracing::info!("Shut down gracefully");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        () = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
