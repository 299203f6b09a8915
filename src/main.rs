//! StorageVolume Local-Disk Operator
//!
//! Process bootstrap: CLI flags, logging, metrics/health endpoints, signal
//! handling, and the blocking controller entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_volume_operator::{metrics, start, Error, Result, Settings};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StorageVolume Local-Disk Operator - node-local partition provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node this controller instance provisions for
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Kubeconfig file used when in-cluster discovery fails
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Path to the parted binary
    #[arg(long, env = "PARTED_PATH", default_value = "/sbin/parted")]
    parted_path: PathBuf,

    /// Metrics/health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting StorageVolume Local-Disk Operator");
    info!("  Version: {}", storage_volume_operator::VERSION);
    info!("  Node: {}", args.node_id);
    info!("  Parted: {}", args.parted_path.display());

    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics address: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal, stopping operator");
            shutdown.cancel();
        });
    }

    let settings = Settings {
        node_id: args.node_id,
        kubeconfig: args.kubeconfig,
        parted_path: args.parted_path,
    };
    start(settings, shutdown).await?;

    info!("Operator shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
