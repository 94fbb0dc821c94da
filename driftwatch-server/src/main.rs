//! # Driftwatch Server
//!
//! AIOps anomaly-detection and remediation server.
//!
//! ## Overview
//!
//! The server continuously ingests metrics and logs from external
//! observability backends, scores them with configurable detectors, and
//! dispatches remediation actions when anomalies are confirmed:
//!
//! - **Detection**: statistical, sliding-window, and isolation-forest
//!   detectors with a lifecycle state machine and warm-up training
//! - **Ingestion**: scheduled metric collectors and incremental log polling
//! - **Remediation**: restart/scale/script/notify handlers behind a
//!   dependency-aware orchestrator
//! - **Real-time gateway**: topic pub/sub over WebSocket with heartbeats
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - driftwatch-core for the engine
//! - a JSON file for detector persistence
//! - Prometheus exposition for self-metrics

/// Versioned route organization
pub mod routes;

/// REST and WebSocket handlers
pub mod handlers;

/// Real-time gateway connection management
pub mod gateway;

/// Application state, metrics, and startup wiring
pub mod infra;

/// Error types and handling
pub mod errors;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the Driftwatch server
#[derive(Parser, Debug)]
#[command(name = "driftwatch-server")]
#[command(about = "AIOps anomaly-detection and remediation server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "DRIFTWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "DRIFTWATCH_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "DRIFTWATCH_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "driftwatch_server=debug,driftwatch_core=debug,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = driftwatch_config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let shutdown = CancellationToken::new();
    let state = infra::startup::build_state(Arc::new(config), shutdown.clone()).await?;
    let background = infra::startup::spawn_background(&state);

    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()?;
    let app = routes::create_router(state.clone());
    let listener = TcpListener::bind(addr).await?;
    info!("driftwatch server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Stop accepting work, then give in-flight tasks a bounded drain window.
    shutdown.cancel();
    let drain = futures::future::join_all(background);
    if tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .is_err()
    {
        warn!("background tasks did not drain within 5s, exiting anyway");
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM and cancel the root token.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
    shutdown.cancel();
}
