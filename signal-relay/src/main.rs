//! signal-relay binary entry point.
//!
//! Usage:
//! ```bash
//! signal-relay --config relay.toml
//! signal-relay --port 9000
//! signal-relay --help
//! ```

use anyhow::Context;
use clap::Parser;
use p2p_signal_relay::{http, Config, RelayError, SignalRelay};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// In-memory signaling relay for peer-to-peer connection setup.
#[derive(Debug, Parser)]
#[command(name = "signal-relay", version, about)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface to bind, overriding `server.host`.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Port to bind, overriding `server.port`.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|source| RelayError::Bind {
            address: address.clone(),
            source,
        })?;

    tracing::info!(
        "signal-relay v{} listening on {} (heartbeat {}ms, session timeout {}ms, client timeout {}ms)",
        env!("CARGO_PKG_VERSION"),
        address,
        config.signaling.heartbeat_interval_ms,
        config.signaling.session_timeout_ms,
        config.signaling.client_timeout_ms,
    );

    let (relay, event_loop) = SignalRelay::spawn(config);
    let app = http::build_router(relay.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            match relay.shutdown().await {
                Ok(closed) => tracing::info!("Closed {} connections", closed),
                Err(e) => tracing::warn!("Shutdown: {}", e),
            }
        })
        .await
        .context("HTTP server failed")?;

    let _ = event_loop.await;
    tracing::info!("signal-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
