#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use hubd::auth::JwtVerifier;
use hubd::config::{Args, ServerConfig};
use hubd::metrics::start_metrics_server;
use hubd::registry::Registry;
use hubd::server::ServerState;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let verifier = Arc::new(JwtVerifier::new(&config.auth_url)?);

    let state = Arc::new(ServerState {
        registry: Registry::new(config.room_capacity),
        verifier,
        config: config.clone(),
        active_connections: AtomicUsize::new(0),
        shutdown: watch::channel(false).0,
    });

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!("bound to {}", config.listen_addr());

    tokio::spawn({
        let metrics_addr = config.metrics_addr;
        let state = state.clone();
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::spawn(hubd::sweeper::run(state.clone()));

    info!(host = %config.host, port = config.port, "server_start");

    tokio::select! {
        result = hubd::run(listener, state.clone()) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    state.shutdown.send_replace(true);
    if !hubd::drain(&state, config.drain_timeout()).await {
        warn!("drain timeout reached, abandoning remaining connections");
    }
    info!("server_stop");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM, whichever lands first.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
