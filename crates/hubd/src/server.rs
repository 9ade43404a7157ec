use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::HubError;
use crate::registry::Registry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Shared state for the signaling hub.
pub struct ServerState {
    /// Room table; the only mutable structure shared between rooms.
    pub registry: Registry,
    /// Bearer-token verifier consulted at upgrade time.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Live connection count, for the accept-loop guard and drain.
    pub active_connections: AtomicUsize,
    /// Shutdown signal; connections and the sweeper subscribe to it.
    /// Keeping the sender here means subscribers never observe a
    /// dropped channel while the state is alive.
    pub shutdown: watch::Sender<bool>,
}

/// Accept loop. Returns when the shutdown signal fires or the listener
/// fails fatally.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), HubError> {
    let mut shutdown = state.shutdown.subscribe();
    let local_addr = listener.local_addr().map_err(HubError::Io)?;
    info!("hub listening on {}", local_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                        warn!("max connections reached, rejecting {}", addr);
                        drop(stream);
                        continue;
                    }

                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, state).await {
                            tracing::debug!("connection from {} closed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("accept loop stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Wait for live connections to finish after shutdown has been
/// signaled. Returns `false` if the timeout elapsed with connections
/// still open; the process exit then closes their sockets hard.
pub async fn drain(state: &ServerState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while state.active_connections.load(Ordering::Relaxed) > 0 {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    true
}
