//! Prometheus metrics and the operational HTTP endpoint.
//!
//! `/metrics` renders the Prometheus registry; `/health` is bare
//! liveness; `/ready` is derived from hub state rather than a flag: the
//! hub is ready until shutdown is signaled, and the body carries the
//! live room and connection counts so operators can see what a restart
//! would interrupt.

use crate::server::ServerState;
use axum::extract::State;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    ready: bool,
    rooms: usize,
    connections: usize,
}

/// # Errors
///
/// Returns an error if binding the metrics HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthBody>) {
    (StatusCode::OK, Json(HealthBody { status: "healthy" }))
}

/// 200 while the hub accepts joins, 503 once it is draining.
async fn ready_handler(State(state): State<Arc<ServerState>>) -> (StatusCode, Json<ReadyBody>) {
    let draining = *state.shutdown.borrow();
    let body = ReadyBody {
        status: if draining { "draining" } else { "ready" },
        ready: !draining,
        rooms: state.registry.rooms(),
        connections: state.active_connections.load(Ordering::Relaxed),
    };
    let code = if draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

/// Connection and room gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("hub_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("hub_connections_active").decrement(1.0);
    }

    /// Record the current number of live rooms.
    pub fn set_rooms_active(rooms: usize) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("hub_rooms_active").set(rooms as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a connection attempt with the given outcome label.
    pub fn connections_total(outcome: &'static str) {
        metrics::counter!("hub_connections_total", "outcome" => outcome).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("hub_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("hub_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record a hub-originated event emission.
    pub fn events_emitted_total(kind: &'static str) {
        metrics::counter!("hub_events_emitted_total", "kind" => kind).increment(1);
    }

    /// Increment the swept-rooms counter.
    pub fn rooms_swept_total() {
        metrics::counter!("hub_rooms_swept_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a relay fan-out latency observation in seconds.
    pub fn relay_latency_seconds(value: f64) {
        metrics::histogram!("hub_relay_latency_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, Claims, TokenVerifier};
    use crate::config::ServerConfig;
    use crate::registry::Registry;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, watch};

    struct AllowAll;

    #[async_trait]
    impl TokenVerifier for AllowAll {
        async fn verify(&self, _token: &str) -> Result<Claims, AuthError> {
            Ok(Claims {
                sub: "test".to_string(),
                exp: u64::MAX,
            })
        }
    }

    fn test_state() -> Arc<ServerState> {
        let config = ServerConfig {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            metrics_addr: "127.0.0.1:0".parse().unwrap(),
            auth_url: "http://127.0.0.1:8081".to_string(),
            room_capacity: 4,
            msg_rate: 10,
            rate_window_ms: 1000,
            max_frame_bytes: 65_536,
            queue_depth: 128,
            room_ttl_secs: 7200,
            sweep_interval_secs: 60,
            max_conns: 100,
            drain_timeout_secs: 5,
        };
        Arc::new(ServerState {
            registry: Registry::new(config.room_capacity),
            verifier: Arc::new(AllowAll),
            config,
            active_connections: AtomicUsize::new(0),
            shutdown: watch::channel(false).0,
        })
    }

    #[tokio::test]
    async fn ready_reflects_occupancy() {
        let state = test_state();
        let (tx, _rx) = mpsc::channel(8);
        let (kick, _krx) = mpsc::channel(1);
        state.registry.admit("ABC", "A", "s", tx, kick).unwrap();
        state.active_connections.store(1, Ordering::Relaxed);

        let (code, Json(body)) = ready_handler(State(state)).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.ready);
        assert_eq!(body.status, "ready");
        assert_eq!(body.rooms, 1);
        assert_eq!(body.connections, 1);
    }

    #[tokio::test]
    async fn ready_flips_to_draining_on_shutdown() {
        let state = test_state();
        state.shutdown.send_replace(true);

        let (code, Json(body)) = ready_handler(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.ready);
        assert_eq!(body.status, "draining");
    }

    #[tokio::test]
    async fn health_is_unconditional() {
        let (code, Json(body)) = health_handler().await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "healthy");
    }
}
