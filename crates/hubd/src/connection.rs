use crate::envelope::{close_frame, ErrorCode, ServerEvent, CLOSE_GOING_AWAY, CLOSE_IDLE_EXPIRED};
use crate::error::HubError;
use crate::metrics::{counters, gauges, histograms};
use crate::query::{parse_join_query, JoinQuery};
use crate::ratelimit::RateLimiter;
use crate::registry::{AdmitError, Kick};
use crate::router;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

struct ConnGuard {
    state: Arc<ServerState>,
}

impl ConnGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        Self { state }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

/// Send an `error` envelope followed by a close frame, and surface the
/// rejection to the accept loop. Both sends are best-effort: the client
/// may already be gone.
async fn reject(
    ws_tx: &mut WsSink,
    code: ErrorCode,
    target: &str,
    message: impl Into<String>,
) -> Result<(), HubError> {
    let event = ServerEvent::error(code, target, message);
    let _ = ws_tx.send(event.to_message()).await;
    let _ = ws_tx.send(close_frame(code.close_code(), code.as_str())).await;
    Err(HubError::Rejected(code))
}

/// Drive one connection from upgrade to teardown.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), HubError> {
    let _guard = ConnGuard::new(state.clone());

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_frame_bytes),
        max_frame_size: Some(state.config.max_frame_bytes),
        ..WebSocketConfig::default()
    };

    // The query string is only visible during the upgrade handshake;
    // capture it for validation after the socket is established.
    let query_cell = Arc::new(std::sync::OnceLock::new());
    let cell = query_cell.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| {
            if let Some(query) = req.uri().query() {
                let _ = cell.set(query.to_string());
            }
            Ok(resp)
        },
        Some(ws_config),
    )
    .await
    .map_err(HubError::WebSocket)?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let raw_query = query_cell.get().cloned().unwrap_or_default();
    let join = match parse_join_query(&raw_query) {
        Ok(join) => join,
        Err(reason) => {
            counters::connections_total("bad_request");
            tracing::debug!(peer = %peer_addr, reason, "rejecting malformed join query");
            return reject(
                &mut ws_tx,
                ErrorCode::BadRequest,
                "*",
                "Query requires room, clientId, and token.",
            )
            .await;
        }
    };

    let claims = match state.verifier.verify(&join.token).await {
        Ok(claims) => claims,
        Err(e) => {
            counters::connections_total("auth_failed");
            tracing::warn!(room = %join.room, reason = %e, "event=auth_failed");
            return reject(
                &mut ws_tx,
                ErrorCode::AuthFailed,
                &join.client_id,
                "Invalid or expired session token.",
            )
            .await;
        }
    };

    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Message>(state.config.queue_depth);
    let (kick_tx, mut kick_rx) = mpsc::channel::<Kick>(1);

    let admitted = match state
        .registry
        .admit(&join.room, &join.client_id, &claims.sub, deliver_tx, kick_tx)
    {
        Ok(admitted) => admitted,
        Err(AdmitError::RoomFull) => {
            counters::connections_total("room_full");
            tracing::info!(room = %join.room, "event=room_full");
            return reject(
                &mut ws_tx,
                ErrorCode::RoomFull,
                &join.client_id,
                format!(
                    "Room has reached max capacity ({}).",
                    state.config.room_capacity
                ),
            )
            .await;
        }
        Err(AdmitError::DuplicateId) => {
            counters::connections_total("duplicate_id");
            tracing::info!(room = %join.room, "event=duplicate_id");
            return reject(
                &mut ws_tx,
                ErrorCode::BadRequest,
                &join.client_id,
                "clientId already present in room.",
            )
            .await;
        }
    };

    counters::connections_total("admitted");
    gauges::set_rooms_active(state.registry.rooms());
    tracing::info!(
        room = %join.room,
        client_id = %join.client_id,
        subject = %claims.sub,
        "event=join"
    );

    // Announce to pre-existing members before the read loop starts, so
    // no relay from this member can overtake its own peer_joined.
    if !admitted.peers.is_empty() {
        let joined = ServerEvent::peer_joined(&join.client_id).to_message();
        router::fan_out(&admitted.peers, &joined);
        counters::events_emitted_total("peer_joined");
    }

    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut deliver_rx,
        &mut kick_rx,
        &state,
        &join,
        admitted.seq,
    )
    .await;

    // Both loop activities have exited; now the member may disappear.
    if let Some(removed) = state.registry.remove(&join.room, &join.client_id, admitted.seq) {
        gauges::set_rooms_active(state.registry.rooms());
        if removed.room_deleted {
            tracing::info!(room = %join.room, "event=room_deleted");
        } else {
            tracing::info!(room = %join.room, client_id = %join.client_id, "event=leave");
            let left = ServerEvent::peer_left(&join.client_id).to_message();
            router::fan_out(&removed.peers, &left);
            counters::events_emitted_total("peer_left");
        }
    }

    result
}

/// The OPEN state: one select loop serving as reader and writer. The
/// arms terminate together; whichever fires a return ends both roles
/// before teardown runs.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Message>,
    kick_rx: &mut mpsc::Receiver<Kick>,
    state: &ServerState,
    join: &JoinQuery,
    seq: u64,
) -> Result<(), HubError> {
    let mut rate_limiter = RateLimiter::new(state.config.msg_rate, state.config.rate_window());
    let mut shutdown = state.shutdown.subscribe();
    // A subscriber only sees changes after subscribing; a connection
    // admitted during shutdown must not wait for a signal already sent.
    if *shutdown.borrow() {
        let _ = ws_tx.send(close_frame(CLOSE_GOING_AWAY, "server_shutdown")).await;
        return Ok(());
    }

    loop {
        tokio::select! {
            inbound = ws_rx.next() => match inbound {
                Some(Ok(msg)) => match msg {
                    Message::Text(_) | Message::Binary(_) => {
                        if !rate_limiter.try_admit(Instant::now()) {
                            counters::messages_dropped_total("rate_limited");
                            tracing::warn!(room = %join.room, client_id = %join.client_id, "event=rate_limited");
                            let event = ServerEvent::error(
                                ErrorCode::RateLimited,
                                &join.client_id,
                                format!(
                                    "Max {} messages per {} ms.",
                                    state.config.msg_rate, state.config.rate_window_ms
                                ),
                            );
                            ws_tx.send(event.to_message()).await.map_err(HubError::WebSocket)?;
                            continue;
                        }
                        let start = Instant::now();
                        let offered = router::relay(&state.registry, &join.room, seq, &msg);
                        if offered > 0 {
                            counters::messages_relayed_total();
                        }
                        histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
                    }
                    Message::Ping(data) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                },
                Some(Err(tokio_tungstenite::tungstenite::Error::Capacity(_))) => {
                    // Frame over the configured cap.
                    let event = ServerEvent::error(
                        ErrorCode::BadRequest,
                        &join.client_id,
                        format!("Frame exceeds {} bytes.", state.config.max_frame_bytes),
                    );
                    let _ = ws_tx.send(event.to_message()).await;
                    let _ = ws_tx
                        .send(close_frame(ErrorCode::BadRequest.close_code(), "frame_too_large"))
                        .await;
                    return Err(HubError::Rejected(ErrorCode::BadRequest));
                }
                Some(Err(e)) => {
                    // Uncaught per-connection fault: tell the client if
                    // the socket still takes writes, then tear down.
                    let event = ServerEvent::error(
                        ErrorCode::Internal,
                        &join.client_id,
                        "Unexpected connection fault.",
                    );
                    let _ = ws_tx.send(event.to_message()).await;
                    let _ = ws_tx
                        .send(close_frame(ErrorCode::Internal.close_code(), "internal"))
                        .await;
                    return Err(HubError::WebSocket(e));
                }
                None => return Ok(()),
            },
            Some(frame) = deliver_rx.recv() => {
                ws_tx.send(frame).await.map_err(HubError::WebSocket)?;
            }
            Some(kick) = kick_rx.recv() => {
                match kick {
                    Kick::IdleRoom => {
                        let _ = ws_tx
                            .send(close_frame(CLOSE_IDLE_EXPIRED, "room_idle_expired"))
                            .await;
                    }
                    Kick::SlowConsumer => {
                        let event = ServerEvent::error(
                            ErrorCode::SlowConsumer,
                            &join.client_id,
                            "Outbound queue overflowed.",
                        );
                        let _ = ws_tx.send(event.to_message()).await;
                        let _ = ws_tx
                            .send(close_frame(ErrorCode::SlowConsumer.close_code(), "slow_consumer"))
                            .await;
                    }
                }
                return Ok(());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws_tx.send(close_frame(CLOSE_GOING_AWAY, "server_shutdown")).await;
                    return Ok(());
                }
            }
        }
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
    use tokio::sync::watch;

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

    #[test]
    fn conn_guard_tracks_the_connection_count() {
        let state = test_state();
        {
            let _guard = ConnGuard::new(state.clone());
            assert_eq!(state.active_connections.load(Ordering::Relaxed), 1);
            {
                let _second = ConnGuard::new(state.clone());
                assert_eq!(state.active_connections.load(Ordering::Relaxed), 2);
            }
            assert_eq!(state.active_connections.load(Ordering::Relaxed), 1);
        } // guard drops here
        assert_eq!(state.active_connections.load(Ordering::Relaxed), 0);
    }
}
