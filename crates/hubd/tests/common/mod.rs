use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hubd::auth::{AuthError, Claims, TokenVerifier};
use hubd::config::ServerConfig;
use hubd::registry::Registry;
use hubd::server::ServerState;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

/// Verifier that admits every token; the subject echoes the token so
/// tests can assert it was threaded through.
pub struct AllowAll;

#[async_trait]
impl TokenVerifier for AllowAll {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(Claims {
            sub: format!("sub:{token}"),
            exp: u64::MAX,
        })
    }
}

/// Verifier that rejects every token.
pub struct DenyAll;

#[async_trait]
impl TokenVerifier for DenyAll {
    async fn verify(&self, _token: &str) -> Result<Claims, AuthError> {
        Err(AuthError::Invalid("denied by test verifier".to_string()))
    }
}

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        host: listen.ip(),
        port: listen.port(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        auth_url: "http://127.0.0.1:8081".to_string(),
        room_capacity: 4,
        msg_rate: 1000,
        rate_window_ms: 1000,
        max_frame_bytes: 65_536,
        queue_depth: 128,
        room_ttl_secs: 7200,
        sweep_interval_secs: 60,
        max_conns: 100,
        drain_timeout_secs: 5,
    }
}

pub fn make_state(config: ServerConfig, verifier: Arc<dyn TokenVerifier>) -> Arc<ServerState> {
    Arc::new(ServerState {
        registry: Registry::new(config.room_capacity),
        verifier,
        config,
        active_connections: AtomicUsize::new(0),
        shutdown: watch::channel(false).0,
    })
}

async fn spawn_server(state: Arc<ServerState>, listener: TcpListener) {
    tokio::spawn(async move {
        if let Err(e) = hubd::run(listener, state).await {
            eprintln!("server error in test: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

/// Start a server on an ephemeral port with the config adjusted by `f`.
pub async fn start_server_with(f: impl FnOnce(&mut ServerConfig)) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    f(&mut config);
    let state = make_state(config, Arc::new(AllowAll));
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub async fn start_server_with_verifier(
    verifier: Arc<dyn TokenVerifier>,
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = make_state(test_config(addr), verifier);
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<WsStream>,
}

pub fn join_url(addr: &SocketAddr, room: &str, client_id: &str) -> String {
    format!("ws://{addr}/?room={room}&clientId={client_id}&token=test-token")
}

impl TestClient {
    /// Connect and join; the upgrade itself always succeeds and any
    /// rejection arrives as an error envelope afterward.
    pub async fn connect(addr: &SocketAddr, room: &str, client_id: &str) -> Self {
        Self::connect_url(&join_url(addr, room, client_id)).await
    }

    pub async fn connect_url(url: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_binary(&mut self, payload: &[u8]) {
        self.ws_tx
            .send(Message::Binary(payload.to_vec()))
            .await
            .unwrap();
    }

    /// Next data or close frame, skipping protocol pings/pongs.
    pub async fn recv_msg(&mut self) -> Message {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                Message::Ping(_) | Message::Pong(_) => {}
                other => return other,
            }
        }
    }

    pub async fn recv_msg_timeout(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.recv_msg()).await.ok()
    }

    /// Next text frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        match self.recv_msg().await {
            Message::Text(text) => serde_json::from_str(&text).expect("invalid event json"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Assert the next event is `peer_joined`/`peer_left` for `peer_id`.
    pub async fn expect_peer_event(&mut self, kind: &str, peer_id: &str) {
        let event = self.recv_json().await;
        assert_eq!(event["type"], kind, "unexpected event: {event}");
        assert_eq!(event["senderId"], "server");
        assert_eq!(event["payload"]["peerId"], peer_id);
    }

    /// Assert the next event is an `error` with the given code.
    pub async fn expect_error(&mut self, code: &str) {
        let event = self.recv_json().await;
        assert_eq!(event["type"], "error", "unexpected event: {event}");
        assert_eq!(event["payload"]["code"], code);
    }

    /// Assert no data frame arrives within `window`. A close frame also
    /// counts as "nothing relayed".
    pub async fn expect_silence(&mut self, window: Duration) {
        match self.recv_msg_timeout(window).await {
            None | Some(Message::Close(_)) => {}
            Some(other) => panic!("expected silence, got {other:?}"),
        }
    }

    /// Wait for the server's close frame, skipping any pending data.
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next()).await;
            match msg {
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return frame.map(|f| u16::from(f.code));
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_))) | Ok(None) => return None,
                Err(_) => panic!("timeout waiting for close"),
            }
        }
    }
}
