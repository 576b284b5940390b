//! Relay server.
//!
//! Pairs interactive clients with registered connectors by access-code hash
//! and forwards opaque binary data frames between them. Exposes three HTTP
//! endpoints: `/tunnel` (connector WebSocket upgrade), `/client` (client
//! WebSocket upgrade), and `/healthz`.
//!
//! Every upgraded connection runs exactly one reader task which owns the
//! socket's read side; all outbound traffic flows through the peer's writer
//! task (see [`peer`]). Cleanup runs unconditionally when a reader loop
//! exits, and is idempotent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    self, decode_control, encode_control, parse_data_frame, ControlMessage, ControlType,
};

pub mod authmap;
pub mod metrics;
pub mod peer;
pub mod ratelimit;
pub mod sessions;

use authmap::{AuthEntry, AuthMap};
use metrics::Metrics;
use peer::{new_id, Peer, PeerRole};
use ratelimit::{RateLimitConfig, RateLimiter};
use sessions::{Session, SessionStore};

/// Shared relay state, passed explicitly to every handler.
#[derive(Debug)]
pub struct RelayState {
    auth: AuthMap,
    sessions: SessionStore,
    limiter: RateLimiter,
    metrics: Metrics,
}

impl RelayState {
    pub fn new(rate_limit: RateLimitConfig) -> Self {
        Self {
            auth: AuthMap::new(),
            sessions: SessionStore::new(),
            limiter: RateLimiter::new(rate_limit),
            metrics: Metrics::new(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

/// Build the relay router. The caller supplies the shared state so tests can
/// inspect it after the fact.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/tunnel", get(tunnel_handler))
        .route("/client", get(client_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn tunnel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.limiter.allow(addr.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }
    ws.on_upgrade(move |socket| handle_connector_socket(socket, state))
        .into_response()
}

async fn client_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.limiter.allow(addr.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }
    ws.on_upgrade(move |socket| handle_client_socket(socket, state))
        .into_response()
}

/// Split the socket and spawn the single writer task that drains the peer's
/// outbound channel. The task ends when every sender is dropped or when the
/// returned close token fires; either way it flushes queued frames first and
/// then closes the transport.
fn spawn_writer(
    socket: WebSocket,
) -> (
    mpsc::UnboundedSender<Message>,
    SplitStream<WebSocket>,
    CancellationToken,
    JoinHandle<()>,
) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let closed = CancellationToken::new();
    let close_signal = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if sender.send(msg).await.is_err() {
                        return;
                    }
                }
                _ = close_signal.cancelled() => {
                    while let Ok(msg) = rx.try_recv() {
                        if sender.send(msg).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });
    (tx, receiver, closed, writer)
}

/// Read the single handshake message each endpoint expects. Anything other
/// than a text frame aborts the connection.
async fn read_handshake_text(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    match receiver.next().await {
        Some(Ok(Message::Text(text))) => Some(text),
        _ => None,
    }
}

async fn handle_connector_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (tx, mut receiver, closed, writer) = spawn_writer(socket);

    let Some(text) = read_handshake_text(&mut receiver).await else {
        drop(tx);
        let _ = writer.await;
        return;
    };
    let register = match decode_control(text.as_bytes()) {
        Ok(msg) if msg.kind == ControlType::Register && !msg.access_code_hash.is_empty() => msg,
        _ => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let peer = Arc::new(Peer::new(new_id("c_"), PeerRole::Connector, tx, closed));
    let caps = register.caps.unwrap_or_default();
    let previous = state.auth.set(
        &register.access_code_hash,
        AuthEntry {
            peer: peer.clone(),
            generation: register.generation,
            caps,
        },
    );
    if let Some(previous) = previous {
        if previous.peer.id() != peer.id() {
            info!(
                hash = %register.access_code_hash,
                old = %previous.peer.id(),
                new = %peer.id(),
                "connector replaced"
            );
            // The old reader loop exits and runs full cleanup, closing its
            // sessions on both sides.
            previous.peer.close();
        }
    }

    info!(peer = %peer.id(), hash = %register.access_code_hash, "connector registered");
    peer_loop(&mut receiver, &peer, &state).await;
    cleanup_peer(&state, &peer);
    let _ = writer.await;
}

async fn handle_client_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (tx, mut receiver, closed, writer) = spawn_writer(socket);

    let Some(text) = read_handshake_text(&mut receiver).await else {
        drop(tx);
        let _ = writer.await;
        return;
    };
    let connect = match decode_control(text.as_bytes()) {
        Ok(msg) if msg.kind == ControlType::Connect && !msg.access_code.is_empty() => msg,
        _ => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let peer = Arc::new(Peer::new(new_id("u_"), PeerRole::Client, tx, closed));

    let hash = protocol::hash_access_code(&connect.access_code);
    let Some(entry) = state.auth.get(&hash) else {
        send_error(&state, &peer, protocol::ERR_CONNECTOR_NOT_FOUND, "connector not online");
        cleanup_peer(&state, &peer);
        let _ = writer.await;
        return;
    };

    let session_id = new_id("s_");
    let session = Arc::new(Session {
        id: session_id.clone(),
        client: peer.clone(),
        connector: entry.peer.clone(),
        e2ee: connect.e2ee,
        created_at: SystemTime::now(),
    });
    // The store insert must be visible before either side learns the id.
    state.sessions.set(session);

    if send_control(&peer, &ControlMessage::connect_ok(&session_id, entry.caps)).is_err() {
        state.metrics.inc_errors();
        close_session(&state, &session_id);
        cleanup_peer(&state, &peer);
        let _ = writer.await;
        return;
    }
    if send_control(
        &entry.peer,
        &ControlMessage::session_open(&session_id, connect.e2ee),
    )
    .is_err()
    {
        state.metrics.inc_errors();
        close_session(&state, &session_id);
        cleanup_peer(&state, &peer);
        let _ = writer.await;
        return;
    }

    info!(
        sid = %session_id,
        client = %peer.id(),
        connector = %entry.peer.id(),
        "session open"
    );
    peer_loop(&mut receiver, &peer, &state).await;
    cleanup_peer(&state, &peer);
    let _ = writer.await;
}

/// Steady-state reader loop shared by both peer kinds. Returns when the
/// transport fails, the remote closes, or the peer is evicted.
async fn peer_loop(receiver: &mut SplitStream<WebSocket>, peer: &Arc<Peer>, state: &RelayState) {
    loop {
        tokio::select! {
            _ = peer.closed().cancelled() => break,
            next = receiver.next() => {
                let Some(Ok(msg)) = next else { break };
                match msg {
                    Message::Text(text) => handle_control(state, peer, text.as_bytes()),
                    Message::Binary(frame) => route_binary(state, peer, frame),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }
}

/// Steady-state control handling. Heartbeats are discarded; CLOSE_SESSION
/// tears the named session down; anything else is unsupported here.
fn handle_control(state: &RelayState, peer: &Arc<Peer>, data: &[u8]) {
    let msg = match decode_control(data) {
        Ok(msg) => msg,
        Err(_) => {
            state.metrics.inc_errors();
            send_error(state, peer, protocol::ERR_BAD_CONTROL, "invalid control message");
            return;
        }
    };

    match msg.kind {
        ControlType::Heartbeat => {}
        ControlType::CloseSession if !msg.session_id.is_empty() => {
            close_session(state, &msg.session_id);
        }
        _ => {
            send_error(
                state,
                peer,
                protocol::ERR_UNSUPPORTED_CONTROL,
                "unsupported control message in this state",
            );
        }
    }
}

/// Forward a binary frame to the sender's session counterpart. The frame is
/// parsed only for its session id and forwarded byte-identical.
fn route_binary(state: &RelayState, sender: &Arc<Peer>, frame: Vec<u8>) {
    let session_id = match parse_data_frame(&frame) {
        Ok((sid, _, _)) => sid.to_string(),
        Err(_) => {
            state.metrics.inc_errors();
            send_error(state, sender, protocol::ERR_BAD_DATA_FRAME, "invalid data frame");
            return;
        }
    };

    let Some(session) = state.sessions.get(&session_id) else {
        state.metrics.inc_errors();
        send_error(state, sender, protocol::ERR_SESSION_NOT_FOUND, "session not found");
        return;
    };

    let Some(target) = session.opposite(sender.id()) else {
        state.metrics.inc_errors();
        send_error(
            state,
            sender,
            protocol::ERR_SESSION_PEER_MISMATCH,
            "session peer mismatch",
        );
        return;
    };

    let frame_len = frame.len();
    if target.send_binary(frame).is_err() {
        state.metrics.inc_errors();
        warn!(sid = %session_id, bytes = frame_len, "forward failed, closing session");
        close_session(state, &session_id);
        return;
    }

    state.metrics.add_forwarded_bytes(frame_len);
    debug!(sid = %session_id, bytes = frame_len, "forward");
}

/// Remove a session and notify both members. Safe to call for ids that are
/// already gone.
fn close_session(state: &RelayState, session_id: &str) {
    let Some(session) = state.sessions.delete(session_id) else {
        return;
    };

    let msg = ControlMessage::close_session(session_id);
    let _ = send_control(&session.client, &msg);
    let _ = send_control(&session.connector, &msg);
    info!(sid = %session_id, "session closed");
}

/// Unconditional teardown for a departing peer: deregister, remove its
/// sessions, notify each counterpart, close the transport. Idempotent.
fn cleanup_peer(state: &RelayState, peer: &Arc<Peer>) {
    for hash in state.auth.delete_by_peer(peer.id()) {
        info!(hash = %hash, peer = %peer.id(), "connector removed");
    }

    for session in state.sessions.delete_by_peer(peer.id()) {
        if let Some(other) = session.opposite(peer.id()) {
            let _ = send_control(other, &ControlMessage::close_session(&session.id));
        }
        info!(sid = %session.id, reason = "peer_disconnect", "session removed");
    }

    peer.close();
}

fn send_control(peer: &Peer, msg: &ControlMessage) -> Result<(), peer::PeerSendError> {
    let data = encode_control(msg).map_err(|_| peer::PeerSendError)?;
    let text = String::from_utf8(data).map_err(|_| peer::PeerSendError)?;
    peer.send_text(text)
}

fn send_error(state: &RelayState, peer: &Peer, code: &str, message: &str) {
    if send_control(peer, &ControlMessage::error(code, message)).is_err() {
        state.metrics.inc_errors();
        warn!(peer = %peer.id(), code = %code, "failed to deliver error");
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Everything needed to start a relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_address: SocketAddr,
    pub rate_limit: RateLimitConfig,
}

impl RelayConfig {
    /// Bind to an OS-assigned loopback port with rate limiting disabled,
    /// suitable for integration tests.
    pub fn for_testing() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Handle to a running relay. Exposes the bound address and a clean
/// shutdown path.
pub struct RelayHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<RelayState>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Signal shutdown and await the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(std::time::Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "relay server task returned error"),
            Ok(Err(e)) => warn!(error = %e, "relay server task panicked"),
            Err(_) => warn!("relay server task did not finish within timeout"),
        }
    }
}

/// Bind and serve the relay, returning a handle once the listener is live.
pub async fn run_relay(config: RelayConfig) -> Result<RelayHandle, std::io::Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(RelayState::new(config.rate_limit));
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "relay listening");

    let mut shutdown_watch = shutdown_rx;
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(RelayHandle {
        local_addr,
        shutdown_tx,
        state,
        server_task,
    })
}
