//! Gateway client.
//!
//! Maintains one persistent WebSocket to the upstream agent gateway and
//! multiplexes every relay session over it. A background worker alternates
//! between connect attempts and supervised serve phases with exponential
//! backoff; authentication failures are terminal. Inside a serve phase the
//! handshake runs challenge → connect → ready, after which requests are
//! correlated to sessions through the req→session and run→session tables and
//! upstream events are normalized to the relay alphabet (see [`events`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::protocol::{Event, ImageItem, EVENT_TOKEN};

pub mod attachments;
pub mod events;

use attachments::fit_attachments;
use events::{
    decode_payload, extract_chat_text, extract_content, extract_correlation_id,
    extract_error_message, extract_error_message_from_payload, extract_run_id,
    extract_session_id, is_error_event_name, is_error_status, is_final_status,
    is_pending_status, map_gateway_event, string_value, DeltaTracker,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ERR_GATEWAY_REQUEST_FAILED: &str = "GATEWAY_REQUEST_FAILED";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The upstream rejected our credentials. Never retried.
    #[error("gateway auth failed: {0}")]
    AuthFailed(String),
    #[error("gateway connection failed: {0}")]
    Connection(String),
    #[error("gateway not ready")]
    NotReady,
    #[error("content is required")]
    ContentRequired,
    #[error(transparent)]
    Fit(#[from] attachments::FitError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One upstream wire message. Unknown fields stay opaque.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<EnvelopeError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct EnvelopeError {
    #[serde(default)]
    pub message: String,
}

/// Callbacks into the bridge. Delivered from the worker task; implementations
/// must not block.
pub struct GatewayHandlers {
    pub on_event: Box<dyn Fn(&str, Event) + Send + Sync>,
    pub on_disconnected: Box<dyn Fn(&str) + Send + Sync>,
    pub on_ready: Box<dyn Fn() + Send + Sync>,
}

#[derive(Debug, Default)]
struct Correlation {
    req_to_session: HashMap<String, String>,
    run_to_session: HashMap<String, String>,
    /// Sticky hint used only when no correlation table matches.
    last_session_id: String,
}

pub struct GatewayClient {
    cfg: GatewayConfig,
    handlers: GatewayHandlers,
    writer: RwLock<Option<mpsc::UnboundedSender<WsMessage>>>,
    ready: AtomicBool,
    next_req_id: AtomicU64,
    correlation: Mutex<Correlation>,
    deltas: Mutex<DeltaTracker>,
}

impl GatewayClient {
    pub fn new(cfg: GatewayConfig, handlers: GatewayHandlers) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            handlers,
            writer: RwLock::new(None),
            ready: AtomicBool::new(false),
            next_req_id: AtomicU64::new(0),
            correlation: Mutex::new(Correlation::default()),
            deltas: Mutex::new(DeltaTracker::default()),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Worker loop: connect, serve, back off, repeat. Returns `Ok` on
    /// shutdown and `Err` only for the terminal auth failure.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), GatewayError> {
        let initial = Duration::from_secs(self.cfg.reconnect_initial_seconds.max(1));
        let max_backoff = Duration::from_secs(self.cfg.reconnect_max_seconds.max(1));
        let mut backoff = initial;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect_and_serve(&shutdown).await {
                Ok(()) => {
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    backoff = initial;
                }
                Err(GatewayError::AuthFailed(msg)) => {
                    return Err(GatewayError::AuthFailed(msg));
                }
                Err(err) => {
                    let text = err.to_string();
                    (self.handlers.on_disconnected)(&text);
                    warn!(error = %text, retry_in = ?backoff, "gateway disconnected");

                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    async fn connect_and_serve(&self, shutdown: &CancellationToken) -> Result<(), GatewayError> {
        let (ws, _response) = connect_async(&self.cfg.url)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });
        *self.writer.write() = Some(tx.clone());

        let result = self.serve(&mut stream, &tx, shutdown).await;

        self.ready.store(false, Ordering::SeqCst);
        *self.writer.write() = None;
        drop(tx);
        let _ = writer_task.await;
        result
    }

    async fn serve(
        &self,
        stream: &mut SplitStream<WsStream>,
        tx: &mpsc::UnboundedSender<WsMessage>,
        shutdown: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let handshake_deadline = Duration::from_secs(self.cfg.challenge_timeout_seconds.max(1));

        tokio::time::timeout(handshake_deadline, self.wait_for_challenge(stream))
            .await
            .map_err(|_| GatewayError::Connection("challenge timeout".to_string()))??;
        tokio::time::timeout(handshake_deadline, self.perform_connect(stream, tx))
            .await
            .map_err(|_| GatewayError::Connection("connect response timeout".to_string()))??;

        self.ready.store(true, Ordering::SeqCst);
        info!(url = %self.cfg.url, client_id = %self.cfg.client.id, "gateway ready");
        (self.handlers.on_ready)();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = stream.next() => {
                    let msg = match next {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(GatewayError::Connection(e.to_string())),
                        None => return Err(GatewayError::Connection("connection closed".to_string())),
                    };
                    let WsMessage::Text(text) = msg else { continue };
                    let Ok(env) = serde_json::from_str::<Envelope>(&text) else { continue };
                    match env.kind.as_str() {
                        "event" => self.handle_event(&env),
                        "res" => self.handle_response(&env)?,
                        _ => {}
                    }
                }
            }
        }
    }

    /// Read until the gateway announces its challenge. Error events and
    /// failed pre-connect responses abort the attempt.
    async fn wait_for_challenge(
        &self,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<(), GatewayError> {
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(env) = serde_json::from_str::<Envelope>(&text) else {
                        continue;
                    };
                    if env.kind == "event" && env.event == "connect.challenge" {
                        return Ok(());
                    }
                    if env.kind == "event"
                        && is_error_event_name(&env.event.trim().to_lowercase())
                    {
                        let msg = extract_error_message(&env);
                        if is_unauthorized(&msg) {
                            return Err(GatewayError::AuthFailed(msg));
                        }
                        return Err(GatewayError::Connection(format!(
                            "gateway challenge failed: {msg}"
                        )));
                    }
                    if env.kind == "res" && env.ok == Some(false) {
                        let msg = extract_error_message(&env);
                        if is_unauthorized(&msg) {
                            return Err(GatewayError::AuthFailed(msg));
                        }
                        return Err(GatewayError::Connection(format!(
                            "gateway pre-connect response failed: {msg}"
                        )));
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(GatewayError::Connection(format!("wait challenge: {e}")))
                }
                None => {
                    return Err(GatewayError::Connection(
                        "connection closed awaiting challenge".to_string(),
                    ))
                }
            }
        }
    }

    /// Send the connect request and read until its response arrives.
    async fn perform_connect(
        &self,
        stream: &mut SplitStream<WsStream>,
        tx: &mpsc::UnboundedSender<WsMessage>,
    ) -> Result<(), GatewayError> {
        let req_id = self.next_id("gw_connect_");
        let connect = json!({
            "type": "req",
            "id": req_id,
            "method": "connect",
            "params": {
                "minProtocol": self.cfg.min_protocol,
                "maxProtocol": self.cfg.max_protocol,
                "auth": { "token": self.cfg.auth.token },
                "client": {
                    "id": self.cfg.client.id,
                    "displayName": self.cfg.client.display_name,
                    "version": self.cfg.client.version,
                    "platform": self.cfg.client.platform,
                    "mode": self.cfg.client.mode,
                },
                "role": "operator",
                "scopes": normalize_scopes(&self.cfg.scopes),
                "caps": [],
                "locale": self.cfg.locale,
                "userAgent": self.cfg.user_agent,
            }
        });
        let text = serde_json::to_string(&connect)?;
        tx.send(WsMessage::Text(text))
            .map_err(|_| GatewayError::Connection("gateway disconnected".to_string()))?;

        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(env) = serde_json::from_str::<Envelope>(&text) else {
                        continue;
                    };
                    if env.kind == "res" && env.id == req_id {
                        if env.ok == Some(true) {
                            return Ok(());
                        }
                        let msg = extract_error_message(&env);
                        if is_unauthorized(&msg) {
                            return Err(GatewayError::AuthFailed(msg));
                        }
                        return Err(GatewayError::Connection(format!(
                            "gateway connect failed: {msg}"
                        )));
                    }
                    if env.kind == "event"
                        && is_error_event_name(&env.event.trim().to_lowercase())
                    {
                        let msg = extract_error_message(&env);
                        if is_unauthorized(&msg) {
                            return Err(GatewayError::AuthFailed(msg));
                        }
                        return Err(GatewayError::Connection(format!(
                            "gateway connect event error: {msg}"
                        )));
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(GatewayError::Connection(format!("wait connect response: {e}")))
                }
                None => {
                    return Err(GatewayError::Connection(
                        "connection closed awaiting connect response".to_string(),
                    ))
                }
            }
        }
    }

    /// Issue the upstream request for a user message. Image attachments run
    /// through the fitter before serialization.
    pub fn send_user_message(&self, session_id: &str, event: &Event) -> Result<(), GatewayError> {
        let content = event.content.trim();
        if content.is_empty() {
            return Err(GatewayError::ContentRequired);
        }

        let req_id = self.next_id("gw_req_");
        let method = self.cfg.send_method.clone();

        let mut params = Map::new();
        if is_chat_style_method(&method) {
            params.insert(
                "sessionKey".to_string(),
                Value::String(session_key(session_id)),
            );
            params.insert("message".to_string(), Value::String(content.to_string()));
            params.insert(
                "idempotencyKey".to_string(),
                Value::String(req_id.clone()),
            );
        } else if !self.cfg.send_to.trim().is_empty() {
            params.insert(
                "to".to_string(),
                Value::String(self.cfg.send_to.trim().to_string()),
            );
            params.insert("message".to_string(), Value::String(content.to_string()));
            params.insert(
                "idempotencyKey".to_string(),
                Value::String(req_id.clone()),
            );
        } else {
            params.insert("content".to_string(), Value::String(content.to_string()));
        }

        let attachments = normalize_images(&event.images);
        if !attachments.is_empty() {
            let fitted = fit_attachments(&method, &req_id, &params, &attachments)?;
            if fitted.changed {
                debug!(
                    before = fitted.before_bytes,
                    after = fitted.after_bytes,
                    "attachments compressed to fit gateway frame"
                );
            }
            params.insert(
                "attachments".to_string(),
                Value::Array(
                    fitted
                        .attachments
                        .into_iter()
                        .map(Value::Object)
                        .collect(),
                ),
            );
        }

        self.track_request(&req_id, session_id);
        let msg = json!({
            "type": "req",
            "id": req_id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_json(&msg) {
            self.untrack_request(&req_id);
            return Err(err);
        }
        Ok(())
    }

    /// Ask the upstream to abort the session's in-flight turn.
    pub fn send_cancel(&self, session_id: &str) -> Result<(), GatewayError> {
        let req_id = self.next_id("gw_req_");
        self.track_request(&req_id, session_id);

        let msg = json!({
            "type": "req",
            "id": req_id,
            "method": self.cfg.cancel_method,
            "params": { "sessionKey": session_key(session_id) },
        });
        if let Err(err) = self.write_json(&msg) {
            self.untrack_request(&req_id);
            return Err(err);
        }
        Ok(())
    }

    fn write_json(&self, msg: &Value) -> Result<(), GatewayError> {
        if !self.is_ready() {
            return Err(GatewayError::NotReady);
        }
        let text = serde_json::to_string(msg)?;
        let writer = self.writer.read();
        let Some(tx) = writer.as_ref() else {
            return Err(GatewayError::Connection("gateway disconnected".to_string()));
        };
        tx.send(WsMessage::Text(text))
            .map_err(|_| GatewayError::Connection("gateway disconnected".to_string()))
    }

    /// Dispatch a `res` envelope. Responses for unknown requests drop
    /// silently; an unauthorized failure escalates to the terminal error.
    fn handle_response(&self, env: &Envelope) -> Result<(), GatewayError> {
        if env.id.is_empty() {
            return Ok(());
        }
        let Some(session_id) = self.request_session(&env.id) else {
            return Ok(());
        };

        let payload = decode_payload(env.payload.as_ref());
        let run_id = extract_run_id(&payload);
        if !run_id.is_empty() {
            self.track_run(&run_id, &session_id);
        }

        if env.ok == Some(true) {
            let status = string_value(payload.get("status")).trim().to_lowercase();
            if is_pending_status(&status) {
                let content = extract_content(&payload);
                if !content.is_empty() {
                    self.emit(&session_id, Event::token(content));
                }
            } else if is_final_status(&status) {
                let content = extract_content(&payload);
                if !content.is_empty() {
                    self.emit(&session_id, Event::token(content));
                }
                self.emit(&session_id, Event::end());
                self.clear_session_tracks(&session_id);
            } else if is_error_status(&status) {
                self.emit(
                    &session_id,
                    Event::error(
                        ERR_GATEWAY_REQUEST_FAILED,
                        extract_error_message_from_payload(&payload),
                    ),
                );
                self.clear_session_tracks(&session_id);
            } else if is_chat_style_method(&self.cfg.send_method) {
                // Chat-style sends may answer with the full text inline.
                let text = extract_chat_text(&payload);
                if !text.is_empty() {
                    self.emit(&session_id, Event::token(text));
                    self.emit(&session_id, Event::end());
                    self.clear_session_tracks(&session_id);
                }
            }
            return Ok(());
        }

        let msg = extract_error_message(env);
        self.emit(
            &session_id,
            Event::error(ERR_GATEWAY_REQUEST_FAILED, &msg),
        );
        self.clear_session_tracks(&session_id);
        if is_unauthorized(&msg) {
            return Err(GatewayError::AuthFailed(msg));
        }
        Ok(())
    }

    /// Dispatch an `event` envelope: resolve the session, normalize, emit.
    /// Terminal events clear the session's correlation state.
    fn handle_event(&self, env: &Envelope) {
        let payload = decode_payload(env.payload.as_ref());
        let corr_id = extract_correlation_id(env, &payload);
        let run_id = extract_run_id(&payload);

        let session_id = self.resolve_session_id(&corr_id, &run_id, &payload);
        if session_id.is_empty() {
            debug!(event = %env.event, "drop gateway event without session");
            return;
        }

        let mut mapped = map_gateway_event(env);
        if self.cfg.cumulative_text && !run_id.is_empty() {
            mapped = mapped
                .into_iter()
                .filter_map(|ev| {
                    if ev.kind == EVENT_TOKEN {
                        self.deltas
                            .lock()
                            .delta(&run_id, &ev.content)
                            .map(Event::token)
                    } else {
                        Some(ev)
                    }
                })
                .collect();
        }

        for event in mapped {
            let terminal = event.is_terminal();
            self.emit(&session_id, event);
            if terminal {
                self.clear_session_tracks(&session_id);
                if !run_id.is_empty() {
                    self.deltas.lock().clear(&run_id);
                }
            }
        }
    }

    /// Session resolution order: explicit payload sid, req→session by
    /// correlation id, run→session by run id, run→session by correlation id,
    /// then the sticky last-session hint.
    fn resolve_session_id(
        &self,
        corr_id: &str,
        run_id: &str,
        payload: &Map<String, Value>,
    ) -> String {
        let explicit = extract_session_id(payload);
        if !explicit.is_empty() {
            return explicit;
        }

        let correlation = self.correlation.lock();
        if !corr_id.is_empty() {
            if let Some(sid) = correlation.req_to_session.get(corr_id) {
                return sid.clone();
            }
        }
        if !run_id.is_empty() {
            if let Some(sid) = correlation.run_to_session.get(run_id) {
                return sid.clone();
            }
        }
        if !corr_id.is_empty() {
            if let Some(sid) = correlation.run_to_session.get(corr_id) {
                return sid.clone();
            }
        }
        correlation.last_session_id.clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}{n}")
    }

    fn track_request(&self, req_id: &str, session_id: &str) {
        let mut correlation = self.correlation.lock();
        correlation
            .req_to_session
            .insert(req_id.to_string(), session_id.to_string());
        correlation.last_session_id = session_id.to_string();
    }

    fn untrack_request(&self, req_id: &str) {
        self.correlation.lock().req_to_session.remove(req_id);
    }

    fn request_session(&self, req_id: &str) -> Option<String> {
        self.correlation.lock().req_to_session.get(req_id).cloned()
    }

    fn track_run(&self, run_id: &str, session_id: &str) {
        self.correlation
            .lock()
            .run_to_session
            .insert(run_id.to_string(), session_id.to_string());
    }

    /// Remove every req→session and run→session entry pointing at the
    /// session, along with the delta state of its runs.
    fn clear_session_tracks(&self, session_id: &str) {
        let cleared_runs: Vec<String> = {
            let mut correlation = self.correlation.lock();
            correlation
                .req_to_session
                .retain(|_, sid| sid != session_id);
            let runs: Vec<String> = correlation
                .run_to_session
                .iter()
                .filter(|(_, sid)| sid.as_str() == session_id)
                .map(|(run, _)| run.clone())
                .collect();
            for run in &runs {
                correlation.run_to_session.remove(run);
            }
            runs
        };
        let mut deltas = self.deltas.lock();
        for run in cleared_runs {
            deltas.clear(&run);
        }
    }

    fn emit(&self, session_id: &str, event: Event) {
        (self.handlers.on_event)(session_id, event);
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> (usize, usize) {
        let correlation = self.correlation.lock();
        (
            correlation.req_to_session.len(),
            correlation.run_to_session.len(),
        )
    }
}

/// The opaque conversation token presented upstream.
fn session_key(session_id: &str) -> String {
    format!("bridge_{session_id}")
}

fn is_chat_style_method(method: &str) -> bool {
    method.contains("chat") || method == "agent" || method.starts_with("agent.")
}

fn is_unauthorized(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("unauthorized") || lower.contains("forbidden")
}

/// Trim, drop empties, dedup preserving order; default operator scopes when
/// nothing is configured.
fn normalize_scopes(scopes: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for scope in scopes {
        let scope = scope.trim();
        if scope.is_empty() || !seen.insert(scope.to_string()) {
            continue;
        }
        out.push(scope.to_string());
    }
    if out.is_empty() {
        return vec!["operator.read".to_string(), "operator.write".to_string()];
    }
    out
}

/// Map inline images to upstream attachment objects, dropping empties.
fn normalize_images(images: &[ImageItem]) -> Vec<Map<String, Value>> {
    let mut out = Vec::with_capacity(images.len());
    for image in images {
        let data = image.data.trim();
        if data.is_empty() {
            continue;
        }
        let mut att = Map::new();
        att.insert("type".to_string(), Value::String("image".to_string()));
        att.insert("content".to_string(), Value::String(data.to_string()));
        let mime = image.mime_type.trim();
        if !mime.is_empty() {
            att.insert("mimeType".to_string(), Value::String(mime.to_string()));
        }
        out.push(att);
    }
    out
}
