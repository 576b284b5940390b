//! Relay client for the connector.
//!
//! Dials the relay's `/tunnel` endpoint, registers the access-code hash,
//! then pumps inbound control and data frames into the bridge. Heartbeats
//! keep idle-connection reapers away. The link reconnects at a fixed delay
//! for as long as the connector runs.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::connector::bridge::{Bridge, RelaySender};
use crate::protocol::{
    build_data_frame, decode_control, encode_control, parse_data_frame, ControlMessage,
    ControlType,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

pub struct RelayLink {
    cfg: Arc<Config>,
    writer: RwLock<Option<mpsc::UnboundedSender<WsMessage>>>,
}

impl RelayLink {
    pub fn new(cfg: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            writer: RwLock::new(None),
        })
    }

    /// Reconnect loop. Returns when the shutdown token fires.
    pub async fn run(self: Arc<Self>, bridge: Arc<dyn Bridge>, shutdown: CancellationToken) {
        let delay = Duration::from_secs(self.cfg.reconnect_seconds.max(1));
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            if let Err(err) = self.connect_and_serve(&bridge, &shutdown).await {
                warn!(error = %err, "relay disconnected");
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_and_serve(
        &self,
        bridge: &Arc<dyn Bridge>,
        shutdown: &CancellationToken,
    ) -> Result<(), String> {
        let (ws, _response) = connect_async(&self.cfg.relay_url)
            .await
            .map_err(|e| e.to_string())?;
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

        let register = ControlMessage::register(
            &self.cfg.access_code_hash,
            self.cfg.generation,
            self.cfg.caps,
        );
        let registered = self.send_control(&register);

        let conn_done = CancellationToken::new();
        let heartbeat_task = spawn_heartbeat(tx.clone(), conn_done.clone(), shutdown.clone());

        let result = if let Err(err) = registered {
            Err(err)
        } else {
            self.serve(&mut stream, bridge, shutdown).await
        };

        conn_done.cancel();
        *self.writer.write() = None;
        drop(tx);
        let _ = writer_task.await;
        let _ = heartbeat_task.await;
        result
    }

    async fn serve(
        &self,
        stream: &mut futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
        bridge: &Arc<dyn Bridge>,
        shutdown: &CancellationToken,
    ) -> Result<(), String> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = stream.next() => {
                    let msg = match next {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e.to_string()),
                        None => return Err("connection closed".to_string()),
                    };
                    match msg {
                        WsMessage::Text(text) => {
                            let Ok(control) = decode_control(text.as_bytes()) else {
                                continue;
                            };
                            self.dispatch_control(bridge, control);
                        }
                        WsMessage::Binary(frame) => {
                            let Ok((session_id, flags, payload)) = parse_data_frame(&frame)
                            else {
                                continue;
                            };
                            bridge.handle_data(session_id, flags, payload);
                        }
                        WsMessage::Close(_) => return Err("relay closed connection".to_string()),
                        _ => {}
                    }
                }
            }
        }
    }

    fn dispatch_control(&self, bridge: &Arc<dyn Bridge>, control: ControlMessage) {
        match control.kind {
            ControlType::SessionOpen => {
                info!(sid = %control.session_id, "session open");
                bridge.open_session(&control.session_id);
            }
            ControlType::CloseSession => {
                info!(sid = %control.session_id, "session close");
                bridge.close_session(&control.session_id);
            }
            ControlType::Error => {
                warn!(code = %control.code, message = %control.message, "relay error");
            }
            _ => {}
        }
    }

    pub fn send_control(&self, msg: &ControlMessage) -> Result<(), String> {
        let data = encode_control(msg).map_err(|e| e.to_string())?;
        let text = String::from_utf8(data).map_err(|e| e.to_string())?;
        self.write(WsMessage::Text(text))
    }

    fn write(&self, msg: WsMessage) -> Result<(), String> {
        let writer = self.writer.read();
        let Some(tx) = writer.as_ref() else {
            return Err("relay not connected".to_string());
        };
        tx.send(msg).map_err(|_| "relay not connected".to_string())
    }
}

impl RelaySender for RelayLink {
    fn send_data(&self, session_id: &str, flags: u8, payload: &[u8]) -> Result<(), String> {
        let frame = build_data_frame(session_id, flags, payload).map_err(|e| e.to_string())?;
        self.write(WsMessage::Binary(frame))
    }
}

/// Periodic HEARTBEAT sender; stops with the connection or the process.
fn spawn_heartbeat(
    tx: mpsc::UnboundedSender<WsMessage>,
    conn_done: CancellationToken,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        // The first tick fires immediately; registration already went out.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = conn_done.cancelled() => return,
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let heartbeat = match encode_control(&ControlMessage::heartbeat()) {
                        Ok(data) => data,
                        Err(_) => return,
                    };
                    let Ok(text) = String::from_utf8(heartbeat) else {
                        return;
                    };
                    if tx.send(WsMessage::Text(text)).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, Caps};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            relay_url: "ws://127.0.0.1:1/tunnel".to_string(),
            access_code: String::new(),
            access_code_hash: protocol::hash_access_code("code"),
            generation: 1,
            caps: Caps::default(),
            reconnect_seconds: 1,
            gateway: crate::config::GatewayConfig::defaulted(),
        })
    }

    #[test]
    fn test_send_fails_when_disconnected() {
        let link = RelayLink::new(test_config());
        assert!(link.send_data("s_1", 0, b"payload").is_err());
        assert!(link
            .send_control(&ControlMessage::heartbeat())
            .is_err());
    }

    #[tokio::test]
    async fn test_send_data_frames_through_writer() {
        let link = RelayLink::new(test_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        *link.writer.write() = Some(tx);

        link.send_data("s_1", protocol::FLAG_E2EE, b"hello").unwrap();

        let WsMessage::Binary(frame) = rx.try_recv().unwrap() else {
            panic!("expected binary frame");
        };
        let (sid, flags, payload) = parse_data_frame(&frame).unwrap();
        assert_eq!(sid, "s_1");
        assert_eq!(flags, protocol::FLAG_E2EE);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_send_control_encodes_text() {
        let link = RelayLink::new(test_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        *link.writer.write() = Some(tx);

        link.send_control(&ControlMessage::heartbeat()).unwrap();

        let WsMessage::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let control = decode_control(text.as_bytes()).unwrap();
        assert_eq!(control.kind, ControlType::Heartbeat);
    }
}
