//! Bridges between relay sessions and the gateway.
//!
//! The relay side calls in with session lifecycle controls and data frames;
//! the gateway side calls in with normalized events. The bridge remembers
//! the last-seen flags byte per session so outbound frames echo the client's
//! e2ee bit, and translates every failure into a typed error event on the
//! data channel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::gateway::GatewayError;
use crate::protocol::{self, Event, EVENT_CONTROL, EVENT_USER_MESSAGE};

/// Error codes the bridge produces on the data channel.
const ERR_BAD_EVENT: &str = "BAD_EVENT";
const ERR_SESSION_NOT_OPEN: &str = "SESSION_NOT_OPEN";
const ERR_GATEWAY_NOT_CONFIGURED: &str = "GATEWAY_NOT_CONFIGURED";
const ERR_GATEWAY_NOT_READY: &str = "GATEWAY_NOT_READY";
const ERR_GATEWAY_SEND_FAILED: &str = "GATEWAY_SEND_FAILED";
const ERR_GATEWAY_CANCEL_FAILED: &str = "GATEWAY_CANCEL_FAILED";
const ERR_UNSUPPORTED_EVENT: &str = "UNSUPPORTED_EVENT";
const ERR_UNSUPPORTED_CONTROL: &str = "UNSUPPORTED_CONTROL";
const ERR_GATEWAY_DISCONNECTED: &str = "GATEWAY_DISCONNECTED";

/// Outbound data path back through the relay.
pub trait RelaySender: Send + Sync {
    fn send_data(&self, session_id: &str, flags: u8, payload: &[u8]) -> Result<(), String>;
}

/// Upstream request path into the gateway client.
pub trait GatewaySender: Send + Sync {
    fn send_user_message(&self, session_id: &str, event: &Event) -> Result<(), GatewayError>;
    fn send_cancel(&self, session_id: &str) -> Result<(), GatewayError>;
    fn is_ready(&self) -> bool;
}

/// Relay-driven session lifecycle and inbound data, shared by the gateway
/// bridge and the echo bridge.
pub trait Bridge: Send + Sync {
    fn open_session(&self, session_id: &str);
    fn close_session(&self, session_id: &str);
    fn handle_data(&self, session_id: &str, flags: u8, payload: &[u8]);
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionState {
    flags: u8,
}

/// The production bridge: relay sessions in, gateway requests out.
pub struct GatewayBridge {
    relay: Arc<dyn RelaySender>,
    gateway: RwLock<Option<Arc<dyn GatewaySender>>>,
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl GatewayBridge {
    pub fn new(relay: Arc<dyn RelaySender>) -> Arc<Self> {
        Arc::new(Self {
            relay,
            gateway: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Late-bound because the gateway client needs the bridge's callbacks
    /// before the bridge can hold the gateway.
    pub fn bind_gateway(&self, gateway: Arc<dyn GatewaySender>) {
        *self.gateway.write() = Some(gateway);
    }

    /// Deliver a normalized gateway event back through the relay. An empty
    /// session id is accepted only while exactly one session is open; events
    /// for unknown sessions are dropped.
    pub fn handle_gateway_event(&self, session_id: &str, event: Event) {
        let Some((sid, flags)) = self.resolve_session(session_id) else {
            debug!(kind = %event.kind, "drop gateway event without active session");
            return;
        };
        self.send_event(&sid, flags, &event);
    }

    /// Tell every active session that the upstream link dropped.
    pub fn handle_gateway_disconnected(&self, error: &str) {
        let active: Vec<(String, u8)> = self
            .sessions
            .read()
            .iter()
            .map(|(sid, state)| (sid.clone(), state.flags))
            .collect();

        for (sid, flags) in active {
            self.send_event(
                &sid,
                flags,
                &Event::error(
                    ERR_GATEWAY_DISCONNECTED,
                    format!("gateway disconnected: {error}"),
                ),
            );
        }
    }

    fn resolve_session(&self, session_id: &str) -> Option<(String, u8)> {
        let sessions = self.sessions.read();
        if !session_id.is_empty() {
            return sessions
                .get(session_id)
                .map(|state| (session_id.to_string(), state.flags));
        }
        if sessions.len() == 1 {
            return sessions
                .iter()
                .next()
                .map(|(sid, state)| (sid.clone(), state.flags));
        }
        None
    }

    fn send_event(&self, session_id: &str, flags: u8, event: &Event) {
        let payload = match protocol::encode_event(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(sid = %session_id, error = %err, "encode event failed");
                return;
            }
        };
        if let Err(err) = self.relay.send_data(session_id, flags, &payload) {
            warn!(sid = %session_id, error = %err, "relay send failed");
        }
    }
}

impl Bridge for GatewayBridge {
    fn open_session(&self, session_id: &str) {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default();
    }

    fn close_session(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    fn handle_data(&self, session_id: &str, flags: u8, payload: &[u8]) {
        let event = match protocol::decode_event(payload) {
            Ok(event) => event,
            Err(_) => {
                self.send_event(
                    session_id,
                    flags,
                    &Event::error(ERR_BAD_EVENT, "invalid event payload"),
                );
                return;
            }
        };

        let gateway = {
            let mut sessions = self.sessions.write();
            let Some(state) = sessions.get_mut(session_id) else {
                drop(sessions);
                self.send_event(
                    session_id,
                    flags,
                    &Event::error(ERR_SESSION_NOT_OPEN, "session not open"),
                );
                return;
            };
            state.flags = flags;
            self.gateway.read().clone()
        };

        let Some(gateway) = gateway else {
            self.send_event(
                session_id,
                flags,
                &Event::error(ERR_GATEWAY_NOT_CONFIGURED, "gateway client not configured"),
            );
            return;
        };
        if !gateway.is_ready() {
            self.send_event(
                session_id,
                flags,
                &Event::error(ERR_GATEWAY_NOT_READY, "gateway not ready"),
            );
            return;
        }

        match event.kind.as_str() {
            EVENT_USER_MESSAGE => {
                if let Err(err) = gateway.send_user_message(session_id, &event) {
                    self.send_event(
                        session_id,
                        flags,
                        &Event::error(ERR_GATEWAY_SEND_FAILED, err.to_string()),
                    );
                }
            }
            EVENT_CONTROL => {
                if event.action != "stop" {
                    self.send_event(
                        session_id,
                        flags,
                        &Event::error(ERR_UNSUPPORTED_CONTROL, "unsupported control action"),
                    );
                    return;
                }
                if let Err(err) = gateway.send_cancel(session_id) {
                    self.send_event(
                        session_id,
                        flags,
                        &Event::error(ERR_GATEWAY_CANCEL_FAILED, err.to_string()),
                    );
                }
            }
            _ => {
                self.send_event(
                    session_id,
                    flags,
                    &Event::error(ERR_UNSUPPORTED_EVENT, "unsupported event type"),
                );
            }
        }
    }
}

/// Bring-up bridge: streams each word of a user message straight back as
/// tokens. No gateway involved.
pub struct EchoBridge {
    relay: Arc<dyn RelaySender>,
    sessions: RwLock<HashMap<String, ()>>,
}

impl EchoBridge {
    pub fn new(relay: Arc<dyn RelaySender>) -> Arc<Self> {
        Arc::new(Self {
            relay,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn send_event(&self, session_id: &str, flags: u8, event: &Event) {
        let payload = match protocol::encode_event(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(sid = %session_id, error = %err, "encode event failed");
                return;
            }
        };
        if let Err(err) = self.relay.send_data(session_id, flags, &payload) {
            warn!(sid = %session_id, error = %err, "relay send failed");
        }
    }
}

impl Bridge for EchoBridge {
    fn open_session(&self, session_id: &str) {
        self.sessions.write().insert(session_id.to_string(), ());
    }

    fn close_session(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    fn handle_data(&self, session_id: &str, flags: u8, payload: &[u8]) {
        if !self.sessions.read().contains_key(session_id) {
            self.send_event(
                session_id,
                flags,
                &Event::error(ERR_SESSION_NOT_OPEN, "session not open"),
            );
            return;
        }

        let event = match protocol::decode_event(payload) {
            Ok(event) => event,
            Err(_) => {
                self.send_event(
                    session_id,
                    flags,
                    &Event::error(ERR_BAD_EVENT, "invalid event payload"),
                );
                return;
            }
        };

        if event.kind != EVENT_USER_MESSAGE {
            self.send_event(
                session_id,
                flags,
                &Event::error(ERR_UNSUPPORTED_EVENT, "unsupported event type"),
            );
            return;
        }

        let text = event.content.trim();
        for word in text.split_whitespace() {
            self.send_event(session_id, flags, &Event::token(format!("{word} ")));
        }
        self.send_event(session_id, flags, &Event::end());
    }
}
