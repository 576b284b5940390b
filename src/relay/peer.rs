//! Peer handles.
//!
//! A [`Peer`] wraps one upgraded WebSocket connection. All outbound traffic
//! goes through the peer's unbounded channel, drained by a single writer task
//! that owns the socket's sink half; that task is the only writer, so frames
//! from concurrent senders never interleave. The reader loop owns the stream
//! half exclusively and needs no locking.

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Role tag assigned at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Connector,
    Client,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Connector => "connector",
            PeerRole::Client => "client",
        }
    }
}

/// Error returned when a send is attempted on a dead transport. Callers treat
/// any send failure as peer-fatal.
#[derive(Debug, thiserror::Error)]
#[error("peer transport closed")]
pub struct PeerSendError;

#[derive(Debug)]
pub struct Peer {
    id: String,
    role: PeerRole,
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl Peer {
    /// `closed` is shared with the connection's writer task so that closing
    /// the peer also closes the transport.
    pub fn new(
        id: String,
        role: PeerRole,
        tx: mpsc::UnboundedSender<Message>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            role,
            tx,
            closed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn send_text(&self, data: String) -> Result<(), PeerSendError> {
        self.tx.send(Message::Text(data)).map_err(|_| PeerSendError)
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), PeerSendError> {
        self.tx
            .send(Message::Binary(data))
            .map_err(|_| PeerSendError)
    }

    /// Request the peer's reader loop to exit, which tears the connection
    /// down through the normal cleanup path. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

/// Random peer/session identifier with a role prefix, e.g. `c_9f2a…`.
pub fn new_id(prefix: &str) -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut id = String::with_capacity(prefix.len() + 16);
    id.push_str(prefix);
    for byte in bytes {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}
