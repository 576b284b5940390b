//! Wire protocol shared by the relay, the connector, and the client.
//!
//! Two layers travel over every bridge connection:
//!
//! - **Control messages** -- text frames carrying compact JSON with a `type`
//!   discriminator and a protocol version `v` (rendezvous, session lifecycle,
//!   heartbeats, typed errors).
//! - **Data frames** -- binary frames addressed to a session, carrying an
//!   opaque payload (see [`frame`]). When the e2ee flag is clear the payload
//!   is a JSON [`Event`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod frame;

pub use frame::{build_data_frame, parse_data_frame, FLAG_E2EE};

/// Protocol version stamped on every encoded control message.
pub const VERSION: u32 = 1;

/// Relay error codes carried in `ERROR` control messages.
pub const ERR_BAD_CONTROL: &str = "BAD_CONTROL";
pub const ERR_BAD_DATA_FRAME: &str = "BAD_DATA_FRAME";
pub const ERR_SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const ERR_SESSION_PEER_MISMATCH: &str = "SESSION_PEER_MISMATCH";
pub const ERR_CONNECTOR_NOT_FOUND: &str = "CONNECTOR_NOT_FOUND";
pub const ERR_UNSUPPORTED_CONTROL: &str = "UNSUPPORTED_CONTROL";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing event type")]
    MissingEventType,
    #[error("session_id required")]
    SessionIdRequired,
    #[error("session_id too long")]
    SessionIdTooLong,
    #[error("frame too short")]
    FrameTooShort,
    #[error("invalid frame header")]
    InvalidFrameHeader,
    #[error("session id is not valid UTF-8")]
    InvalidSessionId,
}

/// Control message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    Register,
    Connect,
    ConnectOk,
    SessionOpen,
    CloseSession,
    Heartbeat,
    Error,
}

/// Capability bits advertised by a connector at registration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    #[serde(default)]
    pub e2ee: bool,
}

/// A control message as it appears on the wire. Optional fields are present
/// only for the message types that use them; unknown fields are ignored on
/// decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlType,
    #[serde(default)]
    pub v: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_code_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_code: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub e2ee: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<Caps>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl ControlMessage {
    pub fn new(kind: ControlType) -> Self {
        Self {
            kind,
            v: VERSION,
            access_code_hash: String::new(),
            access_code: String::new(),
            generation: 0,
            session_id: String::new(),
            e2ee: false,
            caps: None,
            code: String::new(),
            message: String::new(),
        }
    }

    pub fn register(access_code_hash: impl Into<String>, generation: u32, caps: Caps) -> Self {
        Self {
            access_code_hash: access_code_hash.into(),
            generation,
            caps: Some(caps),
            ..Self::new(ControlType::Register)
        }
    }

    pub fn connect(access_code: impl Into<String>, e2ee: bool) -> Self {
        Self {
            access_code: access_code.into(),
            e2ee,
            ..Self::new(ControlType::Connect)
        }
    }

    pub fn connect_ok(session_id: impl Into<String>, caps: Caps) -> Self {
        Self {
            session_id: session_id.into(),
            caps: Some(caps),
            ..Self::new(ControlType::ConnectOk)
        }
    }

    pub fn session_open(session_id: impl Into<String>, e2ee: bool) -> Self {
        Self {
            session_id: session_id.into(),
            e2ee,
            ..Self::new(ControlType::SessionOpen)
        }
    }

    pub fn close_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::new(ControlType::CloseSession)
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(ControlType::Heartbeat)
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            ..Self::new(ControlType::Error)
        }
    }
}

/// Decode a control message. A missing `type` is a decode failure; a missing
/// `v` defaults to the current protocol version.
pub fn decode_control(data: &[u8]) -> Result<ControlMessage, ProtocolError> {
    let mut msg: ControlMessage = serde_json::from_slice(data)?;
    if msg.v == 0 {
        msg.v = VERSION;
    }
    Ok(msg)
}

/// Encode a control message as compact JSON, stamping the protocol version.
pub fn encode_control(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut msg = msg.clone();
    if msg.v == 0 {
        msg.v = VERSION;
    }
    Ok(serde_json::to_vec(&msg)?)
}

/// Event type carried between client and connector inside data frames.
pub const EVENT_USER_MESSAGE: &str = "user_message";
pub const EVENT_TOKEN: &str = "token";
pub const EVENT_END: &str = "end";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_CONTROL: &str = "control";

/// An inline image sent alongside a user message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageItem {
    /// Base64-encoded image bytes (a `data:` URI prefix is tolerated).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, rename = "mimeType", skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
}

/// The JSON payload of a non-e2ee data frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageItem>,
}

impl Event {
    pub fn user_message(content: impl Into<String>) -> Self {
        Self {
            kind: EVENT_USER_MESSAGE.to_string(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn token(content: impl Into<String>) -> Self {
        Self {
            kind: EVENT_TOKEN.to_string(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn end() -> Self {
        Self {
            kind: EVENT_END.to_string(),
            ..Self::default()
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: EVENT_ERROR.to_string(),
            code: code.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == EVENT_END || self.kind == EVENT_ERROR
    }
}

pub fn encode_event(event: &Event) -> Result<Vec<u8>, ProtocolError> {
    if event.kind.is_empty() {
        return Err(ProtocolError::MissingEventType);
    }
    Ok(serde_json::to_vec(event)?)
}

pub fn decode_event(data: &[u8]) -> Result<Event, ProtocolError> {
    let event: Event = serde_json::from_slice(data)?;
    if event.kind.is_empty() {
        return Err(ProtocolError::MissingEventType);
    }
    Ok(event)
}

/// Hash an access code for registration and lookup. Both sides of the
/// rendezvous must produce the identical string for the same code.
pub fn hash_access_code(access_code: &str) -> String {
    let digest = Sha256::digest(access_code.as_bytes());
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_round_trip() {
        let msg = ControlMessage::register("sha256:abc", 3, Caps { e2ee: true });
        let encoded = encode_control(&msg).unwrap();
        let decoded = decode_control(&encoded).unwrap();
        assert_eq!(decoded.kind, ControlType::Register);
        assert_eq!(decoded.v, VERSION);
        assert_eq!(decoded.access_code_hash, "sha256:abc");
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.caps, Some(Caps { e2ee: true }));
    }

    #[test]
    fn test_control_missing_type_fails() {
        assert!(decode_control(br#"{"v":1}"#).is_err());
    }

    #[test]
    fn test_control_missing_version_defaults() {
        let decoded = decode_control(br#"{"type":"HEARTBEAT"}"#).unwrap();
        assert_eq!(decoded.kind, ControlType::Heartbeat);
        assert_eq!(decoded.v, VERSION);
    }

    #[test]
    fn test_control_unknown_fields_ignored() {
        let decoded =
            decode_control(br#"{"type":"CONNECT","access_code":"x","future":true}"#).unwrap();
        assert_eq!(decoded.kind, ControlType::Connect);
        assert_eq!(decoded.access_code, "x");
    }

    #[test]
    fn test_control_wire_names() {
        let encoded = encode_control(&ControlMessage::connect_ok("s_1", Caps::default())).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(raw["type"], "CONNECT_OK");
        assert_eq!(raw["session_id"], "s_1");
        // Fields for other message types must be absent, not null.
        assert!(raw.get("access_code").is_none());
        assert!(raw.get("code").is_none());
    }

    #[test]
    fn test_event_round_trip() {
        let event = Event::user_message("hello");
        let encoded = encode_event(&event).unwrap();
        let decoded = decode_event(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_event_missing_type_fails() {
        assert!(decode_event(br#"{"content":"hi"}"#).is_err());
        assert!(encode_event(&Event::default()).is_err());
    }

    #[test]
    fn test_event_images_round_trip() {
        let mut event = Event::user_message("look");
        event.images.push(ImageItem {
            data: "aGVsbG8=".to_string(),
            mime_type: "image/png".to_string(),
        });
        let encoded = encode_event(&event).unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(raw["images"][0]["mimeType"], "image/png");
        assert_eq!(decode_event(&encoded).unwrap(), event);
    }

    #[test]
    fn test_hash_access_code_stable() {
        let a = hash_access_code("hunter2");
        let b = hash_access_code("hunter2");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        let hex = &a["sha256:".len()..];
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hash_access_code_known_value() {
        // sha256("hunter2")
        assert_eq!(
            hash_access_code("hunter2"),
            "sha256:f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7"
        );
    }
}
