//! Binary data-frame codec.
//!
//! Layout: `sid_len (1) | session id (sid_len) | flags (1) | payload (..)`.
//! The relay parses only the session id and forwards the original bytes; the
//! flags byte and payload stay opaque in transit.

use super::ProtocolError;

/// Bit 0 of the flags byte: payload is end-to-end encrypted.
pub const FLAG_E2EE: u8 = 1 << 0;

/// Build a data frame. Fails when the session id is empty or longer than the
/// one-byte length prefix can express.
pub fn build_data_frame(
    session_id: &str,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if session_id.is_empty() {
        return Err(ProtocolError::SessionIdRequired);
    }
    if session_id.len() > 255 {
        return Err(ProtocolError::SessionIdTooLong);
    }

    let mut frame = Vec::with_capacity(1 + session_id.len() + 1 + payload.len());
    frame.push(session_id.len() as u8);
    frame.extend_from_slice(session_id.as_bytes());
    frame.push(flags);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse a data frame, borrowing the session id and payload from the input.
pub fn parse_data_frame(frame: &[u8]) -> Result<(&str, u8, &[u8]), ProtocolError> {
    if frame.len() < 3 {
        return Err(ProtocolError::FrameTooShort);
    }
    let sid_len = frame[0] as usize;
    if sid_len == 0 {
        return Err(ProtocolError::InvalidFrameHeader);
    }
    if frame.len() < 1 + sid_len + 1 {
        return Err(ProtocolError::InvalidFrameHeader);
    }

    let session_id = std::str::from_utf8(&frame[1..1 + sid_len])
        .map_err(|_| ProtocolError::InvalidSessionId)?;
    let flags = frame[1 + sid_len];
    let payload = &frame[1 + sid_len + 1..];
    Ok((session_id, flags, payload))
}
