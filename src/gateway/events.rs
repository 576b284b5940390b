//! Upstream event normalization.
//!
//! The gateway speaks a heterogeneous dialect: status-bearing acks, chat
//! stream updates, agent lifecycle events, bare token/done/error names. This
//! module maps any incoming event onto the small relay alphabet
//! `{token, end, error}` and provides the payload extractors used for
//! correlation. Payloads stay `serde_json` value bags; nothing here leaks
//! upstream shapes to the rest of the crate.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::protocol::Event;

use super::Envelope;

pub(crate) const ERR_GATEWAY_EVENT_ERROR: &str = "GATEWAY_EVENT_ERROR";
pub(crate) const ERR_GATEWAY_DISCONNECTED: &str = "GATEWAY_DISCONNECTED";

/// Decode an envelope payload into a string-keyed map. Missing or non-object
/// payloads become an empty map so extractors can run unconditionally.
pub(crate) fn decode_payload(payload: Option<&Value>) -> Map<String, Value> {
    match payload {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Render a scalar value as a string. Numbers format without a fraction so
/// numeric run ids stay stable as map keys.
pub(crate) fn string_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else if let Some(f) = n.as_f64() {
                format!("{:.0}", f)
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

pub(crate) fn extract_error_message(env: &Envelope) -> String {
    if let Some(error) = &env.error {
        if !error.message.is_empty() {
            return error.message.clone();
        }
    }
    let payload = decode_payload(env.payload.as_ref());
    extract_error_message_from_payload(&payload)
}

pub(crate) fn extract_error_message_from_payload(payload: &Map<String, Value>) -> String {
    if let Some(Value::Object(err)) = payload.get("error") {
        let msg = string_value(err.get("message"));
        if !msg.is_empty() {
            return msg;
        }
    }
    for key in ["message", "msg", "reason"] {
        let msg = string_value(payload.get(key));
        if !msg.is_empty() {
            return msg;
        }
    }
    "gateway event error".to_string()
}

/// Correlation id preference: payload request/run id keys, then the
/// envelope's own id.
pub(crate) fn extract_correlation_id(env: &Envelope, payload: &Map<String, Value>) -> String {
    for key in ["run_id", "runId", "request_id", "requestId", "req_id", "reqId", "id"] {
        let v = string_value(payload.get(key));
        if !v.is_empty() {
            return v;
        }
    }
    env.id.clone()
}

/// Run id extraction: top-level keys, a nested `run` object, then recursion
/// into the common wrapper objects.
pub(crate) fn extract_run_id(payload: &Map<String, Value>) -> String {
    for key in ["run_id", "runId"] {
        let v = string_value(payload.get(key));
        if !v.is_empty() {
            return v;
        }
    }
    if let Some(Value::Object(run)) = payload.get("run") {
        for key in ["id", "run_id", "runId"] {
            let v = string_value(run.get(key));
            if !v.is_empty() {
                return v;
            }
        }
    }
    for key in ["response", "result", "data", "output"] {
        if let Some(Value::Object(nested)) = payload.get(key) {
            let v = extract_run_id(nested);
            if !v.is_empty() {
                return v;
            }
        }
    }
    String::new()
}

pub(crate) fn extract_session_id(payload: &Map<String, Value>) -> String {
    for key in ["session_id", "sessionId", "sid"] {
        let v = string_value(payload.get(key));
        if !v.is_empty() {
            return v;
        }
    }
    String::new()
}

/// Flat fallback keys for textual content.
pub(crate) fn extract_content(payload: &Map<String, Value>) -> String {
    for key in ["content", "text", "token", "chunk", "delta"] {
        let v = string_value(payload.get(key));
        if !v.is_empty() {
            return v;
        }
    }
    String::new()
}

/// Chat-shaped text extraction: wrapper objects recursively, then
/// `message.content` (string or typed parts), then top-level `content`,
/// then the flat fallbacks.
pub(crate) fn extract_chat_text(payload: &Map<String, Value>) -> String {
    for key in ["response", "result", "data", "output"] {
        if let Some(Value::Object(nested)) = payload.get(key) {
            let text = extract_chat_text(nested);
            if !text.is_empty() {
                return text;
            }
        }
    }

    if let Some(Value::Object(msg)) = payload.get("message") {
        let text = message_content_text(msg.get("content"));
        if !text.is_empty() {
            return text;
        }
    }
    let text = message_content_text(payload.get("content"));
    if !text.is_empty() {
        return text;
    }
    extract_content(payload)
}

/// Agent events wrap their text one level deeper than chat events.
pub(crate) fn extract_agent_text(payload: &Map<String, Value>) -> String {
    for key in ["delta", "text", "content", "message"] {
        if let Some(Value::Object(nested)) = payload.get(key) {
            let text = extract_chat_text(nested);
            if !text.is_empty() {
                return text;
            }
        }
    }
    extract_chat_text(payload)
}

/// `message.content` may be a plain string or an array of typed parts; all
/// `text` parts concatenate in order.
fn message_content_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for item in parts {
                let Value::Object(part) = item else { continue };
                let kind = string_value(part.get("type")).trim().to_lowercase();
                if !kind.is_empty() && kind != "text" {
                    continue;
                }
                let mut text = string_value(part.get("text"));
                if text.is_empty() {
                    text = string_value(part.get("value"));
                }
                out.push_str(&text);
            }
            out
        }
        _ => String::new(),
    }
}

/// Normalize one upstream event into a short sequence of relay events.
pub(crate) fn map_gateway_event(env: &Envelope) -> Vec<Event> {
    let payload = decode_payload(env.payload.as_ref());
    let event_name = env.event.trim().to_lowercase();
    let status = string_value(payload.get("status")).trim().to_lowercase();

    if !status.is_empty() {
        if is_pending_status(&status) {
            let content = extract_content(&payload);
            if content.is_empty() {
                return Vec::new();
            }
            return vec![Event::token(content)];
        }
        if is_final_status(&status) {
            let mut events = Vec::new();
            let content = extract_content(&payload);
            if !content.is_empty() {
                events.push(Event::token(content));
            }
            events.push(Event::end());
            return events;
        }
        if is_error_status(&status) {
            return vec![Event::error(
                ERR_GATEWAY_EVENT_ERROR,
                extract_error_message_from_payload(&payload),
            )];
        }
    }

    if is_chat_event_name(&event_name) {
        let state = string_value(payload.get("state")).trim().to_lowercase();
        let text = extract_chat_text(&payload);
        return match state.as_str() {
            "delta" => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Event::token(text)]
                }
            }
            "final" | "done" | "completed" => {
                let mut events = Vec::new();
                if !text.is_empty() {
                    events.push(Event::token(text));
                }
                events.push(Event::end());
                events
            }
            "error" => vec![Event::error(
                ERR_GATEWAY_EVENT_ERROR,
                extract_error_message_from_payload(&payload),
            )],
            "aborted" | "cancelled" | "canceled" => vec![Event::end()],
            _ => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Event::token(text)]
                }
            }
        };
    }

    if is_agent_event_name(&event_name) {
        let mut events = Vec::new();
        let text = extract_agent_text(&payload);
        if !text.is_empty() {
            events.push(Event::token(text));
        }

        let mut terminal = string_value(payload.get("state")).trim().to_lowercase();
        if terminal.is_empty() {
            terminal = string_value(payload.get("type")).trim().to_lowercase();
        }
        match terminal.as_str() {
            "final" | "done" | "completed" | "end" | "ended" | "finish" | "finished" => {
                events.push(Event::end());
            }
            "error" | "failed" => {
                events.push(Event::error(
                    ERR_GATEWAY_EVENT_ERROR,
                    extract_error_message_from_payload(&payload),
                ));
            }
            _ => {}
        }
        return events;
    }

    if is_token_event_name(&event_name) {
        let content = extract_content(&payload);
        if !content.is_empty() {
            return vec![Event::token(content)];
        }
    } else if is_done_event_name(&event_name) {
        return vec![Event::end()];
    } else if is_error_event_name(&event_name) {
        return vec![Event::error(
            ERR_GATEWAY_EVENT_ERROR,
            extract_error_message_from_payload(&payload),
        )];
    } else if is_disconnect_event_name(&event_name) {
        return vec![Event::error(ERR_GATEWAY_DISCONNECTED, "gateway disconnected")];
    }

    Vec::new()
}

pub(crate) fn is_pending_status(status: &str) -> bool {
    matches!(
        status,
        "accepted" | "queued" | "started" | "running" | "in_flight" | "inflight" | "pending"
    )
}

pub(crate) fn is_final_status(status: &str) -> bool {
    matches!(
        status,
        "ok" | "done" | "completed" | "final" | "ended" | "end" | "aborted" | "cancelled"
            | "canceled"
    )
}

pub(crate) fn is_error_status(status: &str) -> bool {
    matches!(status, "error" | "failed")
}

fn is_token_event_name(name: &str) -> bool {
    name.contains("token") || name.contains("chunk")
}

fn is_done_event_name(name: &str) -> bool {
    name.contains("completed") || name.contains("done") || name.ends_with(".end")
}

pub(crate) fn is_error_event_name(name: &str) -> bool {
    name.contains("error")
}

fn is_disconnect_event_name(name: &str) -> bool {
    name.contains("disconnect")
}

fn is_chat_event_name(name: &str) -> bool {
    name.contains("chat")
}

fn is_agent_event_name(name: &str) -> bool {
    name.contains("agent")
}

/// Converts cumulative full-text snapshots into incremental deltas per run.
///
/// When the upstream re-sends the whole text so far, only the unseen suffix
/// should reach the client. A snapshot that is not an extension of the last
/// one resets tracking and passes through whole.
#[derive(Debug, Default)]
pub(crate) struct DeltaTracker {
    last_text: HashMap<String, String>,
}

impl DeltaTracker {
    /// Returns the text to emit for this snapshot, or `None` when the
    /// snapshot adds nothing new.
    pub(crate) fn delta(&mut self, run_id: &str, text: &str) -> Option<String> {
        let last = self.last_text.get(run_id).map(String::as_str).unwrap_or("");
        if text == last {
            return None;
        }
        let emitted = if let Some(suffix) = text.strip_prefix(last) {
            suffix.to_string()
        } else {
            text.to_string()
        };
        self.last_text.insert(run_id.to_string(), text.to_string());
        Some(emitted)
    }

    pub(crate) fn clear(&mut self, run_id: &str) {
        self.last_text.remove(run_id);
    }
}
