//! Interactive terminal client.
//!
//! Connects to the relay's `/client` endpoint with an access code, then runs
//! a prompt loop: each stdin line becomes a `user_message`, streamed tokens
//! print incrementally, and `end`/`error` close the turn. A `json:` prefix
//! sends a raw JSON event for payloads the plain prompt cannot express
//! (image attachments). Lost connections reconnect into a fresh session.

use std::io::Write as _;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    build_data_frame, decode_control, decode_event, encode_control, encode_event,
    parse_data_frame, ControlMessage, ControlType, Event, EVENT_END, EVENT_ERROR, EVENT_TOKEN,
    EVENT_USER_MESSAGE,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub relay_url: String,
    pub access_code: String,
    pub response_timeout: Duration,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

struct ClientSession {
    sink: SplitSink<WsStream, WsMessage>,
    session_id: String,
    events: mpsc::Receiver<Event>,
    read_errors: mpsc::Receiver<String>,
}

/// Run the interactive prompt loop until stdin closes.
pub async fn run_client(opts: ClientOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = connect_session(&opts.relay_url, &opts.access_code)
        .await
        .map_err(|e| format!("connect failed: {e}"))?;
    println!("connected session={}", session.session_id);
    println!("enter text and press Enter (Ctrl+D to quit)");
    println!("tip: prefix with json: to send a full event payload (images field)");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let event = match parse_input_line(&line) {
            Ok(event) => event,
            Err(msg) => {
                println!("error: {msg}");
                continue;
            }
        };
        let payload = match encode_event(&event) {
            Ok(payload) => payload,
            Err(err) => {
                println!("error: encode event: {err}");
                continue;
            }
        };

        send_frame(&mut session, &opts, &payload).await?;
        match run_turn(&mut session, &opts).await? {
            TurnOutcome::Done => {}
            TurnOutcome::ConnectionLost(err) => {
                println!();
                println!("connection lost, reconnecting... err={err}");
                session = reconnect_session(&opts).await;
                println!("request interrupted, please resend your message");
            }
        }
    }

    // Best-effort close of the session on EOF.
    if let Ok(data) = encode_control(&ControlMessage::close_session(&session.session_id)) {
        if let Ok(text) = String::from_utf8(data) {
            let _ = session.sink.send(WsMessage::Text(text)).await;
        }
    }
    Ok(())
}

/// Send one data frame, reconnecting and retrying once on failure when
/// enabled.
async fn send_frame(
    session: &mut ClientSession,
    opts: &ClientOptions,
    payload: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    let frame = build_data_frame(&session.session_id, 0, payload)?;
    match session.sink.send(WsMessage::Binary(frame)).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if !opts.reconnect {
                return Err(format!("send user_message: {err}").into());
            }
            println!("connection lost, reconnecting... err={err}");
            *session = reconnect_session(opts).await;
            let frame = build_data_frame(&session.session_id, 0, payload)?;
            session
                .sink
                .send(WsMessage::Binary(frame))
                .await
                .map_err(|e| format!("send user_message after reconnect: {e}"))?;
            Ok(())
        }
    }
}

enum TurnOutcome {
    Done,
    ConnectionLost(String),
}

/// Print the response stream for one turn. Returns after a terminal event,
/// a timeout, or a lost connection.
async fn run_turn(
    session: &mut ClientSession,
    opts: &ClientOptions,
) -> Result<TurnOutcome, Box<dyn std::error::Error>> {
    loop {
        tokio::select! {
            read_error = session.read_errors.recv() => {
                let err = read_error.unwrap_or_else(|| "connection closed".to_string());
                if !opts.reconnect {
                    return Err(format!("read: {err}").into());
                }
                return Ok(TurnOutcome::ConnectionLost(err));
            }
            _ = tokio::time::sleep(opts.response_timeout) => {
                println!();
                println!(
                    "error: RESPONSE_TIMEOUT no terminal event within {}s",
                    opts.response_timeout.as_secs()
                );
                return Ok(TurnOutcome::Done);
            }
            event = session.events.recv() => {
                let Some(event) = event else {
                    // Reader task ended; its error arrives on the error
                    // channel next poll.
                    continue;
                };
                match event.kind.as_str() {
                    EVENT_TOKEN => {
                        print!("{}", event.content);
                        let _ = std::io::stdout().flush();
                    }
                    EVENT_END => {
                        println!();
                        return Ok(TurnOutcome::Done);
                    }
                    EVENT_ERROR => {
                        println!();
                        println!("error: {} {}", event.code, event.message);
                        return Ok(TurnOutcome::Done);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// A plain line becomes a `user_message`; a `json:` prefix is parsed as a
/// full event with the type defaulted.
fn parse_input_line(line: &str) -> Result<Event, String> {
    let trimmed = line.trim();
    let Some(raw) = trimmed.strip_prefix("json:") else {
        return Ok(Event::user_message(line));
    };

    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty json payload after json:".to_string());
    }
    let mut event: Event =
        serde_json::from_str(raw).map_err(|e| format!("invalid json event: {e}"))?;
    if event.kind.is_empty() {
        event.kind = EVENT_USER_MESSAGE.to_string();
    }
    Ok(event)
}

async fn connect_session(relay_url: &str, access_code: &str) -> Result<ClientSession, String> {
    let (ws, _response) = connect_async(relay_url)
        .await
        .map_err(|e| format!("connect relay: {e}"))?;
    let (mut sink, mut stream) = ws.split();

    let connect = ControlMessage::connect(access_code, false);
    let data = encode_control(&connect).map_err(|e| format!("encode connect: {e}"))?;
    let text = String::from_utf8(data).map_err(|e| format!("encode connect: {e}"))?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| format!("send connect: {e}"))?;

    let session_id = wait_connect_ok(&mut stream).await?;

    let (event_tx, events) = mpsc::channel(16);
    let (error_tx, read_errors) = mpsc::channel(1);
    tokio::spawn(read_loop(stream, session_id.clone(), event_tx, error_tx));

    Ok(ClientSession {
        sink,
        session_id,
        events,
        read_errors,
    })
}

async fn wait_connect_ok(stream: &mut SplitStream<WsStream>) -> Result<String, String> {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let Ok(msg) = decode_control(text.as_bytes()) else {
                    continue;
                };
                match msg.kind {
                    ControlType::ConnectOk => {
                        if msg.session_id.is_empty() {
                            return Err("missing session_id".to_string());
                        }
                        return Ok(msg.session_id);
                    }
                    ControlType::Error => {
                        return Err(format!("connect error {}: {}", msg.code, msg.message));
                    }
                    _ => continue,
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("connection closed".to_string()),
        }
    }
}

/// Reader task: decode data frames for our session into the event queue.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    session_id: String,
    events: mpsc::Sender<Event>,
    errors: mpsc::Sender<String>,
) {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Binary(frame))) => {
                let Ok((sid, _flags, payload)) = parse_data_frame(&frame) else {
                    continue;
                };
                if sid != session_id {
                    continue;
                }
                let Ok(event) = decode_event(payload) else {
                    continue;
                };
                if events.try_send(event).is_err() {
                    let _ = errors.try_send("event queue overflow".to_string());
                    return;
                }
            }
            Some(Ok(WsMessage::Text(text))) => {
                // CLOSE_SESSION for our session ends the turn stream.
                if let Ok(msg) = decode_control(text.as_bytes()) {
                    if msg.kind == ControlType::CloseSession && msg.session_id == session_id {
                        let _ = errors.try_send("session closed by relay".to_string());
                        return;
                    }
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let _ = errors.try_send(e.to_string());
                return;
            }
            None => {
                let _ = errors.try_send("connection closed".to_string());
                return;
            }
        }
    }
}

/// Retry until the relay accepts us again.
async fn reconnect_session(opts: &ClientOptions) -> ClientSession {
    loop {
        match connect_session(&opts.relay_url, &opts.access_code).await {
            Ok(session) => {
                println!("reconnected session={}", session.session_id);
                return session;
            }
            Err(err) => {
                println!("reconnect attempt failed: {err}");
                tokio::time::sleep(opts.reconnect_delay).await;
            }
        }
    }
}
