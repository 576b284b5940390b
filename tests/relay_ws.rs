//! Integration tests for relay rendezvous and forwarding.
//!
//! Each test spins up a real relay on an ephemeral loopback port, connects
//! real WebSocket peers, and exercises the wire protocol end to end.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use agentbridge::protocol::{
    self, build_data_frame, decode_control, encode_control, Caps, ControlMessage, ControlType,
};
use agentbridge::relay::{run_relay, RelayConfig, RelayHandle};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(300);

async fn start_relay() -> RelayHandle {
    run_relay(RelayConfig::for_testing()).await.unwrap()
}

async fn connect_ws(handle: &RelayHandle, path: &str) -> WsStream {
    let url = format!("ws://{}{}", handle.local_addr(), path);
    let (ws, _response) = connect_async(url).await.expect("websocket connect");
    ws
}

async fn send_control(ws: &mut WsStream, msg: &ControlMessage) {
    let data = encode_control(msg).unwrap();
    ws.send(WsMessage::Text(String::from_utf8(data).unwrap()))
        .await
        .expect("send control");
}

/// Next text frame, decoded as a control message.
async fn recv_control(ws: &mut WsStream) -> ControlMessage {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for control")
            .expect("stream ended waiting for control")
            .expect("read error waiting for control");
        if let WsMessage::Text(text) = msg {
            return decode_control(text.as_bytes()).expect("decode control");
        }
    }
}

/// Next binary frame, raw bytes.
async fn recv_binary(ws: &mut WsStream) -> Vec<u8> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for binary frame")
            .expect("stream ended waiting for binary frame")
            .expect("read error waiting for binary frame");
        if let WsMessage::Binary(frame) = msg {
            return frame;
        }
    }
}

/// Assert that nothing arrives on the stream for a short window.
async fn assert_silent(ws: &mut WsStream) {
    let outcome = tokio::time::timeout(SILENCE_WINDOW, ws.next()).await;
    assert!(
        outcome.is_err(),
        "expected silence, got {:?}",
        outcome.unwrap()
    );
}

async fn register_connector(handle: &RelayHandle, access_code: &str) -> WsStream {
    let mut ws = connect_ws(handle, "/tunnel").await;
    send_control(
        &mut ws,
        &ControlMessage::register(protocol::hash_access_code(access_code), 1, Caps::default()),
    )
    .await;
    ws
}

/// Connect a client for the given code, retrying while the connector's
/// registration is still in flight on the server side.
async fn connect_client(handle: &RelayHandle, access_code: &str) -> (WsStream, String) {
    for _ in 0..50 {
        let mut ws = connect_ws(handle, "/client").await;
        send_control(&mut ws, &ControlMessage::connect(access_code, false)).await;
        let msg = recv_control(&mut ws).await;
        match msg.kind {
            ControlType::ConnectOk => {
                assert!(!msg.session_id.is_empty());
                return (ws, msg.session_id);
            }
            ControlType::Error if msg.code == "CONNECTOR_NOT_FOUND" => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => panic!("unexpected rendezvous reply: {other:?}"),
        }
    }
    panic!("connector never became available");
}

// ---------------------------------------------------------------------------
// Health endpoint
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_healthz_responds_ok() {
    let handle = start_relay().await;
    let url = format!("http://{}/healthz", handle.local_addr());

    let resp = reqwest::get(&url).await.expect("GET /healthz failed");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Happy-path pairing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pairing_happy_path() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;

    let (_client, session_id) = connect_client(&handle, "hunter2").await;
    assert!(session_id.starts_with("s_"));
    assert_eq!(session_id.len(), 18);
    assert!(session_id[2..].chars().all(|c| c.is_ascii_hexdigit()));

    let open = recv_control(&mut connector).await;
    assert_eq!(open.kind, ControlType::SessionOpen);
    assert_eq!(open.session_id, session_id);
    assert!(!open.e2ee);

    // Both peers are indexed against the stored session.
    let sessions = handle.state().sessions().all();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.id, session_id);
    assert!(session.client.id().starts_with("u_"));
    assert!(session.connector.id().starts_with("c_"));
    assert_eq!(
        handle.state().sessions().sessions_for_peer(session.client.id()),
        vec![session_id.clone()]
    );
    assert_eq!(
        handle
            .state()
            .sessions()
            .sessions_for_peer(session.connector.id()),
        vec![session_id.clone()]
    );

    drop(_client);
    drop(connector);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_ok_carries_connector_caps() {
    let handle = start_relay().await;
    let mut ws = connect_ws(&handle, "/tunnel").await;
    send_control(
        &mut ws,
        &ControlMessage::register(
            protocol::hash_access_code("secret"),
            1,
            Caps { e2ee: true },
        ),
    )
    .await;

    for _ in 0..50 {
        let mut client = connect_ws(&handle, "/client").await;
        send_control(&mut client, &ControlMessage::connect("secret", false)).await;
        let msg = recv_control(&mut client).await;
        if msg.kind == ControlType::ConnectOk {
            assert_eq!(msg.caps, Some(Caps { e2ee: true }));
            drop(client);
            drop(ws);
            handle.shutdown().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connector never became available");
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwarding_is_byte_identical_both_ways() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;
    let (mut client, session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut connector).await;

    let payload = br#"{"type":"user_message","content":"hi"}"#;
    let frame = build_data_frame(&session_id, 0, payload).unwrap();
    client
        .send(WsMessage::Binary(frame.clone()))
        .await
        .unwrap();

    let received = recv_binary(&mut connector).await;
    assert_eq!(received, frame);

    let reply_payload = br#"{"type":"token","content":"hello"}"#;
    let reply = build_data_frame(&session_id, 1, reply_payload).unwrap();
    connector
        .send(WsMessage::Binary(reply.clone()))
        .await
        .unwrap();

    let received = recv_binary(&mut client).await;
    assert_eq!(received, reply);

    let snapshot = handle.state().metrics().snapshot();
    assert_eq!(
        snapshot.forwarded_bytes,
        (frame.len() + reply.len()) as u64
    );
    assert_eq!(snapshot.errors, 0);

    drop(client);
    drop(connector);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_ordering_preserved() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;
    let (mut client, session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut connector).await;

    for i in 0..20u8 {
        let frame = build_data_frame(&session_id, 0, &[i]).unwrap();
        client.send(WsMessage::Binary(frame)).await.unwrap();
    }
    for i in 0..20u8 {
        let frame = recv_binary(&mut connector).await;
        assert_eq!(*frame.last().unwrap(), i);
    }

    drop(client);
    drop(connector);
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Rendezvous errors
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_connector_rejected() {
    let handle = start_relay().await;

    let mut client = connect_ws(&handle, "/client").await;
    send_control(&mut client, &ControlMessage::connect("no-such-code", false)).await;

    let msg = recv_control(&mut client).await;
    assert_eq!(msg.kind, ControlType::Error);
    assert_eq!(msg.code, "CONNECTOR_NOT_FOUND");

    // The relay closes the transport after the error.
    let end = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "transport should close after the error");

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Steady-state errors
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frame_yields_bad_data_frame() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;
    let (mut client, _session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut connector).await;

    client.send(WsMessage::Binary(vec![0x01])).await.unwrap();
    let msg = recv_control(&mut client).await;
    assert_eq!(msg.kind, ControlType::Error);
    assert_eq!(msg.code, "BAD_DATA_FRAME");

    // Zero sid_len is also malformed.
    client
        .send(WsMessage::Binary(vec![0x00, b'x', 0x00]))
        .await
        .unwrap();
    let msg = recv_control(&mut client).await;
    assert_eq!(msg.code, "BAD_DATA_FRAME");

    drop(client);
    drop(connector);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_session_yields_session_not_found() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;
    let (mut client, _session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut connector).await;

    let frame = build_data_frame("s_doesnotexist", 0, b"payload").unwrap();
    client.send(WsMessage::Binary(frame)).await.unwrap();

    let msg = recv_control(&mut client).await;
    assert_eq!(msg.kind, ControlType::Error);
    assert_eq!(msg.code, "SESSION_NOT_FOUND");

    drop(client);
    drop(connector);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_member_yields_peer_mismatch() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;

    let (_client_a, session_a) = connect_client(&handle, "hunter2").await;
    let _open_a = recv_control(&mut connector).await;
    let (mut client_b, _session_b) = connect_client(&handle, "hunter2").await;
    let _open_b = recv_control(&mut connector).await;

    // Client B is not a member of A's session.
    let frame = build_data_frame(&session_a, 0, b"sneaky").unwrap();
    client_b.send(WsMessage::Binary(frame)).await.unwrap();

    let msg = recv_control(&mut client_b).await;
    assert_eq!(msg.kind, ControlType::Error);
    assert_eq!(msg.code, "SESSION_PEER_MISMATCH");

    // The frame was dropped, not forwarded.
    assert_silent(&mut connector).await;

    drop(_client_a);
    drop(client_b);
    drop(connector);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_discarded_and_other_controls_rejected() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;
    let (mut client, _session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut connector).await;

    send_control(&mut client, &ControlMessage::heartbeat()).await;
    assert_silent(&mut client).await;

    // A rendezvous message in steady state is unsupported.
    send_control(&mut client, &ControlMessage::connect("hunter2", false)).await;
    let msg = recv_control(&mut client).await;
    assert_eq!(msg.kind, ControlType::Error);
    assert_eq!(msg.code, "UNSUPPORTED_CONTROL");

    // Garbage text is a bad control message.
    client
        .send(WsMessage::Text("{not json".to_string()))
        .await
        .unwrap();
    let msg = recv_control(&mut client).await;
    assert_eq!(msg.code, "BAD_CONTROL");

    drop(client);
    drop(connector);
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Session close paths
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_session_notifies_both_sides() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;
    let (mut client, session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut connector).await;

    send_control(&mut client, &ControlMessage::close_session(&session_id)).await;

    let client_msg = recv_control(&mut client).await;
    assert_eq!(client_msg.kind, ControlType::CloseSession);
    assert_eq!(client_msg.session_id, session_id);

    let connector_msg = recv_control(&mut connector).await;
    assert_eq!(connector_msg.kind, ControlType::CloseSession);
    assert_eq!(connector_msg.session_id, session_id);

    // Frames for the closed session no longer route.
    let frame = build_data_frame(&session_id, 0, b"late").unwrap();
    client.send(WsMessage::Binary(frame)).await.unwrap();
    let msg = recv_control(&mut client).await;
    assert_eq!(msg.code, "SESSION_NOT_FOUND");

    drop(client);
    drop(connector);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_disconnect_closes_session_on_connector() {
    let handle = start_relay().await;
    let mut connector = register_connector(&handle, "hunter2").await;
    let (client, session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut connector).await;

    drop(client);

    let msg = recv_control(&mut connector).await;
    assert_eq!(msg.kind, ControlType::CloseSession);
    assert_eq!(msg.session_id, session_id);

    // The store no longer knows the session.
    assert!(handle.state().sessions().get(&session_id).is_none());

    drop(connector);
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Preemption
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_register_preempts_previous_connector() {
    let handle = start_relay().await;
    let mut first = register_connector(&handle, "hunter2").await;
    let (mut client, session_id) = connect_client(&handle, "hunter2").await;
    let _open = recv_control(&mut first).await;

    let _second = register_connector(&handle, "hunter2").await;

    // The first connector's client learns its session died.
    let msg = recv_control(&mut client).await;
    assert_eq!(msg.kind, ControlType::CloseSession);
    assert_eq!(msg.session_id, session_id);

    // The first connector's transport is closed by the relay.
    let end = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match first.next().await {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "preempted connector should be closed");

    // Its sessions are gone from the store.
    assert!(handle.state().sessions().get(&session_id).is_none());

    drop(client);
    drop(_second);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_connector_serves_after_preemption() {
    let handle = start_relay().await;
    let _first = register_connector(&handle, "hunter2").await;
    // Let the first registration land before the second preempts it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = register_connector(&handle, "hunter2").await;

    let (mut client, session_id) = connect_client(&handle, "hunter2").await;
    let open = recv_control(&mut second).await;
    assert_eq!(open.kind, ControlType::SessionOpen);
    assert_eq!(open.session_id, session_id);

    let frame = build_data_frame(&session_id, 0, b"after preempt").unwrap();
    client.send(WsMessage::Binary(frame.clone())).await.unwrap();
    assert_eq!(recv_binary(&mut second).await, frame);

    drop(client);
    drop(second);
    handle.shutdown().await;
}
