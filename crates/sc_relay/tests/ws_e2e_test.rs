//! End-to-end over real sockets: websocket hello handshake, routing between
//! two clients, HTTP surface, protocol violations.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use sc_crypto::identity::IdentityKeyPair;
use sc_proto::{
    payloads::{ClientHello, ErrorCode, ErrorPayload, ServerHello},
    Frame, FrameType,
};
use sc_relay::{broker::Broker, http, BrokerConfig};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Broker::start(BrokerConfig::default());
    tokio::spawn(http::serve(listener, broker));
    addr
}

async fn ws_connect(addr: std::net::SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn recv_frame(ws: &mut Ws) -> Frame {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Binary(data) => {
                let frame = Frame::decode(&data).expect("valid frame");
                // The broker pings on its own schedule; skip those.
                if frame.frame_type == FrameType::Ping {
                    continue;
                }
                return frame;
            }
            Message::Ping(p) => {
                let _ = ws.send(Message::Pong(p)).await;
            }
            _ => {}
        }
    }
}

async fn send_frame(ws: &mut Ws, frame: Frame) {
    ws.send(Message::Binary(frame.encode())).await.unwrap();
}

/// Complete the challenge-response hello for `user_id`.
async fn authenticate(ws: &mut Ws, identity: &IdentityKeyPair, user_id: &str) -> String {
    let hello = ClientHello {
        user_id: user_id.to_string(),
        identity: identity.public().clone(),
        challenge_sig: None,
    };
    send_frame(
        ws,
        Frame::new(FrameType::ClientHello, serde_json::to_vec(&hello).unwrap()),
    )
    .await;

    let reply = recv_frame(ws).await;
    assert_eq!(reply.frame_type, FrameType::ServerHello);
    let server_hello: ServerHello = serde_json::from_slice(&reply.payload).unwrap();
    let challenge = URL_SAFE_NO_PAD.decode(&server_hello.challenge).unwrap();

    let signed = ClientHello {
        user_id: user_id.to_string(),
        identity: identity.public().clone(),
        challenge_sig: Some(URL_SAFE_NO_PAD.encode(identity.sign(&challenge))),
    };
    send_frame(
        ws,
        Frame::new(FrameType::ClientHello, serde_json::to_vec(&signed).unwrap()),
    )
    .await;
    server_hello.session_id
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_for_authenticated(addr: std::net::SocketAddr, count: u32) {
    for _ in 0..50 {
        let stats = http_get(addr, "/stats").await;
        if stats.contains(&format!("\"authenticated_users\":{count}")) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("never reached {count} authenticated users");
}

fn chat_frame(id: &str, from: &str, to: &str) -> Frame {
    let payload = serde_json::json!({
        "id": id,
        "from": from,
        "to": to,
        "ciphertext": "b3BhcXVl",
    });
    Frame::new(FrameType::Chat, serde_json::to_vec(&payload).unwrap())
}

#[tokio::test]
async fn hello_handshake_authenticates_and_shows_in_stats() {
    let addr = start_relay().await;
    let identity = IdentityKeyPair::generate().unwrap();

    let mut ws = ws_connect(addr).await;
    let session_id = authenticate(&mut ws, &identity, "alice").await;
    assert!(!session_id.is_empty());

    wait_for_authenticated(addr, 1).await;
}

#[tokio::test]
async fn routes_chat_between_two_websocket_clients() {
    let addr = start_relay().await;
    let alice_id = IdentityKeyPair::generate().unwrap();
    let bob_id = IdentityKeyPair::generate().unwrap();

    let mut alice = ws_connect(addr).await;
    authenticate(&mut alice, &alice_id, "alice").await;
    let mut bob = ws_connect(addr).await;
    authenticate(&mut bob, &bob_id, "bob").await;
    wait_for_authenticated(addr, 2).await;

    send_frame(&mut alice, chat_frame("env-1", "alice", "bob")).await;

    let ack = recv_frame(&mut alice).await;
    assert_eq!(ack.frame_type, FrameType::Ack);

    let delivered = recv_frame(&mut bob).await;
    assert_eq!(delivered.frame_type, FrameType::Chat);
}

#[tokio::test]
async fn chat_to_offline_user_errors_fast() {
    let addr = start_relay().await;
    let identity = IdentityKeyPair::generate().unwrap();

    let mut ws = ws_connect(addr).await;
    authenticate(&mut ws, &identity, "alice").await;
    wait_for_authenticated(addr, 1).await;

    send_frame(&mut ws, chat_frame("env-9", "alice", "carol")).await;

    let frame = recv_frame(&mut ws).await;
    let error: ErrorPayload = serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(error.code, ErrorCode::UserOffline);
    assert_eq!(error.ref_id.as_deref(), Some("env-9"));
}

#[tokio::test]
async fn unauthenticated_chat_is_rejected() {
    let addr = start_relay().await;
    let mut ws = ws_connect(addr).await;

    send_frame(&mut ws, chat_frame("env-1", "alice", "bob")).await;

    let frame = recv_frame(&mut ws).await;
    let error: ErrorPayload = serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(error.code, ErrorCode::NotAuthenticated);
}

#[tokio::test]
async fn wrong_challenge_signature_is_rejected() {
    let addr = start_relay().await;
    let identity = IdentityKeyPair::generate().unwrap();
    let wrong = IdentityKeyPair::generate().unwrap();

    let mut ws = ws_connect(addr).await;
    let hello = ClientHello {
        user_id: "alice".into(),
        identity: identity.public().clone(),
        challenge_sig: None,
    };
    send_frame(
        &mut ws,
        Frame::new(FrameType::ClientHello, serde_json::to_vec(&hello).unwrap()),
    )
    .await;
    let reply = recv_frame(&mut ws).await;
    let server_hello: ServerHello = serde_json::from_slice(&reply.payload).unwrap();
    let challenge = URL_SAFE_NO_PAD.decode(&server_hello.challenge).unwrap();

    // Signed by a key that does not match the advertised identity.
    let signed = ClientHello {
        user_id: "alice".into(),
        identity: identity.public().clone(),
        challenge_sig: Some(URL_SAFE_NO_PAD.encode(wrong.sign(&challenge))),
    };
    send_frame(
        &mut ws,
        Frame::new(FrameType::ClientHello, serde_json::to_vec(&signed).unwrap()),
    )
    .await;

    let frame = recv_frame(&mut ws).await;
    let error: ErrorPayload = serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(error.code, ErrorCode::NotAuthenticated);
}

#[tokio::test]
async fn unknown_frame_type_gets_error_then_close() {
    let addr = start_relay().await;
    let mut ws = ws_connect(addr).await;

    // Hand-build a header with frame type 99.
    let mut bytes = Frame::control(FrameType::Ping).encode();
    bytes[10] = 0x00;
    bytes[11] = 99;
    ws.send(Message::Binary(bytes)).await.unwrap();

    let frame = recv_frame(&mut ws).await;
    let error: ErrorPayload = serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(error.code, ErrorCode::UnknownType);

    // The connection closes after the error.
    let next = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let addr = start_relay().await;
    let response = http_get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("\"status\":\"healthy\""));
    assert!(response.contains("uptime"));
}

#[tokio::test]
async fn supersession_closes_the_older_connection() {
    let addr = start_relay().await;
    let identity = IdentityKeyPair::generate().unwrap();

    let mut first = ws_connect(addr).await;
    authenticate(&mut first, &identity, "alice").await;
    wait_for_authenticated(addr, 1).await;

    let mut second = ws_connect(addr).await;
    authenticate(&mut second, &identity, "alice").await;

    // The first connection receives the superseded error, then closes.
    let start = std::time::Instant::now();
    let frame = recv_frame(&mut first).await;
    let error: ErrorPayload = serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(error.code, ErrorCode::Superseded);
    assert!(start.elapsed() < Duration::from_millis(500));

    let next = timeout(Duration::from_secs(5), first.next()).await.unwrap();
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        other => panic!("expected close, got {other:?}"),
    }
}
