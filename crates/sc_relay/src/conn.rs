//! Per-connection actor: owns one websocket, enforces the hello handshake,
//! liveness, and frame dispatch.
//!
//! Lifecycle: CONNECTED on register; a `client_hello` draws a 32-byte
//! challenge in `server_hello`; the record becomes AUTHENTICATED only after
//! a second `client_hello` returns a valid identity signature over the
//! challenge. Routed frames from unauthenticated clients bounce with
//! `not_authenticated`.
//!
//! Liveness: a protocol ping after 54 s of writer inactivity; the
//! connection closes after 60 s without any inbound frame. Writes carry a
//! 10 s deadline.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    time::{interval_at, timeout, Instant},
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use sc_crypto::primitives;
use sc_proto::{
    payloads::{ClientHello, ErrorCode, ServerHello},
    Frame, FrameType, ProtoError, RoutingInfo,
};

use crate::broker::{error_frame, Broker, ClientPorts};

const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(54);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

enum Stage {
    Connected { challenge: Option<[u8; 32]> },
    Authenticated { user_id: String },
}

/// What a frame handler wants done after its replies are written.
struct Outcome {
    replies: Vec<Frame>,
    close: Option<String>,
}

impl Outcome {
    fn reply(frame: Frame) -> Self {
        Self {
            replies: vec![frame],
            close: None,
        }
    }

    fn nothing() -> Self {
        Self {
            replies: Vec::new(),
            close: None,
        }
    }

    fn fatal(frame: Frame, reason: &str) -> Self {
        Self {
            replies: vec![frame],
            close: Some(reason.to_string()),
        }
    }
}

pub async fn serve_connection(broker: Arc<Broker>, stream: WebSocketStream<TcpStream>) {
    let ports = broker.register();
    let client_id = ports.client_id.clone();
    if let Err(reason) = drive(&broker, stream, ports).await {
        debug!(client_id, reason, "connection ended");
    }
    broker.unregister(&client_id);
}

async fn drive(
    broker: &Arc<Broker>,
    stream: WebSocketStream<TcpStream>,
    mut ports: ClientPorts,
) -> Result<(), String> {
    let (mut sink, mut source) = stream.split();
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut stage = Stage::Connected { challenge: None };
    // Tracked explicitly: only an actual inbound message may push it out.
    let mut read_deadline = Instant::now() + READ_DEADLINE;

    loop {
        tokio::select! {
            changed = ports.close_rx.changed() => {
                if changed.is_err() {
                    return Err("broker dropped the record".into());
                }
                let close = ports.close_rx.borrow_and_update().clone();
                if let Some(close) = close {
                    if let Some(error) = close.error {
                        let frame = Frame::new(
                            FrameType::Error,
                            serde_json::to_vec(&error).expect("error payload serializes"),
                        );
                        let _ = write_frame(&mut sink, frame).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return Err(close.reason);
                }
            }

            frame = ports.outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return Err("outbound queue dropped".into());
                };
                write_frame(&mut sink, frame).await?;
                ping.reset();
            }

            _ = ping.tick() => {
                write_frame(&mut sink, Frame::control(FrameType::Ping)).await?;
            }

            _ = tokio::time::sleep_until(read_deadline) => {
                let _ = sink.send(Message::Close(None)).await;
                return Err("liveness timeout".into());
            }

            inbound = source.next() => {
                let message = match inbound {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.to_string()),
                    Some(Ok(message)) => message,
                };
                read_deadline = Instant::now() + READ_DEADLINE;

                match message {
                    Message::Binary(data) => {
                        broker.touch(&ports.client_id);
                        let outcome = match Frame::decode(&data) {
                            Ok(frame) => handle_frame(broker, &ports.client_id, &mut stage, frame),
                            Err(e) => protocol_violation(e),
                        };
                        for frame in outcome.replies {
                            write_frame(&mut sink, frame).await?;
                        }
                        if let Some(reason) = outcome.close {
                            let _ = sink.send(Message::Close(None)).await;
                            return Err(reason);
                        }
                    }
                    Message::Ping(payload) => {
                        broker.touch(&ports.client_id);
                        let reply = timeout(WRITE_DEADLINE, sink.send(Message::Pong(payload)));
                        reply.await.map_err(|_| "write deadline".to_string())?
                            .map_err(|e| e.to_string())?;
                    }
                    Message::Pong(_) => broker.touch(&ports.client_id),
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Unknown frame types and framing violations are answered with an error
/// frame, then the connection closes.
fn protocol_violation(error: ProtoError) -> Outcome {
    let (code, reason) = match &error {
        ProtoError::UnknownType(t) => (ErrorCode::UnknownType, format!("unknown frame type {t}")),
        ProtoError::VersionUnsupported(v) => (
            ErrorCode::VersionUnsupported,
            format!("unsupported version {v:#06x}"),
        ),
        other => (ErrorCode::FrameInvalid, other.to_string()),
    };
    Outcome::fatal(error_frame(code, None, &reason), &reason)
}

fn handle_frame(
    broker: &Arc<Broker>,
    client_id: &str,
    stage: &mut Stage,
    frame: Frame,
) -> Outcome {
    match frame.frame_type {
        FrameType::ClientHello => handle_hello(broker, client_id, stage, &frame),
        FrameType::Chat | FrameType::KeyExchange => route(broker, stage, frame),
        FrameType::Presence => {
            // Last-seen was already refreshed; presence is not routed.
            Outcome::nothing()
        }
        FrameType::Ping => Outcome::reply(Frame::control(FrameType::Pong)),
        FrameType::Pong | FrameType::Ack => Outcome::nothing(),
        FrameType::ServerHello | FrameType::Error => {
            debug!(frame_type = ?frame.frame_type, "ignoring server-only frame from client");
            Outcome::nothing()
        }
    }
}

fn handle_hello(
    broker: &Arc<Broker>,
    client_id: &str,
    stage: &mut Stage,
    frame: &Frame,
) -> Outcome {
    let hello: ClientHello = match serde_json::from_slice(&frame.payload) {
        Ok(hello) => hello,
        Err(e) => {
            return Outcome::fatal(
                error_frame(ErrorCode::FrameInvalid, None, &e.to_string()),
                "malformed hello",
            )
        }
    };

    let Stage::Connected { challenge } = stage else {
        // Already authenticated; a repeated hello is harmless.
        return Outcome::nothing();
    };

    match hello.challenge_sig.as_deref() {
        // Opening hello: issue the challenge.
        None => {
            let fresh = match primitives::rand_array32() {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Outcome::fatal(
                        error_frame(ErrorCode::Internal, None, &e.to_string()),
                        "rng failure",
                    )
                }
            };
            *challenge = Some(fresh);
            let reply = ServerHello {
                session_id: client_id.to_string(),
                challenge: URL_SAFE_NO_PAD.encode(fresh),
            };
            let payload = serde_json::to_vec(&reply).expect("server hello serializes");
            Outcome::reply(Frame::new(FrameType::ServerHello, payload))
        }
        // Signed hello: verify proof of possession of the identity key.
        Some(sig_b64) => {
            let Some(expected) = *challenge else {
                return Outcome::fatal(
                    error_frame(
                        ErrorCode::NotAuthenticated,
                        None,
                        "signature before challenge",
                    ),
                    "signature before challenge",
                );
            };
            let verified = URL_SAFE_NO_PAD
                .decode(sig_b64)
                .ok()
                .map(|sig| hello.identity.verify(&expected, &sig).is_ok())
                .unwrap_or(false);
            if !verified {
                warn!(client_id, user_id = %hello.user_id, "challenge signature invalid");
                return Outcome::fatal(
                    error_frame(
                        ErrorCode::NotAuthenticated,
                        None,
                        "challenge signature invalid",
                    ),
                    "challenge signature invalid",
                );
            }
            if let Err(e) = broker.authenticate(client_id, &hello.user_id) {
                return Outcome::fatal(
                    error_frame(e.code(), None, &e.to_string()),
                    "authentication failed",
                );
            }
            info!(client_id, user_id = %hello.user_id, "hello handshake complete");
            *stage = Stage::Authenticated {
                user_id: hello.user_id,
            };
            Outcome::nothing()
        }
    }
}

fn route(broker: &Arc<Broker>, stage: &Stage, frame: Frame) -> Outcome {
    let Stage::Authenticated { user_id } = stage else {
        return Outcome::reply(error_frame(
            ErrorCode::NotAuthenticated,
            None,
            "hello handshake has not completed",
        ));
    };

    let info = match RoutingInfo::from_payload(&frame.payload) {
        Ok(info) => info,
        Err(e) => {
            return Outcome::reply(error_frame(
                ErrorCode::FrameInvalid,
                None,
                &format!("unroutable payload: {e}"),
            ))
        }
    };
    if info.from != *user_id {
        return Outcome::reply(error_frame(
            ErrorCode::FrameInvalid,
            Some(info.id),
            "sender field does not match authenticated user",
        ));
    }

    match broker.submit(user_id, &info.id, &info.to, frame) {
        Ok(()) => Outcome::nothing(),
        Err(e) => Outcome::reply(error_frame(e.code(), Some(info.id), &e.to_string())),
    }
}

async fn write_frame(sink: &mut WsSink, frame: Frame) -> Result<(), String> {
    let write = timeout(WRITE_DEADLINE, sink.send(Message::Binary(frame.encode())));
    write
        .await
        .map_err(|_| "write deadline".to_string())?
        .map_err(|e| e.to_string())
}
