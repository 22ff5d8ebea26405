//! WebSocket transport task.
//!
//! Owns the connection end to end: dial, frame the byte stream, keep the
//! link alive, and reconnect with backoff when it drops. Decoded frames and
//! connection state changes flow to the engine over one channel; the engine
//! never touches the socket.
//!
//! Deadlines: 60 s reads, 10 s writes, a protocol ping after 54 s of writer
//! inactivity. Cancellation is cooperative: flipping the shutdown signal
//! makes every blocked await return `Cancelled`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, timeout, Instant},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use sc_proto::{Frame, FrameType};

use crate::{
    backoff::{self, MAX_RECONNECT},
    error::TransportError,
};

const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(54);
const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// What the transport reports to the engine.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Frame(Frame),
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    PermanentlyDisconnected,
}

pub struct TransportHandle {
    pub outbound: mpsc::Sender<Frame>,
    pub task: JoinHandle<Result<(), TransportError>>,
    shutdown: watch::Sender<bool>,
}

impl TransportHandle {
    /// Cooperative shutdown; pending reads/writes return `Cancelled`.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Accept `ws://`, `wss://`, and their http(s) spellings; default the path
/// to `/ws` when none was given.
pub fn normalize_url(input: &str) -> Result<Url, TransportError> {
    let with_scheme = if input.contains("://") {
        input.to_string()
    } else {
        format!("ws://{input}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| TransportError::UrlInvalid(format!("{input}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| TransportError::UrlInvalid(input.to_string()))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| TransportError::UrlInvalid(input.to_string()))?,
        other => {
            return Err(TransportError::UrlInvalid(format!(
                "unsupported scheme `{other}` in {input}"
            )))
        }
    }
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/ws");
    }
    Ok(url)
}

/// Spawn the transport task. Frames written to the returned sender go out on
/// the wire; events arrive on `events_tx`.
pub fn spawn(
    url: &str,
    connect_timeout: Duration,
    events_tx: mpsc::Sender<TransportEvent>,
) -> Result<TransportHandle, TransportError> {
    let url = normalize_url(url)?;
    let (outbound_tx, outbound_rx) = mpsc::channel(128);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run(url, connect_timeout, outbound_rx, events_tx, shutdown_rx));

    Ok(TransportHandle {
        outbound: outbound_tx,
        task,
        shutdown: shutdown_tx,
    })
}

async fn run(
    url: Url,
    connect_timeout: Duration,
    mut outbound_rx: mpsc::Receiver<Frame>,
    events_tx: mpsc::Sender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let mut attempt: u32 = 0;
    loop {
        let dial = timeout(connect_timeout, connect_async(url.as_str()));
        let dialed = tokio::select! {
            _ = shutdown_rx.changed() => return Err(TransportError::Cancelled),
            result = dial => result,
        };

        match dialed {
            Ok(Ok((stream, _response))) => {
                attempt = 0;
                if events_tx.send(TransportEvent::Connected).await.is_err() {
                    return Err(TransportError::Cancelled);
                }
                match drive(stream, &mut outbound_rx, &events_tx, &mut shutdown_rx).await {
                    Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                    Err(e) => {
                        let _ = events_tx
                            .send(TransportEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                    }
                    Ok(()) => {
                        let _ = events_tx
                            .send(TransportEvent::Disconnected {
                                reason: "connection closed by peer".into(),
                            })
                            .await;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "websocket dial failed");
                let _ = events_tx
                    .send(TransportEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                let _ = events_tx
                    .send(TransportEvent::Disconnected {
                        reason: TransportError::Timeout.to_string(),
                    })
                    .await;
            }
        }

        attempt += 1;
        if attempt > MAX_RECONNECT {
            let _ = events_tx.send(TransportEvent::PermanentlyDisconnected).await;
            return Err(TransportError::PermanentlyDisconnected {
                attempts: attempt - 1,
            });
        }
        if events_tx
            .send(TransportEvent::Reconnecting { attempt })
            .await
            .is_err()
        {
            return Err(TransportError::Cancelled);
        }

        let wait = backoff::delay(RECONNECT_BASE, attempt - 1);
        tokio::select! {
            _ = shutdown_rx.changed() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Pump one live connection until it fails, closes, or is cancelled.
async fn drive(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    events_tx: &mpsc::Sender<TransportEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let (mut sink, mut source) = stream.split();
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    // Tracked explicitly: a select arm completing must not reset it, only
    // an actual inbound message may.
    let mut read_deadline = Instant::now() + READ_DEADLINE;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Err(TransportError::Cancelled);
            }

            frame = outbound_rx.recv() => {
                let frame = frame.ok_or(TransportError::Cancelled)?;
                write_frame(&mut sink, frame).await?;
                ping.reset();
            }

            _ = ping.tick() => {
                write_frame(&mut sink, Frame::control(FrameType::Ping)).await?;
            }

            _ = tokio::time::sleep_until(read_deadline) => {
                return Err(TransportError::Timeout);
            }

            inbound = source.next() => {
                let message = match inbound {
                    None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(TransportError::Disconnected(e.to_string()))
                    }
                    Some(Ok(message)) => message,
                };
                read_deadline = Instant::now() + READ_DEADLINE;
                match message {
                    Message::Binary(data) => match Frame::decode(&data) {
                        Ok(frame) if frame.frame_type == FrameType::Ping => {
                            write_frame(&mut sink, Frame::control(FrameType::Pong)).await?;
                        }
                        Ok(frame) if frame.frame_type == FrameType::Pong => {
                            // Read activity alone satisfies liveness.
                        }
                        Ok(frame) => {
                            if events_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                return Err(TransportError::Cancelled);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable frame");
                        }
                    },
                    Message::Ping(payload) => {
                        let reply = timeout(WRITE_DEADLINE, sink.send(Message::Pong(payload)));
                        reply.await.map_err(|_| TransportError::Timeout)?
                            .map_err(|e| TransportError::Disconnected(e.to_string()))?;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

async fn write_frame<S>(sink: &mut S, frame: Frame) -> Result<(), TransportError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let write = timeout(WRITE_DEADLINE, sink.send(Message::Binary(frame.encode())));
    write
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Disconnected(e.to_string()))
}
