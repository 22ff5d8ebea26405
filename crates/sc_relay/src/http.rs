//! Listener front end: one TCP port serving the websocket upgrade on `/ws`
//! plus two plain HTTP JSON endpoints, `/health` and `/stats`.
//!
//! The request path is peeked without consuming the stream so the websocket
//! handshake still sees the full request; only the two JSON endpoints read
//! the request off the socket themselves.

use std::{io, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_tungstenite::accept_async;
use tracing::{debug, info};

use crate::{broker::Broker, conn};

const PEEK_LIMIT: usize = 2048;
const HTTP_DEADLINE: Duration = Duration::from_secs(10);

/// Accept loop. Runs until the listener fails or the task is dropped.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "relay listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socket(broker, stream).await {
                debug!(%peer, error = %e, "socket handling ended");
            }
        });
    }
}

async fn handle_socket(broker: Arc<Broker>, stream: TcpStream) -> io::Result<()> {
    let path = timeout(HTTP_DEADLINE, peek_request_path(&stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request header deadline"))??;

    match path.as_str() {
        "/ws" => {
            match accept_async(stream).await {
                Ok(ws) => conn::serve_connection(broker, ws).await,
                Err(e) => debug!(error = %e, "websocket handshake failed"),
            }
            Ok(())
        }
        "/health" => {
            let body = serde_json::json!({
                "status": "healthy",
                "timestamp": Utc::now().timestamp(),
                "uptime": broker.uptime_seconds(),
            });
            respond_json(stream, "200 OK", &body.to_string()).await
        }
        "/stats" => {
            let body = serde_json::to_string(&broker.snapshot())
                .expect("stats snapshot serializes");
            respond_json(stream, "200 OK", &body).await
        }
        other => {
            debug!(path = other, "unknown path");
            respond_json(stream, "404 Not Found", "{\"error\":\"not found\"}").await
        }
    }
}

/// Read the request line without consuming it from the socket.
async fn peek_request_path(stream: &TcpStream) -> io::Result<String> {
    let mut buf = [0u8; PEEK_LIMIT];
    loop {
        let n = stream.peek(&mut buf).await?;
        if let Some(line_end) = buf[..n].windows(2).position(|w| w == b"\r\n") {
            let line = std::str::from_utf8(&buf[..line_end])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 request line"))?;
            // "GET /path HTTP/1.1"
            let mut parts = line.split(' ');
            let _method = parts.next();
            let target = parts
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad request line"))?;
            let path = target.split('?').next().unwrap_or(target);
            return Ok(path.to_string());
        }
        if n == PEEK_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request line too long",
            ));
        }
        // Partial request line; wait for more bytes.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drain the request, write one JSON response, close.
async fn respond_json(mut stream: TcpStream, status: &str, body: &str) -> io::Result<()> {
    timeout(HTTP_DEADLINE, drain_request(&mut stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request body deadline"))??;

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Consume header bytes up to the blank line; GET requests carry no body.
async fn drain_request(stream: &mut TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 512];
    let mut tail = Vec::with_capacity(4);
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > 4 {
            let cut = tail.len() - 4;
            tail.drain(..cut);
        }
        if tail == b"\r\n\r\n" || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(());
        }
    }
}
