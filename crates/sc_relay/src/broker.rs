//! The broker: client records, the authenticated user index, and the router
//! task that moves envelopes between them.
//!
//! The broker never looks past the routing fields (`id`, `from`, `to`) of a
//! payload. Ciphertext, ratchet headers, and signatures pass through
//! untouched; user payload signatures are the receiving peer's business.
//!
//! Connection actors call `register` / `authenticate` / `submit` /
//! `unregister`; the router task consumes the central queue and delivers to
//! per-client outbound queues. Every queue is bounded: a full destination
//! queue bounces `QueueFull` back to the sender rather than buffering
//! without limit.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sc_proto::{
    payloads::{AckPayload, ErrorPayload},
    Frame, FrameType,
};

use crate::{
    error::RelayError,
    rate_limit::{RateConfig, TokenBucket},
};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-client outbound queue bound.
    pub outbound_queue: usize,
    /// Central router queue bound.
    pub router_queue: usize,
    pub rate: RateConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            router_queue: 1000,
            rate: RateConfig::default(),
        }
    }
}

/// A message accepted from an authenticated client, waiting to be routed.
#[derive(Debug)]
pub struct RoutedMessage {
    pub from: String,
    pub envelope_id: String,
    pub to: String,
    pub frame: Frame,
}

/// Close instruction delivered to a connection actor.
#[derive(Debug, Clone)]
pub struct CloseReason {
    pub error: Option<ErrorPayload>,
    pub reason: String,
}

struct ClientRecord {
    user_id: Option<String>,
    outbound: mpsc::Sender<Frame>,
    close: watch::Sender<Option<CloseReason>>,
    last_seen: Instant,
}

#[derive(Default)]
struct State {
    clients: HashMap<String, ClientRecord>,
    users: HashMap<String, String>,
}

/// Ends of a registered connection, held by its actor.
pub struct ClientPorts {
    pub client_id: String,
    pub outbound_rx: mpsc::Receiver<Frame>,
    pub close_rx: watch::Receiver<Option<CloseReason>>,
}

/// Read-only statistics snapshot, served on `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connected_clients: usize,
    pub authenticated_users: usize,
    pub messages_routed: u64,
    pub uptime_seconds: u64,
}

pub struct Broker {
    config: BrokerConfig,
    state: RwLock<State>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    router_tx: mpsc::Sender<RoutedMessage>,
    messages_routed: AtomicU64,
    started: Instant,
}

impl Broker {
    /// Build the broker and spawn its router task.
    pub fn start(config: BrokerConfig) -> Arc<Self> {
        let (router_tx, router_rx) = mpsc::channel(config.router_queue);
        let broker = Arc::new(Self {
            config,
            state: RwLock::new(State::default()),
            buckets: Mutex::new(HashMap::new()),
            router_tx,
            messages_routed: AtomicU64::new(0),
            started: Instant::now(),
        });
        tokio::spawn(broker.clone().router_loop(router_rx));
        broker
    }

    // ── Client lifecycle ─────────────────────────────────────────────────

    /// New connection; state CONNECTED until the hello handshake completes.
    pub fn register(&self) -> ClientPorts {
        let client_id = Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let (close_tx, close_rx) = watch::channel(None);

        self.state.write().clients.insert(
            client_id.clone(),
            ClientRecord {
                user_id: None,
                outbound: outbound_tx,
                close: close_tx,
                last_seen: Instant::now(),
            },
        );
        debug!(client_id, "client connected");
        ClientPorts {
            client_id,
            outbound_rx,
            close_rx,
        }
    }

    /// Promote a record to AUTHENTICATED and index it by user id. An
    /// existing record for the same user is superseded: told why, then
    /// closed.
    pub fn authenticate(&self, client_id: &str, user_id: &str) -> Result<(), RelayError> {
        let mut state = self.state.write();
        if !state.clients.contains_key(client_id) {
            return Err(RelayError::UnknownClient);
        }

        if let Some(old_id) = state.users.insert(user_id.to_string(), client_id.to_string()) {
            if old_id != client_id {
                if let Some(old) = state.clients.get(&old_id) {
                    info!(user_id, old_client = %old_id, "superseding previous connection");
                    let _ = old.close.send(Some(CloseReason {
                        error: Some(ErrorPayload::new(
                            RelayError::Superseded.code(),
                            None,
                            "superseded",
                        )),
                        reason: "superseded".into(),
                    }));
                }
            }
        }

        let record = state
            .clients
            .get_mut(client_id)
            .ok_or(RelayError::UnknownClient)?;
        record.user_id = Some(user_id.to_string());
        record.last_seen = Instant::now();
        info!(client_id, user_id, "client authenticated");
        Ok(())
    }

    /// Record inbound activity.
    pub fn touch(&self, client_id: &str) {
        if let Some(record) = self.state.write().clients.get_mut(client_id) {
            record.last_seen = Instant::now();
        }
    }

    /// Drop a record; the user index entry goes with it if it still points
    /// here.
    pub fn unregister(&self, client_id: &str) {
        let mut state = self.state.write();
        if let Some(record) = state.clients.remove(client_id) {
            if let Some(user_id) = record.user_id {
                if state.users.get(&user_id).map(String::as_str) == Some(client_id) {
                    state.users.remove(&user_id);
                }
            }
        }
        debug!(client_id, "client removed");
    }

    // ── Routing ──────────────────────────────────────────────────────────

    /// Accept an envelope from an authenticated sender into the central
    /// queue. Applies the per-user rate limit.
    pub fn submit(
        &self,
        from_user: &str,
        envelope_id: &str,
        to: &str,
        frame: Frame,
    ) -> Result<(), RelayError> {
        {
            let mut buckets = self.buckets.lock();
            let bucket = buckets
                .entry(from_user.to_string())
                .or_insert_with(|| TokenBucket::new(self.config.rate, Instant::now()));
            if !bucket.try_take(Instant::now()) {
                return Err(RelayError::RateLimited);
            }
        }

        self.router_tx
            .try_send(RoutedMessage {
                from: from_user.to_string(),
                envelope_id: envelope_id.to_string(),
                to: to.to_string(),
                frame,
            })
            .map_err(|_| RelayError::QueueFull)
    }

    async fn router_loop(self: Arc<Self>, mut router_rx: mpsc::Receiver<RoutedMessage>) {
        while let Some(message) = router_rx.recv().await {
            self.route_one(message);
        }
    }

    fn route_one(&self, message: RoutedMessage) {
        let dest = {
            let state = self.state.read();
            state
                .users
                .get(&message.to)
                .and_then(|client_id| state.clients.get(client_id))
                .map(|record| record.outbound.clone())
        };

        let Some(dest) = dest else {
            debug!(to = %message.to, "destination offline");
            self.send_to_user(
                &message.from,
                error_frame(
                    RelayError::UserOffline.code(),
                    Some(message.envelope_id),
                    "destination user is not connected",
                ),
            );
            return;
        };

        match dest.try_send(message.frame) {
            Ok(()) => {
                self.messages_routed.fetch_add(1, Ordering::Relaxed);
                self.send_to_user(&message.from, ack_frame(&message.envelope_id));
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(to = %message.to, "destination queue full");
                self.send_to_user(
                    &message.from,
                    error_frame(
                        RelayError::QueueFull.code(),
                        Some(message.envelope_id),
                        "destination queue is full",
                    ),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.send_to_user(
                    &message.from,
                    error_frame(
                        RelayError::UserOffline.code(),
                        Some(message.envelope_id),
                        "destination user disconnected",
                    ),
                );
            }
        }
    }

    /// Best-effort control frame to an authenticated user.
    fn send_to_user(&self, user_id: &str, frame: Frame) {
        let state = self.state.read();
        if let Some(record) = state
            .users
            .get(user_id)
            .and_then(|client_id| state.clients.get(client_id))
        {
            let _ = record.outbound.try_send(frame);
        }
    }

    // ── Statistics ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.state.read();
        StatsSnapshot {
            connected_clients: state.clients.len(),
            authenticated_users: state.users.len(),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

// ── Control frame helpers ────────────────────────────────────────────────────

pub fn error_frame(
    code: sc_proto::payloads::ErrorCode,
    ref_id: Option<String>,
    reason: &str,
) -> Frame {
    let payload = ErrorPayload::new(code, ref_id, reason);
    Frame::new(
        FrameType::Error,
        serde_json::to_vec(&payload).expect("error payload serializes"),
    )
}

pub fn ack_frame(ref_id: &str) -> Frame {
    let payload = AckPayload {
        ref_id: ref_id.to_string(),
    };
    Frame::new(
        FrameType::Ack,
        serde_json::to_vec(&payload).expect("ack payload serializes"),
    )
}
