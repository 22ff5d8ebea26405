//! The client engine: one task that owns every session.
//!
//! The transport task sends decoded frames over a channel; this task reacts,
//! mutates session state, and publishes events on a broadcast channel the
//! host reads. No callbacks, no shared session state, no re-entrancy; the
//! host talks back through the command channel only.
//!
//! Outbound path:  command -> session.encrypt -> envelope.sign -> frame -> transport
//! Inbound path:   frame -> envelope.verify -> session.decrypt -> event

use std::{collections::HashMap, sync::Arc, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use sc_crypto::prekeys::SetupHeader;
use sc_proto::{
    envelope::associated_data,
    payloads::{
        AckPayload, ClientHello, ErrorCode, ErrorPayload, PresencePayload, PresenceStatus,
        ServerHello,
    },
    Envelope, EnvelopeKind, Frame, FrameType, KeyExchange, KeyExchangeBody,
};
use sc_store::Storage;

use crate::{
    config::Config,
    error::{ClientError, TransportError},
    events::EngineEvent,
    identity::IdentityStore,
    session::{self, Session, SessionState},
    transport::TransportEvent,
};

/// Re-send attempts for a relay-deferred envelope before giving up.
const MAX_SEND_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(500);

/// Host requests. `Retry` is internal, queued by the engine's own timers.
#[derive(Debug)]
pub enum Command {
    SendText { to: String, body: String },
    /// Establish a session without sending anything yet.
    RequestSession { to: String },
    MarkVerified { user_id: String },
    BlockContact { user_id: String },
    /// Destroy the session with this peer; a new one needs a fresh setup.
    ResetSession { user_id: String },
    Retry { envelope_id: String },
    Shutdown,
}

struct PendingSend {
    frame: Frame,
    to: String,
    attempts: u32,
}

pub struct ChatEngine {
    config: Config,
    identity: IdentityStore,
    store: Arc<dyn Storage>,
    sessions: HashMap<String, Session>,
    outbound: mpsc::Sender<Frame>,
    events: broadcast::Sender<EngineEvent>,
    commands_tx: mpsc::Sender<Command>,
    unacked: HashMap<String, PendingSend>,
}

impl ChatEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn Storage>,
        outbound: mpsc::Sender<Frame>,
        commands_tx: mpsc::Sender<Command>,
    ) -> Result<Self, ClientError> {
        let identity = IdentityStore::open(store.clone(), &config.user_id)?;
        let (events, _) = broadcast::channel(256);

        // Resume persisted sessions.
        let mut sessions = HashMap::new();
        let prefix = sc_store::keys::session_prefix(&config.user_id);
        for (key, _) in store.scan(&prefix)? {
            let peer = key[prefix.len()..].to_string();
            if let Some(session) = session::load(store.as_ref(), &config.user_id, &peer)? {
                sessions.insert(peer, session);
            }
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "resumed persisted sessions");
        }

        Ok(Self {
            config,
            identity,
            store,
            sessions,
            outbound,
            events,
            commands_tx,
            unacked: HashMap::new(),
        })
    }

    /// Subscribe to the event stream. Multiple consumers fan out from here.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// A handle to the event channel, for subscribing after the engine has
    /// moved into its task.
    pub fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.events.clone()
    }

    pub fn fingerprint(&self) -> Result<String, ClientError> {
        self.identity.fingerprint()
    }

    /// Main loop. Returns when the host shuts down or the transport gives up
    /// for good.
    pub async fn run(
        mut self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut commands_rx: mpsc::Receiver<Command>,
    ) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                event = transport_rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    match event {
                        TransportEvent::Connected => {
                            self.emit(EngineEvent::Connected);
                            self.send_hello(None).await?;
                        }
                        TransportEvent::Frame(frame) => {
                            if let Err(e) = self.handle_frame(frame).await {
                                match e {
                                    ClientError::Transport(te) => return Err(te.into()),
                                    other => warn!(error = %other, "frame handling failed"),
                                }
                            }
                        }
                        TransportEvent::Disconnected { reason } => {
                            self.emit(EngineEvent::Disconnected { reason });
                        }
                        TransportEvent::Reconnecting { attempt } => {
                            self.emit(EngineEvent::Reconnecting { attempt });
                        }
                        TransportEvent::PermanentlyDisconnected => {
                            self.emit(EngineEvent::PermanentlyDisconnected);
                            return Err(TransportError::PermanentlyDisconnected {
                                attempts: crate::backoff::MAX_RECONNECT,
                            }
                            .into());
                        }
                    }
                }

                command = commands_rx.recv() => {
                    let Some(command) = command else { return Ok(()) };
                    match command {
                        Command::Shutdown => return Ok(()),
                        other => {
                            if let Err(e) = self.handle_command(other).await {
                                match e {
                                    ClientError::Transport(te) => return Err(te.into()),
                                    other => warn!(error = %other, "command failed"),
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) -> Result<(), ClientError> {
        match command {
            Command::SendText { to, body } => self.send_text(&to, &body).await,
            Command::RequestSession { to } => self.request_session(&to, None).await,
            Command::MarkVerified { user_id } => {
                self.identity.mark_verified(&user_id)?;
                Ok(())
            }
            Command::BlockContact { user_id } => {
                if let Some(mut contact) = self.identity.contact(&user_id)? {
                    contact.blocked = true;
                    crate::contacts::save(self.store.as_ref(), &contact)?;
                }
                Ok(())
            }
            Command::ResetSession { user_id } => {
                if let Some(mut session) = self.sessions.remove(&user_id) {
                    session.close();
                }
                session::remove(self.store.as_ref(), &self.config.user_id, &user_id)?;
                Ok(())
            }
            Command::Retry { envelope_id } => self.retry_send(&envelope_id).await,
            Command::Shutdown => Ok(()),
        }
    }

    async fn send_text(&mut self, to: &str, body: &str) -> Result<(), ClientError> {
        if let Some(contact) = self.identity.contact(to)? {
            if contact.blocked {
                return Err(ClientError::ContactBlocked {
                    user_id: to.to_string(),
                });
            }
            if contact.pending_identity.is_some() {
                self.emit(EngineEvent::IdentityMismatch {
                    user_id: to.to_string(),
                });
                return Err(ClientError::IdentityMismatch {
                    user_id: to.to_string(),
                });
            }
            if self.config.require_verification && !contact.verified {
                self.emit(EngineEvent::MessageFailed {
                    envelope_id: String::new(),
                    code: ErrorCode::Internal,
                    reason: format!("{to} is not verified and verification is required"),
                });
                return Ok(());
            }
        }

        let state = self.sessions.get(to).map(Session::state);
        match state {
            Some(SessionState::Active) => {
                self.encrypt_and_send(to, body.as_bytes().to_vec()).await
            }
            Some(SessionState::SetupPending) => {
                if let Some(session) = self.sessions.get_mut(to) {
                    session.begin_setup(Some(body.as_bytes().to_vec()))?;
                }
                Ok(())
            }
            Some(SessionState::Closed) | Some(SessionState::Uninitialized) | None => {
                self.request_session(to, Some(body.as_bytes().to_vec())).await
            }
        }
    }

    /// Start session setup with `to`, optionally buffering one plaintext to
    /// flush once the bundle arrives.
    async fn request_session(
        &mut self,
        to: &str,
        buffered: Option<Vec<u8>>,
    ) -> Result<(), ClientError> {
        let session = self
            .sessions
            .entry(to.to_string())
            .or_insert_with(|| Session::new(to));
        if session.state() == SessionState::Closed {
            *session = Session::new(to);
        }
        session.begin_setup(buffered)?;
        session::save(self.store.as_ref(), &self.config.user_id, session)?;

        let mut request = KeyExchange::new(
            &self.config.user_id,
            to,
            self.identity.public().clone(),
            KeyExchangeBody::BundleRequest,
        );
        request.sign(self.identity.identity())?;
        debug!(to, "requesting prekey bundle");
        self.send_frame(request.to_frame()?).await
    }

    async fn encrypt_and_send(&mut self, to: &str, plaintext: Vec<u8>) -> Result<(), ClientError> {
        let from = self.config.user_id.clone();
        let session = self
            .sessions
            .get_mut(to)
            .ok_or(sc_crypto::SessionError::NotInitialized)?;

        let ad = associated_data(&from, to, EnvelopeKind::Chat);
        let (header, ciphertext) = session.encrypt(&plaintext, &ad)?;
        let setup = session.take_pending_setup();

        let mut envelope =
            Envelope::new(EnvelopeKind::Chat, &from, to, header, &ciphertext, setup);
        envelope.sign(self.identity.identity())?;
        session::save(self.store.as_ref(), &from, session)?;

        let frame = envelope.to_frame()?;
        self.unacked.insert(
            envelope.id.clone(),
            PendingSend {
                frame: frame.clone(),
                to: to.to_string(),
                attempts: 0,
            },
        );
        self.send_frame(frame).await
    }

    async fn retry_send(&mut self, envelope_id: &str) -> Result<(), ClientError> {
        let Some(pending) = self.unacked.get(envelope_id) else {
            return Ok(()); // Acked or failed in the meantime.
        };
        debug!(envelope_id, attempt = pending.attempts, "re-sending deferred envelope");
        let frame = pending.frame.clone();
        self.send_frame(frame).await
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        match frame.frame_type {
            FrameType::ServerHello => {
                let hello: ServerHello = serde_json::from_slice(&frame.payload)
                    .map_err(sc_proto::ProtoError::PayloadInvalid)?;
                let challenge = URL_SAFE_NO_PAD
                    .decode(&hello.challenge)
                    .map_err(sc_crypto::CryptoError::Base64Decode)?;
                let sig = self.identity.identity().sign(&challenge);
                self.send_hello(Some(URL_SAFE_NO_PAD.encode(sig))).await?;
                self.emit(EngineEvent::Authenticated {
                    session_id: hello.session_id,
                });
                self.send_presence(PresenceStatus::Online).await
            }
            FrameType::Chat => {
                let envelope = Envelope::from_frame(&frame)?;
                self.handle_chat(envelope).await
            }
            FrameType::KeyExchange => {
                let kx = KeyExchange::from_frame(&frame)?;
                self.handle_key_exchange(kx).await
            }
            FrameType::Ack => {
                let ack: AckPayload = serde_json::from_slice(&frame.payload)
                    .map_err(sc_proto::ProtoError::PayloadInvalid)?;
                if self.unacked.remove(&ack.ref_id).is_some() {
                    self.emit(EngineEvent::MessageAccepted {
                        envelope_id: ack.ref_id,
                    });
                }
                Ok(())
            }
            FrameType::Error => {
                let error: ErrorPayload = serde_json::from_slice(&frame.payload)
                    .map_err(sc_proto::ProtoError::PayloadInvalid)?;
                self.handle_relay_error(error);
                Ok(())
            }
            // The transport answers pings; everything else is noise here.
            other => {
                debug!(?other, "ignoring unexpected frame type");
                Ok(())
            }
        }
    }

    async fn handle_chat(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        if envelope.to != self.config.user_id {
            warn!(to = %envelope.to, "dropping misrouted envelope");
            return Ok(());
        }
        let from = envelope.from.clone();

        // Fresh setup: the peer initiated (or re-initiated) a session.
        if let Some(setup) = envelope.setup.clone() {
            let has_active = self
                .sessions
                .get(&from)
                .map(|s| s.state() == SessionState::Active)
                .unwrap_or(false);
            if !has_active {
                return self.accept_incoming_setup(&from, setup, &envelope).await;
            }
            // An active session exists; prefer it and fall back to the setup
            // if the envelope predates our state loss on the peer's side.
            match self.decrypt_and_publish(&from, &envelope).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!(error = %e, "active session failed for setup envelope, re-accepting");
                    self.accept_incoming_setup(&from, setup, &envelope).await
                }
            }
        } else {
            self.decrypt_and_publish(&from, &envelope).await
        }
    }

    async fn accept_incoming_setup(
        &mut self,
        from: &str,
        setup: SetupHeader,
        envelope: &Envelope,
    ) -> Result<(), ClientError> {
        if setup.sender_user_id != from {
            warn!(from, "setup header names a different sender; dropping");
            return Ok(());
        }
        envelope.verify(&setup.sender_identity)?;

        let (shared_key, spk_secret) = match self.identity.accept_setup(&setup) {
            Ok(out) => out,
            Err(ClientError::IdentityMismatch { user_id }) => {
                self.emit(EngineEvent::IdentityMismatch {
                    user_id: user_id.clone(),
                });
                return Err(ClientError::IdentityMismatch { user_id });
            }
            Err(e) => return Err(e),
        };

        let session = self
            .sessions
            .entry(from.to_string())
            .or_insert_with(|| Session::new(from));
        if session.state() == SessionState::Closed || session.state() == SessionState::Active {
            *session = Session::new(from);
        }
        session.activate_responder(shared_key, &spk_secret)?;
        info!(peer = from, "session established (responder)");
        self.emit(EngineEvent::SessionEstablished {
            user_id: from.to_string(),
        });

        self.decrypt_and_publish(from, envelope).await
    }

    async fn decrypt_and_publish(
        &mut self,
        from: &str,
        envelope: &Envelope,
    ) -> Result<(), ClientError> {
        // Peers verify envelope signatures; the relay never does.
        match self.identity.contact(from)? {
            Some(contact) => envelope.verify(&contact.identity)?,
            None => {
                warn!(from, "chat from unknown sender without setup; dropping");
                return Ok(());
            }
        }

        let session = self
            .sessions
            .get_mut(from)
            .ok_or(sc_crypto::SessionError::NotInitialized)?;
        let ad = associated_data(from, &self.config.user_id, EnvelopeKind::Chat);
        let ciphertext = envelope.ciphertext_bytes()?;
        let plaintext = session.decrypt(&envelope.header, &ciphertext, &ad)?;
        session::save(self.store.as_ref(), &self.config.user_id, session)?;

        let body = String::from_utf8_lossy(&plaintext).into_owned();
        self.emit(EngineEvent::MessageReceived {
            from: from.to_string(),
            envelope_id: envelope.id.clone(),
            plaintext: body,
            timestamp: envelope.timestamp,
        });
        Ok(())
    }

    async fn handle_key_exchange(&mut self, kx: KeyExchange) -> Result<(), ClientError> {
        if kx.to != self.config.user_id {
            warn!(to = %kx.to, "dropping misrouted key exchange");
            return Ok(());
        }
        kx.verify(&kx.sender_identity)?;
        if let Err(e) = self
            .identity
            .upsert_contact_identity(&kx.from, &kx.sender_identity)
        {
            if let ClientError::IdentityMismatch { ref user_id } = e {
                self.emit(EngineEvent::IdentityMismatch {
                    user_id: user_id.clone(),
                });
            }
            return Err(e);
        }

        match kx.body {
            KeyExchangeBody::BundleRequest => {
                let bundle = self.identity.publish_prekey_bundle()?;
                let mut response = KeyExchange::new(
                    &self.config.user_id,
                    &kx.from,
                    self.identity.public().clone(),
                    KeyExchangeBody::BundleResponse { bundle },
                );
                response.sign(self.identity.identity())?;
                debug!(to = %kx.from, "answering prekey bundle request");
                self.send_frame(response.to_frame()?).await
            }
            KeyExchangeBody::BundleResponse { bundle } => {
                if bundle.user_id != kx.from {
                    warn!(from = %kx.from, "bundle names a different user; dropping");
                    return Ok(());
                }
                let (secrets, header) = self.identity.consume_remote_bundle(&bundle)?;

                let session = self
                    .sessions
                    .entry(kx.from.clone())
                    .or_insert_with(|| Session::new(&kx.from));
                if session.state() == SessionState::Closed {
                    *session = Session::new(&kx.from);
                }
                session.activate_initiator(&secrets)?;
                session.set_pending_setup(header);
                let buffered = session.take_buffered();
                session::save(self.store.as_ref(), &self.config.user_id, session)?;

                info!(peer = %kx.from, "session established (initiator)");
                self.emit(EngineEvent::SessionEstablished {
                    user_id: kx.from.clone(),
                });

                if let Some(plaintext) = buffered {
                    self.encrypt_and_send(&kx.from, plaintext).await?;
                }
                Ok(())
            }
        }
    }

    fn handle_relay_error(&mut self, error: ErrorPayload) {
        let ref_id = error.ref_id.clone().unwrap_or_default();
        match error.code {
            // Retryable pushback: back off and re-send.
            ErrorCode::QueueFull | ErrorCode::RateLimited => {
                let Some(pending) = self.unacked.get_mut(&ref_id) else {
                    return;
                };
                pending.attempts += 1;
                if pending.attempts > MAX_SEND_RETRIES {
                    self.unacked.remove(&ref_id);
                    self.emit(EngineEvent::MessageFailed {
                        envelope_id: ref_id,
                        code: error.code,
                        reason: error.reason,
                    });
                    return;
                }
                let delay = crate::backoff::delay(RETRY_BASE, pending.attempts - 1);
                self.emit(EngineEvent::MessageDeferred {
                    envelope_id: ref_id.clone(),
                    code: error.code,
                });
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = commands
                        .send(Command::Retry {
                            envelope_id: ref_id,
                        })
                        .await;
                });
            }
            ErrorCode::UserOffline => {
                if let Some(pending) = self.unacked.remove(&ref_id) {
                    debug!(to = %pending.to, "peer offline");
                }
                self.emit(EngineEvent::MessageFailed {
                    envelope_id: ref_id,
                    code: error.code,
                    reason: error.reason,
                });
            }
            ErrorCode::Superseded => {
                self.emit(EngineEvent::Disconnected {
                    reason: "superseded by a newer connection".into(),
                });
            }
            ErrorCode::NotAuthenticated => {
                warn!("relay reports not authenticated; hello will repeat on reconnect");
            }
            other => {
                warn!(code = ?other, reason = %error.reason, "relay error");
            }
        }
    }

    // ── Plumbing ─────────────────────────────────────────────────────────

    async fn send_hello(&mut self, challenge_sig: Option<String>) -> Result<(), ClientError> {
        let hello = ClientHello {
            user_id: self.config.user_id.clone(),
            identity: self.identity.public().clone(),
            challenge_sig,
        };
        let payload =
            serde_json::to_vec(&hello).map_err(sc_proto::ProtoError::PayloadInvalid)?;
        self.send_frame(Frame::new(FrameType::ClientHello, payload)).await
    }

    async fn send_presence(&mut self, status: PresenceStatus) -> Result<(), ClientError> {
        let presence = PresencePayload {
            user_id: self.config.user_id.clone(),
            status,
        };
        let payload =
            serde_json::to_vec(&presence).map_err(sc_proto::ProtoError::PayloadInvalid)?;
        self.send_frame(Frame::new(FrameType::Presence, payload)).await
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Cancelled)?;
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine; events are best-effort.
        let _ = self.events.send(event);
    }
}
