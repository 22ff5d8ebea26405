//! Per-peer session lifecycle around the ratchet.
//!
//! State machine:
//!
//!   UNINITIALIZED ──begin_setup──> SETUP_PENDING ──activate──> ACTIVE ──close──> CLOSED
//!          └────────────activate (responder)─────────────────────┘
//!
//! Only ACTIVE accepts encrypt/decrypt. SETUP_PENDING holds at most one
//! outbound plaintext, flushed when the prekey bundle arrives and the
//! ratchet comes up. There is at most one session per peer; the engine's
//! session map enforces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sc_crypto::{
    prekeys::{InitialSecrets, SetupHeader},
    ratchet::{RatchetHeader, RatchetState},
    SessionError,
};
use sc_store::{keys, Storage, StoreError};
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    SetupPending,
    Active,
    Closed,
}

#[derive(Serialize, Deserialize)]
pub struct Session {
    pub peer_user_id: String,
    state: SessionState,
    ratchet: Option<RatchetState>,
    /// Plaintext buffered while the prekey bundle is in flight. Never
    /// persisted.
    #[serde(skip)]
    pending_outbound: Option<Vec<u8>>,
    /// Setup header that must ride on our next outbound envelope so the
    /// responder can derive the shared secret. Public material only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pending_setup: Option<SetupHeader>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Session {
    pub fn new(peer_user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            peer_user_id: peer_user_id.to_string(),
            state: SessionState::Uninitialized,
            ratchet: None,
            pending_outbound: None,
            pending_setup: None,
            created_at: now,
            last_used: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to SETUP_PENDING, optionally buffering one outbound plaintext.
    /// A second buffered message while setup is in flight is refused.
    pub fn begin_setup(&mut self, plaintext: Option<Vec<u8>>) -> Result<(), ClientError> {
        match self.state {
            SessionState::Uninitialized | SessionState::SetupPending => {}
            _ => return Err(SessionError::NotInitialized.into()),
        }
        if let Some(plaintext) = plaintext {
            if self.pending_outbound.is_some() {
                return Err(ClientError::SetupInProgress {
                    user_id: self.peer_user_id.clone(),
                });
            }
            self.pending_outbound = Some(plaintext);
        }
        self.state = SessionState::SetupPending;
        Ok(())
    }

    /// The buffered plaintext, if any. Taking it clears the buffer.
    pub fn take_buffered(&mut self) -> Option<Vec<u8>> {
        self.pending_outbound.take()
    }

    /// Attach the setup header the next outbound envelope must carry.
    pub fn set_pending_setup(&mut self, header: SetupHeader) {
        self.pending_setup = Some(header);
    }

    /// Consume the setup header, once an envelope carries it.
    pub fn take_pending_setup(&mut self) -> Option<SetupHeader> {
        self.pending_setup.take()
    }

    /// Initiator activation, after the peer's bundle was consumed.
    pub fn activate_initiator(&mut self, secrets: &InitialSecrets) -> Result<(), ClientError> {
        match self.state {
            SessionState::Uninitialized | SessionState::SetupPending => {}
            _ => return Err(SessionError::NotInitialized.into()),
        }
        let ratchet =
            RatchetState::init_initiator(secrets.shared_key, secrets.remote_spk_pub)?;
        self.ratchet = Some(ratchet);
        self.state = SessionState::Active;
        self.last_used = Utc::now();
        Ok(())
    }

    /// Responder activation, on the first incoming setup envelope.
    pub fn activate_responder(
        &mut self,
        shared_key: [u8; 32],
        spk_secret: &StaticSecret,
    ) -> Result<(), ClientError> {
        match self.state {
            SessionState::Uninitialized | SessionState::SetupPending => {}
            _ => return Err(SessionError::NotInitialized.into()),
        }
        self.ratchet = Some(RatchetState::init_responder(shared_key, spk_secret));
        self.state = SessionState::Active;
        self.last_used = Utc::now();
        Ok(())
    }

    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>), ClientError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotInitialized.into());
        }
        let ratchet = self.ratchet.as_mut().ok_or(SessionError::NotInitialized)?;
        let out = ratchet.encrypt(plaintext, ad)?;
        self.last_used = Utc::now();
        Ok(out)
    }

    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        ad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, ClientError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotInitialized.into());
        }
        let ratchet = self.ratchet.as_mut().ok_or(SessionError::NotInitialized)?;
        let plaintext = ratchet.decrypt(header, ciphertext, ad)?;
        self.last_used = Utc::now();
        Ok(plaintext)
    }

    /// Terminal. The ratchet state (and its keys) are dropped and zeroized.
    pub fn close(&mut self) {
        self.ratchet = None;
        self.pending_outbound = None;
        self.pending_setup = None;
        self.state = SessionState::Closed;
    }
}

// ── Persistence ──────────────────────────────────────────────────────────────

pub fn load(
    store: &dyn Storage,
    local_user_id: &str,
    peer_user_id: &str,
) -> Result<Option<Session>, ClientError> {
    match store.get(&keys::session(local_user_id, peer_user_id)) {
        Ok(bytes) => {
            let session = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            Ok(Some(session))
        }
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn save(
    store: &dyn Storage,
    local_user_id: &str,
    session: &Session,
) -> Result<(), ClientError> {
    let bytes =
        serde_json::to_vec(session).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    store.put(
        &keys::session(local_user_id, &session.peer_user_id),
        &bytes,
    )?;
    Ok(())
}

pub fn remove(
    store: &dyn Storage,
    local_user_id: &str,
    peer_user_id: &str,
) -> Result<(), ClientError> {
    store.delete(&keys::session(local_user_id, peer_user_id))?;
    Ok(())
}
