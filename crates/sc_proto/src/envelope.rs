//! Signed wire envelopes, the records the relay routes.
//!
//! The relay is a dumb router: it reads `from`/`to` to route and nothing
//! else. Message content is opaque AEAD ciphertext; the ratchet header and
//! signature are visible but meaningless to the relay. Relays never verify
//! payload signatures; the receiving peer does.
//!
//! Signature rule: the identity signature covers the 12-byte frame header
//! computed for the unsigned payload, followed by the payload JSON with an
//! empty `signature` field. Both ends serialize the same struct, so the
//! byte form is canonical.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sc_crypto::{
    identity::{IdentityKeyPair, IdentityPublic},
    prekeys::{PrekeyBundle, SetupHeader},
    ratchet::RatchetHeader,
};

use crate::{
    error::ProtoError,
    frame::{self, Frame, FrameType},
};

// ── Chat envelope ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Chat,
    KeyExchange,
}

impl EnvelopeKind {
    pub fn frame_type(self) -> FrameType {
        match self {
            Self::Chat => FrameType::Chat,
            Self::KeyExchange => FrameType::KeyExchange,
        }
    }
}

/// The routed, signed wire record carrying one ratchet message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Random UUID; used for acks, error references, and dedup. No
    /// cryptographic meaning.
    pub id: String,
    pub version: u16,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: String,
    pub to: String,
    /// Sender wall clock, seconds since the epoch.
    pub timestamp: i64,
    /// Ratchet header: sender's DH public plus chain counters.
    pub header: RatchetHeader,
    /// AEAD ciphertext (base64url).
    pub ciphertext: String,
    /// Present only on the session-initiating message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupHeader>,
    /// Identity signature (base64url) over the frame header and the payload
    /// with this field empty.
    pub signature: String,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        from: &str,
        to: &str,
        header: RatchetHeader,
        ciphertext: &[u8],
        setup: Option<SetupHeader>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: frame::VERSION,
            kind,
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now().timestamp(),
            header,
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
            setup,
            signature: String::new(),
        }
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(URL_SAFE_NO_PAD
            .decode(&self.ciphertext)
            .map_err(sc_crypto::CryptoError::Base64Decode)?)
    }

    /// Sign with the sender's identity key.
    pub fn sign(&mut self, identity: &IdentityKeyPair) -> Result<(), ProtoError> {
        let input = self.signing_input()?;
        self.signature = URL_SAFE_NO_PAD.encode(identity.sign(&input));
        Ok(())
    }

    /// Verify under the claimed sender's identity public key.
    pub fn verify(&self, sender: &IdentityPublic) -> Result<(), ProtoError> {
        let input = self.signing_input()?;
        let sig = URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(sc_crypto::CryptoError::Base64Decode)?;
        sender
            .verify(&input, &sig)
            .map_err(|_| ProtoError::SignatureInvalid)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtoError> {
        Ok(Frame::new(
            self.kind.frame_type(),
            serde_json::to_vec(self)?,
        ))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtoError> {
        let envelope: Envelope = serde_json::from_slice(&frame.payload)?;
        let expected = envelope.kind.frame_type();
        if frame.frame_type != expected {
            return Err(ProtoError::FrameInvalid(format!(
                "frame type {:?} does not match envelope kind {:?}",
                frame.frame_type, envelope.kind
            )));
        }
        Ok(envelope)
    }

    fn signing_input(&self) -> Result<Vec<u8>, ProtoError> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        let payload = serde_json::to_vec(&unsigned)?;
        let mut input =
            Vec::with_capacity(frame::HEADER_LEN + payload.len());
        input.extend_from_slice(&frame::encode_header(self.kind.frame_type(), payload.len()));
        input.extend_from_slice(&payload);
        Ok(input)
    }
}

/// AEAD associated data binding a ciphertext to its endpoints and envelope
/// type. Both sides must derive it identically.
pub fn associated_data(from: &str, to: &str, kind: EnvelopeKind) -> Vec<u8> {
    let tag = match kind {
        EnvelopeKind::Chat => "chat",
        EnvelopeKind::KeyExchange => "key_exchange",
    };
    format!("{from}|{to}|{tag}").into_bytes()
}

// ── Key exchange envelopes ───────────────────────────────────────────────────

/// Peer-to-peer prekey distribution, routed by the relay like chat but
/// readable by the peer before any session exists. Contains only public
/// material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyExchangeBody {
    /// Ask the peer for a fresh prekey bundle.
    BundleRequest,
    /// Answer with a bundle (one-time prekey included while the pool lasts).
    BundleResponse { bundle: PrekeyBundle },
}

/// Signed key-exchange record. Same routing fields as [`Envelope`], plain
/// JSON body instead of ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchange {
    pub id: String,
    pub version: u16,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
    /// Sender's identity, so the receiver can verify the signature and
    /// apply the key-change policy before any session exists.
    pub sender_identity: IdentityPublic,
    pub body: KeyExchangeBody,
    pub signature: String,
}

impl KeyExchange {
    pub fn new(
        from: &str,
        to: &str,
        sender_identity: IdentityPublic,
        body: KeyExchangeBody,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: frame::VERSION,
            kind: EnvelopeKind::KeyExchange,
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now().timestamp(),
            sender_identity,
            body,
            signature: String::new(),
        }
    }

    pub fn sign(&mut self, identity: &IdentityKeyPair) -> Result<(), ProtoError> {
        let input = self.signing_input()?;
        self.signature = URL_SAFE_NO_PAD.encode(identity.sign(&input));
        Ok(())
    }

    pub fn verify(&self, sender: &IdentityPublic) -> Result<(), ProtoError> {
        let input = self.signing_input()?;
        let sig = URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(sc_crypto::CryptoError::Base64Decode)?;
        sender
            .verify(&input, &sig)
            .map_err(|_| ProtoError::SignatureInvalid)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtoError> {
        Ok(Frame::new(FrameType::KeyExchange, serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtoError> {
        if frame.frame_type != FrameType::KeyExchange {
            return Err(ProtoError::FrameInvalid(format!(
                "expected key_exchange frame, got {:?}",
                frame.frame_type
            )));
        }
        Ok(serde_json::from_slice(&frame.payload)?)
    }

    fn signing_input(&self) -> Result<Vec<u8>, ProtoError> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        let payload = serde_json::to_vec(&unsigned)?;
        let mut input = Vec::with_capacity(frame::HEADER_LEN + payload.len());
        input.extend_from_slice(&frame::encode_header(FrameType::KeyExchange, payload.len()));
        input.extend_from_slice(&payload);
        Ok(input)
    }
}

/// The only fields the relay reads from a routed payload. Everything else
/// stays opaque to the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingInfo {
    pub id: String,
    pub from: String,
    pub to: String,
}

impl RoutingInfo {
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
