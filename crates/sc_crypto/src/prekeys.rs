//! Prekeys and asynchronous session setup.
//!
//! A user advertises a `PrekeyBundle` so peers can open a session while the
//! user is offline:
//!   - one signed prekey (SPK): X25519, public half signed by the identity
//!     Ed25519 key, rotated weekly
//!   - a pool of one-time prekeys (OPK): X25519, consumed once, ids assigned
//!     monotonically per identity
//!
//! Setup derives the initial shared secret from a triple DH (plus an OPK
//! term when one was available), all with a single initiator ephemeral:
//!
//!   DH1 = DH(IK_A, SPK_B)    DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)    DH4 = DH(EK_A, OPK_B)   [iff OPK]
//!
//!   SK  = HKDF(DH1 || DH2 || DH3 [|| DH4], info = "sc-x3dh-v1")
//!
//! The initiator MUST verify the SPK signature before computing any DH.
//! SK feeds the Double Ratchet as the initial root key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::CryptoError,
    identity::{IdentityKeyPair, IdentityPublic},
    kdf, primitives,
};

const SETUP_INFO: &[u8] = b"sc-x3dh-v1";

// ── Local prekey material ────────────────────────────────────────────────────

/// A signed prekey with its secret half. Persisted locally; only the public
/// half and signature are advertised.
#[derive(Serialize, Deserialize)]
pub struct SignedPrekey {
    pub id: u32,
    secret: [u8; 32],
    pub public: [u8; 32],
    /// Ed25519 signature over the raw public key bytes.
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Drop for SignedPrekey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl SignedPrekey {
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Result<Self, CryptoError> {
        let (secret, public) = primitives::x25519_keypair();
        let signature = identity.sign(public.as_bytes()).to_vec();
        Ok(Self {
            id,
            secret: secret.to_bytes(),
            public: *public.as_bytes(),
            signature,
            created_at: Utc::now(),
        })
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn public_key(&self) -> X25519Public {
        X25519Public::from(self.public)
    }
}

/// A one-time prekey with its secret half. Deleted after a single use.
#[derive(Serialize, Deserialize)]
pub struct OneTimePrekey {
    pub id: u32,
    secret: [u8; 32],
    pub public: [u8; 32],
}

impl Drop for OneTimePrekey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl OneTimePrekey {
    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

/// Batch-generate one-time prekeys with ids `start_id..start_id + count`.
pub fn generate_one_time_prekeys(start_id: u32, count: usize) -> Vec<OneTimePrekey> {
    (0..count)
        .map(|i| {
            let (secret, public) = primitives::x25519_keypair();
            OneTimePrekey {
                id: start_id + i as u32,
                secret: secret.to_bytes(),
                public: *public.as_bytes(),
            }
        })
        .collect()
}

// ── Advertised bundle ────────────────────────────────────────────────────────

/// The public bundle a user advertises for asynchronous session setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub user_id: String,
    pub identity: IdentityPublic,
    pub spk_id: u32,
    /// X25519 signed prekey public (base64url).
    pub spk_pub: String,
    /// Identity signature over the raw SPK public bytes (base64url).
    pub spk_sig: String,
    pub opk_id: Option<u32>,
    /// X25519 one-time prekey public (base64url).
    pub opk_pub: Option<String>,
}

impl PrekeyBundle {
    /// Verify the SPK signature under the advertised identity signing key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let spk_raw = decode32(&self.spk_pub)?;
        let sig = URL_SAFE_NO_PAD.decode(&self.spk_sig)?;
        self.identity.verify(&spk_raw, &sig)
    }
}

fn decode32(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = URL_SAFE_NO_PAD.decode(s)?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

// ── Setup handshake ──────────────────────────────────────────────────────────

/// Sent alongside the initiator's first envelope so the responder can derive
/// the same shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupHeader {
    pub sender_user_id: String,
    pub sender_identity: IdentityPublic,
    /// Initiator's ephemeral X25519 public (base64url).
    pub ek_pub: String,
    pub spk_id: u32,
    pub opk_id: Option<u32>,
}

/// Output of the initiator handshake.
#[derive(Debug)]
pub struct InitialSecrets {
    /// Initial root key for the Double Ratchet.
    pub shared_key: [u8; 32],
    /// The responder's SPK public, which becomes the first remote ratchet key.
    pub remote_spk_pub: [u8; 32],
}

/// Initiator side. Verifies the bundle, runs the DH set with one fresh
/// ephemeral, and returns the shared secret plus the header the responder
/// needs.
pub fn initiate(
    my_user_id: &str,
    my_identity: &IdentityKeyPair,
    bundle: &PrekeyBundle,
) -> Result<(InitialSecrets, SetupHeader), CryptoError> {
    bundle.verify()?;

    let spk_b_raw = decode32(&bundle.spk_pub)?;
    let spk_b = X25519Public::from(spk_b_raw);
    let ik_b = X25519Public::from(bundle.identity.dh_pub_bytes()?);

    let (ek_a, ek_a_pub) = primitives::x25519_keypair();
    let ik_a = my_identity.exchange_secret();

    let dh1 = primitives::x25519_dh(&ik_a, &spk_b)?;
    let dh2 = primitives::x25519_dh(&ek_a, &ik_b)?;
    let dh3 = primitives::x25519_dh(&ek_a, &spk_b)?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(128));
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);

    if let Some(ref opk_b64) = bundle.opk_pub {
        let opk_b = X25519Public::from(decode32(opk_b64)?);
        let dh4 = primitives::x25519_dh(&ek_a, &opk_b)?;
        ikm.extend_from_slice(&dh4);
    }

    let mut shared_key = [0u8; 32];
    kdf::hkdf_sha256(&ikm, None, SETUP_INFO, &mut shared_key)?;

    let header = SetupHeader {
        sender_user_id: my_user_id.to_string(),
        sender_identity: my_identity.public().clone(),
        ek_pub: URL_SAFE_NO_PAD.encode(ek_a_pub.as_bytes()),
        spk_id: bundle.spk_id,
        opk_id: bundle.opk_id,
    };

    Ok((
        InitialSecrets {
            shared_key,
            remote_spk_pub: spk_b_raw,
        },
        header,
    ))
}

/// Responder side. Mirrors the initiator's DH set with the secrets matching
/// the SPK/OPK ids named in the header.
pub fn respond(
    my_identity: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    header: &SetupHeader,
) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(decode32(&header.ek_pub)?);
    let ik_a = X25519Public::from(header.sender_identity.dh_pub_bytes()?);
    let ik_b = my_identity.exchange_secret();

    // Same terms, commuted: DH1 = SPK_B x IK_A, DH2 = IK_B x EK_A,
    // DH3 = SPK_B x EK_A, DH4 = OPK_B x EK_A.
    let dh1 = primitives::x25519_dh(my_spk_secret, &ik_a)?;
    let dh2 = primitives::x25519_dh(&ik_b, &ek_a)?;
    let dh3 = primitives::x25519_dh(my_spk_secret, &ek_a)?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(128));
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);

    if let Some(opk_secret) = my_opk_secret {
        let dh4 = primitives::x25519_dh(opk_secret, &ek_a)?;
        ikm.extend_from_slice(&dh4);
    }

    let mut shared_key = [0u8; 32];
    kdf::hkdf_sha256(&ikm, None, SETUP_INFO, &mut shared_key)?;
    Ok(shared_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(
        user_id: &str,
        identity: &IdentityKeyPair,
        spk: &SignedPrekey,
        opk: Option<&OneTimePrekey>,
    ) -> PrekeyBundle {
        PrekeyBundle {
            user_id: user_id.into(),
            identity: identity.public().clone(),
            spk_id: spk.id,
            spk_pub: URL_SAFE_NO_PAD.encode(spk.public),
            spk_sig: URL_SAFE_NO_PAD.encode(&spk.signature),
            opk_id: opk.map(|k| k.id),
            opk_pub: opk.map(|k| URL_SAFE_NO_PAD.encode(k.public)),
        }
    }

    #[test]
    fn setup_roundtrip_without_opk() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let bob_spk = SignedPrekey::generate(1, &bob).unwrap();

        let bundle = bundle_for("bob", &bob, &bob_spk, None);
        let (secrets, header) = initiate("alice", &alice, &bundle).unwrap();

        let bob_sk = respond(&bob, &bob_spk.secret(), None, &header).unwrap();
        assert_eq!(secrets.shared_key, bob_sk);
        assert_eq!(secrets.remote_spk_pub, bob_spk.public);
    }

    #[test]
    fn setup_roundtrip_with_opk() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let bob_spk = SignedPrekey::generate(7, &bob).unwrap();
        let opks = generate_one_time_prekeys(100, 1);

        let bundle = bundle_for("bob", &bob, &bob_spk, Some(&opks[0]));
        let (secrets, header) = initiate("alice", &alice, &bundle).unwrap();
        assert_eq!(header.opk_id, Some(100));

        let bob_sk = respond(&bob, &bob_spk.secret(), Some(&opks[0].secret()), &header).unwrap();
        assert_eq!(secrets.shared_key, bob_sk);
    }

    #[test]
    fn opk_term_changes_the_secret() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let bob_spk = SignedPrekey::generate(1, &bob).unwrap();
        let opks = generate_one_time_prekeys(0, 1);

        let with_opk = bundle_for("bob", &bob, &bob_spk, Some(&opks[0]));
        let without = bundle_for("bob", &bob, &bob_spk, None);

        let (s1, _) = initiate("alice", &alice, &with_opk).unwrap();
        let (s2, _) = initiate("alice", &alice, &without).unwrap();
        assert_ne!(s1.shared_key, s2.shared_key);
    }

    #[test]
    fn rejects_spk_signed_by_wrong_identity() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let mallory = IdentityKeyPair::generate().unwrap();

        let mut spk = SignedPrekey::generate(1, &bob).unwrap();
        spk.signature = mallory.sign(&spk.public).to_vec();

        let bundle = bundle_for("bob", &bob, &spk, None);
        let err = initiate("alice", &alice, &bundle).unwrap_err();
        assert!(matches!(err, CryptoError::SignatureInvalid));
    }

    #[test]
    fn one_time_prekey_ids_are_monotonic() {
        let opks = generate_one_time_prekeys(42, 5);
        let ids: Vec<u32> = opks.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![42, 43, 44, 45, 46]);
    }
}
