//! Double Ratchet with DH ratchet steps and skipped-key recovery.
//!
//! State separation:
//!   root_key — updated on every DH ratchet step, never used to encrypt
//!   send_ck  — sending chain key, advanced per message
//!   recv_ck  — receiving chain key, advanced per message
//!   mk       — message key, derived from a chain key, used once, erased
//!
//! Each party generates a new X25519 ratchet keypair per turn: observing a
//! new remote public key in a header re-keys both chains through the root.
//! Forward secrecy comes from erasing old chain and message keys; a DH
//! ratchet step restores secrecy after a compromise.
//!
//! Out-of-order delivery is absorbed by `skipped`: message keys derived in
//! passing are retained, bounded per chain and globally, until their message
//! arrives. Decrypt never mutates state on failure: the algorithm runs on a
//! scratch copy and commits only after the AEAD tag verifies.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::{CryptoError, SessionError},
    kdf, primitives,
};

/// Skipped message keys retained per DH epoch.
pub const MAX_SKIP_PER_CHAIN: u32 = 200;
/// Skipped message keys retained across all epochs of one session.
pub const MAX_SKIP_TOTAL: usize = 1000;

// ── Header ───────────────────────────────────────────────────────────────────

/// Sent in clear alongside every ciphertext so the recipient can advance
/// their ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    #[serde(with = "b64_key")]
    pub dh: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub pn: u32,
    /// Message number in the current sending chain.
    pub n: u32,
}

impl RatchetHeader {
    /// Canonical byte form, bound into the AEAD associated data and covered
    /// by the envelope signature.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.dh);
        out[32..36].copy_from_slice(&self.pn.to_be_bytes());
        out[36..40].copy_from_slice(&self.n.to_be_bytes());
        out
    }
}

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh: [u8; 32],
    n: u32,
    mk: [u8; 32],
}

/// Complete Double Ratchet state for one peer. Serializable so the client
/// can persist it (encrypted) between runs.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    dh_self_secret: [u8; 32],
    dh_self_pub: [u8; 32],
    dh_remote: Option<[u8; 32]>,
    send_ck: Option<[u8; 32]>,
    send_n: u32,
    prev_send_n: u32,
    recv_ck: Option<[u8; 32]>,
    recv_n: u32,
    skipped: Vec<SkippedKey>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_self_secret.zeroize();
        if let Some(ref mut ck) = self.send_ck {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.recv_ck {
            ck.zeroize();
        }
        for entry in self.skipped.iter_mut() {
            entry.mk.zeroize();
        }
    }
}

impl RatchetState {
    /// Initiator setup. The responder's SPK becomes the first remote ratchet
    /// key and an immediate DH step establishes the sending chain.
    pub fn init_initiator(
        shared_key: [u8; 32],
        remote_spk_pub: [u8; 32],
    ) -> Result<Self, CryptoError> {
        let (dh_self, dh_self_pub) = primitives::x25519_keypair();
        let dh_out = primitives::x25519_dh(&dh_self, &X25519Public::from(remote_spk_pub))?;
        let (root_key, send_ck) = kdf::kdf_root(&shared_key, &dh_out)?;

        Ok(Self {
            root_key,
            dh_self_secret: dh_self.to_bytes(),
            dh_self_pub: *dh_self_pub.as_bytes(),
            dh_remote: Some(remote_spk_pub),
            send_ck: Some(send_ck),
            send_n: 0,
            prev_send_n: 0,
            recv_ck: None,
            recv_n: 0,
            skipped: Vec::new(),
        })
    }

    /// Responder setup. The SPK secret is the initial ratchet key; both
    /// chains are established by the DH step triggered by the initiator's
    /// first message.
    pub fn init_responder(shared_key: [u8; 32], spk_secret: &StaticSecret) -> Self {
        let dh_self_pub = X25519Public::from(spk_secret);
        Self {
            root_key: shared_key,
            dh_self_secret: spk_secret.to_bytes(),
            dh_self_pub: *dh_self_pub.as_bytes(),
            dh_remote: None,
            send_ck: None,
            send_n: 0,
            prev_send_n: 0,
            recv_ck: None,
            recv_n: 0,
            skipped: Vec::new(),
        }
    }

    /// Number of retained skipped keys, all epochs.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Encrypt one message. The AEAD associated data is `ad || header`,
    /// the nonce is the 96-bit big-endian message number, unique because
    /// the chain key advances per message and re-keys on every DH step.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>), SessionError> {
        let ck = self.send_ck.ok_or(SessionError::NotInitialized)?;

        let mut mk = kdf::message_key(&ck, self.send_n)?;
        let header = RatchetHeader {
            dh: self.dh_self_pub,
            pn: self.prev_send_n,
            n: self.send_n,
        };

        let ciphertext = primitives::aead_seal(
            &mk,
            &nonce_for(self.send_n),
            &full_ad(ad, &header),
            plaintext,
        )?;
        mk.zeroize();

        let mut next = kdf::advance_chain(&ck)?;
        if let Some(ref mut old) = self.send_ck {
            old.zeroize();
        }
        self.send_ck = Some(next);
        next.zeroize();
        self.send_n += 1;

        Ok((header, ciphertext))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt one message. Three cases:
    ///   1. the key was skipped earlier: use it and erase it
    ///   2. same chain: skip forward if needed, then decrypt
    ///   3. new remote ratchet key: DH ratchet on a scratch copy, then
    ///      decrypt, committing only on success
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        ad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, SessionError> {
        // Case 1: skipped key. Verify before erasing so a forged message
        // cannot destroy a stored key.
        if let Some(idx) = self
            .skipped
            .iter()
            .position(|s| s.dh == header.dh && s.n == header.n)
        {
            let mk = self.skipped[idx].mk;
            let plaintext = primitives::aead_open(
                &mk,
                &nonce_for(header.n),
                &full_ad(ad, header),
                ciphertext,
            )
            .map_err(auth_failed)?;
            let mut spent = self.skipped.swap_remove(idx);
            spent.mk.zeroize();
            return Ok(plaintext);
        }

        let mut trial = self.clone();
        let plaintext = trial.decrypt_advancing(header, ciphertext, ad)?;
        *self = trial;
        Ok(plaintext)
    }

    /// The mutating decrypt path, run on a scratch copy.
    fn decrypt_advancing(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        ad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, SessionError> {
        let same_chain = self.dh_remote.as_ref() == Some(&header.dh);

        if same_chain {
            if self.recv_ck.is_none() {
                // The remote key is known but no receiving chain exists for
                // it (an initiator being sent traffic on the SPK chain).
                return Err(SessionError::UnknownChain);
            }
            if header.n < self.recv_n {
                // The key for this number was consumed and erased.
                return Err(SessionError::ReplayDetected { n: header.n });
            }
        } else {
            if self.dh_remote.is_some() && header.pn < self.recv_n {
                // The header claims the previous chain ended before messages
                // we already consumed: a stale epoch whose keys are gone.
                return Err(SessionError::UnknownChain);
            }

            // Close out the current receiving chain up to the advertised
            // length, retaining its remaining keys.
            if self.recv_ck.is_some() {
                self.skip_to(header.pn)?;
            }
            self.dh_ratchet(&header.dh)?;
        }

        self.skip_to(header.n)?;

        let ck = self.recv_ck.ok_or(SessionError::UnknownChain)?;
        let mut mk = kdf::message_key(&ck, header.n)?;
        let plaintext = primitives::aead_open(
            &mk,
            &nonce_for(header.n),
            &full_ad(ad, header),
            ciphertext,
        )
        .map_err(auth_failed)?;
        mk.zeroize();

        let mut next = kdf::advance_chain(&ck)?;
        if let Some(ref mut old) = self.recv_ck {
            old.zeroize();
        }
        self.recv_ck = Some(next);
        next.zeroize();
        self.recv_n += 1;

        Ok(plaintext)
    }

    /// One full DH ratchet turn: re-key the receiving chain against the new
    /// remote key, then generate a fresh keypair and re-key the sending
    /// chain.
    fn dh_ratchet(&mut self, dh_remote_new: &[u8; 32]) -> Result<(), SessionError> {
        let remote = X25519Public::from(*dh_remote_new);

        self.dh_remote = Some(*dh_remote_new);

        let dh_recv =
            primitives::x25519_dh(&StaticSecret::from(self.dh_self_secret), &remote)?;
        let (root, recv_ck) = kdf::kdf_root(&self.root_key, &dh_recv)?;
        self.root_key = root;
        if let Some(ref mut old) = self.recv_ck {
            old.zeroize();
        }
        self.recv_ck = Some(recv_ck);
        self.recv_n = 0;

        self.prev_send_n = self.send_n;
        self.send_n = 0;
        let (dh_new, dh_new_pub) = primitives::x25519_keypair();
        let dh_send = primitives::x25519_dh(&dh_new, &remote)?;
        let (root, send_ck) = kdf::kdf_root(&self.root_key, &dh_send)?;
        self.root_key = root;
        if let Some(ref mut old) = self.send_ck {
            old.zeroize();
        }
        self.send_ck = Some(send_ck);
        self.dh_self_secret.zeroize();
        self.dh_self_secret = dh_new.to_bytes();
        self.dh_self_pub = *dh_new_pub.as_bytes();

        Ok(())
    }

    /// Derive and retain the receiving-chain keys from `recv_n` up to (but
    /// not including) `until`, enforcing both skip bounds.
    fn skip_to(&mut self, until: u32) -> Result<(), SessionError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let dh = match self.dh_remote {
            Some(dh) => dh,
            None => return Err(SessionError::UnknownChain),
        };
        let requested = (until - self.recv_n) as u64;
        let in_chain = self.skipped.iter().filter(|s| s.dh == dh).count() as u64;
        if in_chain + requested > MAX_SKIP_PER_CHAIN as u64 {
            return Err(SessionError::TooManySkipped {
                skipped: in_chain + requested,
                limit: MAX_SKIP_PER_CHAIN as u64,
            });
        }
        if self.skipped.len() as u64 + requested > MAX_SKIP_TOTAL as u64 {
            return Err(SessionError::OutOfOrderTooFar {
                stored: self.skipped.len() as u64,
                requested,
                limit: MAX_SKIP_TOTAL as u64,
            });
        }

        let mut ck = self.recv_ck.ok_or(SessionError::UnknownChain)?;
        while self.recv_n < until {
            let mk = kdf::message_key(&ck, self.recv_n)?;
            self.skipped.push(SkippedKey {
                dh,
                n: self.recv_n,
                mk,
            });
            let next = kdf::advance_chain(&ck)?;
            ck.zeroize();
            ck = next;
            self.recv_n += 1;
        }
        if let Some(ref mut old) = self.recv_ck {
            old.zeroize();
        }
        self.recv_ck = Some(ck);
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// 96-bit big-endian encoding of the message number.
fn nonce_for(n: u32) -> [u8; primitives::NONCE_LEN] {
    let mut nonce = [0u8; primitives::NONCE_LEN];
    nonce[8..].copy_from_slice(&n.to_be_bytes());
    nonce
}

/// AEAD associated data: caller AD followed by the canonical header bytes.
fn full_ad(ad: &[u8], header: &RatchetHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(ad.len() + 40);
    out.extend_from_slice(ad);
    out.extend_from_slice(&header.to_bytes());
    out
}

fn auth_failed(err: CryptoError) -> SessionError {
    match err {
        CryptoError::InvalidTag => SessionError::AuthFailed,
        other => SessionError::Crypto(other),
    }
}

mod b64_key {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(key))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(&s)
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
