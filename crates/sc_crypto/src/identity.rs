//! Long-term identity keys.
//!
//! Each user owns one `IdentityKeyPair` for the life of the account:
//! an Ed25519 half for signatures (prekeys, envelopes, hello challenges)
//! and an X25519 half for the identity Diffie-Hellman terms of session
//! setup. The public halves together are the user's identity on the wire.
//!
//! Key-change policy: if a stored identity public for a contact changes,
//! session setup and messaging to that contact are refused until the user
//! explicitly re-verifies (safety-number comparison). Enforcement lives in
//! the client identity store; this module only produces the material.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{error::CryptoError, primitives};

/// Serialized secret length: signing seed (32) followed by exchange secret (32).
const SECRET_LEN: usize = 64;

// ── Public half ──────────────────────────────────────────────────────────────

/// The public identity as seen by peers: both public keys, base64url on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublic {
    /// Ed25519 verifying key (base64url, 32 bytes).
    pub sig_pub: String,
    /// X25519 agreement key (base64url, 32 bytes).
    pub dh_pub: String,
}

impl IdentityPublic {
    pub fn sig_pub_bytes(&self) -> Result<[u8; 32], CryptoError> {
        decode32(&self.sig_pub)
    }

    pub fn dh_pub_bytes(&self) -> Result<[u8; 32], CryptoError> {
        decode32(&self.dh_pub)
    }

    /// First 8 bytes of SHA-256(sig_pub || dh_pub), hex-encoded.
    /// Deterministic from the public material alone.
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(self.sig_pub_bytes()?);
        hasher.update(self.dh_pub_bytes()?);
        let digest = hasher.finalize();
        Ok(hex::encode(&digest[..8]))
    }

    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        primitives::ed25519_verify(&self.sig_pub_bytes()?, msg, sig)
    }

    fn combined(&self) -> Result<[u8; 64], CryptoError> {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.sig_pub_bytes()?);
        out[32..].copy_from_slice(&self.dh_pub_bytes()?);
        Ok(out)
    }
}

fn decode32(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = URL_SAFE_NO_PAD.decode(s)?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

// ── Keypair ──────────────────────────────────────────────────────────────────

/// Long-term identity keypair. Secrets are zeroized on drop.
pub struct IdentityKeyPair {
    signing_seed: [u8; 32],
    exchange_secret: [u8; 32],
    public: IdentityPublic,
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.signing_seed.zeroize();
        self.exchange_secret.zeroize();
    }
}

impl IdentityKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let signing = primitives::ed25519_keypair();
        let (exchange, exchange_pub) = primitives::x25519_keypair();
        let public = IdentityPublic {
            sig_pub: URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes()),
            dh_pub: URL_SAFE_NO_PAD.encode(exchange_pub.as_bytes()),
        };
        Ok(Self {
            signing_seed: signing.to_bytes(),
            exchange_secret: exchange.to_bytes(),
            public,
        })
    }

    /// Reconstruct from the 64-byte secret produced by [`to_bytes`].
    ///
    /// [`to_bytes`]: IdentityKeyPair::to_bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SECRET_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "identity secret must be {SECRET_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut signing_seed = [0u8; 32];
        let mut exchange_secret = [0u8; 32];
        signing_seed.copy_from_slice(&bytes[..32]);
        exchange_secret.copy_from_slice(&bytes[32..]);

        let signing = SigningKey::from_bytes(&signing_seed);
        let exchange_pub = X25519Public::from(&StaticSecret::from(exchange_secret));
        let public = IdentityPublic {
            sig_pub: URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes()),
            dh_pub: URL_SAFE_NO_PAD.encode(exchange_pub.as_bytes()),
        };
        Ok(Self {
            signing_seed,
            exchange_secret,
            public,
        })
    }

    /// Serialize the secret halves for vault storage.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(SECRET_LEN);
        out.extend_from_slice(&self.signing_seed);
        out.extend_from_slice(&self.exchange_secret);
        Zeroizing::new(out)
    }

    pub fn public(&self) -> &IdentityPublic {
        &self.public
    }

    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        self.public.fingerprint()
    }

    /// X25519 secret for the identity DH terms of session setup.
    pub fn exchange_secret(&self) -> StaticSecret {
        StaticSecret::from(self.exchange_secret)
    }

    /// Sign arbitrary bytes with the identity signing key.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let key = SigningKey::from_bytes(&self.signing_seed);
        primitives::ed25519_sign(&key, msg)
    }
}

// ── Safety number ────────────────────────────────────────────────────────────

/// 60 decimal digits in 12 groups of 5, derived from
/// SHA-256(min(A, B) || max(A, B)) where A, B are each party's
/// (sig_pub || dh_pub). Both peers compute the same value.
pub fn safety_number(a: &IdentityPublic, b: &IdentityPublic) -> Result<String, CryptoError> {
    let a_comb = a.combined()?;
    let b_comb = b.combined()?;

    let mut hasher = Sha256::new();
    if a_comb.as_slice() <= b_comb.as_slice() {
        hasher.update(a_comb);
        hasher.update(b_comb);
    } else {
        hasher.update(b_comb);
        hasher.update(a_comb);
    }
    let digest = hasher.finalize();

    let mut groups = Vec::with_capacity(12);
    for i in 0..12 {
        let mut group = String::with_capacity(5);
        for j in 0..5 {
            let byte = digest[(i * 5 + j) % digest.len()];
            group.push(char::from(b'0' + byte % 10));
        }
        groups.push(group);
    }
    Ok(groups.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let identity = IdentityKeyPair::generate().unwrap();
        let fp1 = identity.fingerprint().unwrap();
        let fp2 = identity.public().fingerprint().unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 16); // 8 bytes hex
    }

    #[test]
    fn secret_roundtrip_preserves_public() {
        let identity = IdentityKeyPair::generate().unwrap();
        let restored = IdentityKeyPair::from_bytes(&identity.to_bytes()).unwrap();
        assert_eq!(identity.public(), restored.public());
        assert_eq!(identity.fingerprint().unwrap(), restored.fingerprint().unwrap());
    }

    #[test]
    fn safety_number_is_symmetric_and_60_digits() {
        let x = IdentityKeyPair::generate().unwrap();
        let y = IdentityKeyPair::generate().unwrap();

        let xy = safety_number(x.public(), y.public()).unwrap();
        let yx = safety_number(y.public(), x.public()).unwrap();
        assert_eq!(xy, yx);

        let groups: Vec<&str> = xy.split(' ').collect();
        assert_eq!(groups.len(), 12);
        for group in groups {
            assert_eq!(group.len(), 5);
            assert!(group.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn signature_verifies_under_public_half() {
        let identity = IdentityKeyPair::generate().unwrap();
        let sig = identity.sign(b"prekey bytes");
        identity.public().verify(b"prekey bytes", &sig).unwrap();

        let other = IdentityKeyPair::generate().unwrap();
        assert!(other.public().verify(b"prekey bytes", &sig).is_err());
    }
}
