//! Thin wrappers over the dalek / RustCrypto primitives.
//!
//! Everything else in this crate goes through these functions, so the
//! choice of curve, cipher, and RNG is made exactly once. No global state;
//! generators draw from the OS CSRNG.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// AEAD nonce length (IETF ChaCha20-Poly1305).
pub const NONCE_LEN: usize = 12;
/// Symmetric key length used throughout.
pub const KEY_LEN: usize = 32;

// ── Key agreement ────────────────────────────────────────────────────────────

/// Generate a fresh X25519 keypair.
pub fn x25519_keypair() -> (StaticSecret, X25519Public) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    (secret, public)
}

/// X25519 Diffie-Hellman. Rejects the all-zero shared secret produced by
/// low-order public keys.
pub fn x25519_dh(secret: &StaticSecret, public: &X25519Public) -> Result<[u8; 32], CryptoError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "non-contributory X25519 public key".into(),
        ));
    }
    Ok(*shared.as_bytes())
}

// ── Signatures ───────────────────────────────────────────────────────────────

/// Generate a fresh Ed25519 signing keypair.
pub fn ed25519_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Sign arbitrary bytes; returns the raw 64-byte signature.
pub fn ed25519_sign(key: &SigningKey, msg: &[u8]) -> [u8; 64] {
    key.sign(msg).to_bytes()
}

/// Verify a signature under a 32-byte Ed25519 public key.
pub fn ed25519_verify(public: &[u8; 32], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(public)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig_arr: [u8; 64] = sig
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
    let sig = Signature::from_bytes(&sig_arr);
    vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureInvalid)
}

// ── AEAD ─────────────────────────────────────────────────────────────────────

/// ChaCha20-Poly1305 seal. The caller owns nonce uniqueness; in the ratchet
/// the nonce is the message number, which never repeats under one key.
pub fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("bad AEAD key length".into()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::InvalidKey("AEAD encryption failed".into()))
}

/// ChaCha20-Poly1305 open. Tag mismatch is `InvalidTag`; the plaintext is
/// returned in a zeroizing buffer.
pub fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("bad AEAD key length".into()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::InvalidTag)?;
    Ok(Zeroizing::new(plaintext))
}

// ── Randomness ───────────────────────────────────────────────────────────────

/// `n` bytes from the OS CSRNG.
pub fn rand_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| CryptoError::RngFailure(e.to_string()))?;
    Ok(out)
}

/// A random 32-byte value (challenges, salts).
pub fn rand_array32() -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| CryptoError::RngFailure(e.to_string()))?;
    Ok(out)
}

// ── Constant-time comparison ─────────────────────────────────────────────────

/// Compare without short-circuiting on the first differing byte.
/// Length mismatch returns false immediately; lengths are not secret.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_commutative() {
        let (a_sec, a_pub) = x25519_keypair();
        let (b_sec, b_pub) = x25519_keypair();
        let ab = x25519_dh(&a_sec, &b_pub).unwrap();
        let ba = x25519_dh(&b_sec, &a_pub).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let key = ed25519_keypair();
        let sig = ed25519_sign(&key, b"hello");
        ed25519_verify(&key.verifying_key().to_bytes(), b"hello", &sig).unwrap();
        assert!(ed25519_verify(&key.verifying_key().to_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn aead_roundtrip_and_tag_check() {
        let key = [7u8; 32];
        let nonce = [0u8; NONCE_LEN];
        let ct = aead_seal(&key, &nonce, b"ad", b"secret").unwrap();
        let pt = aead_open(&key, &nonce, b"ad", &ct).unwrap();
        assert_eq!(&pt[..], b"secret");

        let err = aead_open(&key, &nonce, b"AD", &ct).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidTag));
    }

    #[test]
    fn ct_eq_basic() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
