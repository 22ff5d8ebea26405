//! Key derivation for the ratchet.
//!
//! Three derivations, each with its own domain separator:
//!   root step     — HKDF(ikm = DH output, salt = root key, info = "RootChain")
//!   chain advance — HMAC-SHA256(chain key, 0x02)
//!   message key   — HKDF(ikm = chain key, no salt, info = "MK" || n_le32)
//!
//! The message key is indexed by the message number so a stored chain key
//! plus a header is enough to reproduce any key of that chain, which is what
//! makes skipped-key recovery deterministic.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

const INFO_ROOT_CHAIN: &[u8] = b"RootChain";
const INFO_MESSAGE_KEY: &[u8] = b"MK";
const CHAIN_ADVANCE_BYTE: u8 = 0x02;

/// General HKDF-SHA256 expand. `salt = None` uses the all-zero salt.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Root-chain step: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(INFO_ROOT_CHAIN, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((new_root, chain))
}

/// Advance a chain key one message forward. The old key must be zeroized by
/// the caller once the corresponding message key is no longer needed.
pub fn advance_chain(chain_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <Hmac<Sha256>>::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[CHAIN_ADVANCE_BYTE]);
    Ok(mac.finalize().into_bytes().into())
}

/// Message key for message number `n` of the given chain.
pub fn message_key(chain_key: &[u8; 32], n: u32) -> Result<[u8; 32], CryptoError> {
    let mut info = [0u8; 6];
    info[..2].copy_from_slice(INFO_MESSAGE_KEY);
    info[2..].copy_from_slice(&n.to_le_bytes());
    let mut mk = [0u8; 32];
    hkdf_sha256(chain_key, None, &info, &mut mk)?;
    Ok(mk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_step_is_deterministic_and_separates() {
        let rk = [1u8; 32];
        let dh = [2u8; 32];
        let (r1, c1) = kdf_root(&rk, &dh).unwrap();
        let (r2, c2) = kdf_root(&rk, &dh).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(c1, c2);
        assert_ne!(r1, c1);
        assert_ne!(r1, rk);
    }

    #[test]
    fn message_keys_differ_per_index() {
        let ck = [9u8; 32];
        let k0 = message_key(&ck, 0).unwrap();
        let k1 = message_key(&ck, 1).unwrap();
        assert_ne!(k0, k1);
        // Chain advance changes every subsequent message key.
        let ck2 = advance_chain(&ck).unwrap();
        assert_ne!(ck, ck2);
        assert_ne!(message_key(&ck2, 0).unwrap(), k0);
    }
}
