//! sc_crypto — SecureChat cryptographic core
//!
//! # Design principles
//! - No custom crypto; every primitive comes from audited Rust crates.
//! - Secret material is zeroized on drop; consumed message keys are erased.
//! - Deterministic derivations everywhere except key generators, which draw
//!   from the OS CSRNG.
//!
//! # Module layout
//! - `primitives` — X25519, Ed25519, ChaCha20-Poly1305, CSRNG, constant-time compare
//! - `kdf`        — HKDF/HMAC derivations for root, chain, and message keys
//! - `identity`   — long-term identity keypairs, fingerprints, safety numbers
//! - `prekeys`    — signed/one-time prekeys, bundles, triple-DH session setup
//! - `ratchet`    — Double Ratchet with DH steps and skipped-key recovery
//! - `error`      — `CryptoError` and `SessionError`

pub mod error;
pub mod identity;
pub mod kdf;
pub mod prekeys;
pub mod primitives;
pub mod ratchet;

pub use error::{CryptoError, SessionError};
