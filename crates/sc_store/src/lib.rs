//! sc_store — the key/value contract the core persists through.
//!
//! The core never owns a database. The host supplies an implementation of
//! [`Storage`]; this crate ships [`MemoryStore`], the reference backend used
//! by the tests and by hosts that want a purely in-memory profile.
//!
//! Keyspaces used by the core:
//!   identities/<uid>                     — serialized identity material
//!   sessions/<local_uid>/<remote_uid>    — serialized ratchet state
//!   contacts/<uid>                       — contact directory entries

pub mod keys;
pub mod memory;

use thiserror::Error;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found")]
    NotFound,

    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),

    #[error("Storage I/O error: {0}")]
    IoError(String),
}

/// Minimal key/value interface. Implementations must give readers a
/// consistent snapshot with respect to concurrent writers.
pub trait Storage: Send + Sync {
    /// Fetch a value. Missing keys are `StoreError::NotFound`.
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Insert or overwrite a value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Flush and release resources. Further calls may fail.
    fn close(&self) -> Result<(), StoreError>;
}
