use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("AEAD authentication tag mismatch")]
    InvalidTag,

    #[error("System RNG failure: {0}")]
    RngFailure(String),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Ratchet/session failures. `AuthFailed` and every other variant except
/// `ReplayDetected` leave the session state untouched.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not initialised")]
    NotInitialized,

    #[error("AEAD authentication failed")]
    AuthFailed,

    #[error("Too many skipped messages in chain ({skipped} > {limit})")]
    TooManySkipped { skipped: u64, limit: u64 },

    #[error("Skipped-key store exhausted ({stored} + {requested} > {limit})")]
    OutOfOrderTooFar {
        stored: u64,
        requested: u64,
        limit: u64,
    },

    #[error("Message references a ratchet chain that is no longer known")]
    UnknownChain,

    #[error("Message number {n} already consumed; key erased")]
    ReplayDetected { n: u32 },

    #[error("Identity key for {user_id} differs from the verified value")]
    IdentityMismatch { user_id: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
