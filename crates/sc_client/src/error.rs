use thiserror::Error;

/// Connection-level failures. Every variant except `PermanentlyDisconnected`
/// and `Cancelled` triggers a reconnection attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Transport deadline exceeded")]
    Timeout,

    #[error("Invalid relay URL: {0}")]
    UrlInvalid(String),

    #[error("Shut down by the host")]
    Cancelled,

    #[error("Gave up after {attempts} reconnection attempts")]
    PermanentlyDisconnected { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] sc_crypto::CryptoError),

    #[error(transparent)]
    Session(#[from] sc_crypto::SessionError),

    #[error(transparent)]
    Proto(#[from] sc_proto::ProtoError),

    #[error(transparent)]
    Store(#[from] sc_store::StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Identity key for {user_id} has changed; re-verify before messaging")]
    IdentityMismatch { user_id: String },

    #[error("Contact {user_id} is blocked")]
    ContactBlocked { user_id: String },

    #[error("Session setup with {user_id} already in progress; one message is buffered")]
    SetupInProgress { user_id: String },

    #[error("No prekey material for id {0}")]
    UnknownPrekey(u32),

    #[error("Not connected to a relay")]
    NotConnected,
}
