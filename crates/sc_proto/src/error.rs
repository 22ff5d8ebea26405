use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid frame: {0}")]
    FrameInvalid(String),

    #[error("Unsupported protocol version {0:#06x}")]
    VersionUnsupported(u16),

    #[error("Unknown frame type {0}")]
    UnknownType(u16),

    #[error("Invalid payload: {0}")]
    PayloadInvalid(#[from] serde_json::Error),

    #[error("Envelope signature invalid")]
    SignatureInvalid,

    #[error(transparent)]
    Crypto(#[from] sc_crypto::CryptoError),
}
