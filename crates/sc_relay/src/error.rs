use thiserror::Error;

use sc_proto::payloads::ErrorCode;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Destination user is not connected")]
    UserOffline,

    #[error("Destination queue is full")]
    QueueFull,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Connection is not authenticated")]
    NotAuthenticated,

    #[error("Connection superseded by a newer one for the same user")]
    Superseded,

    #[error("Unknown client record")]
    UnknownClient,
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UserOffline => ErrorCode::UserOffline,
            Self::QueueFull => ErrorCode::QueueFull,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::Superseded => ErrorCode::Superseded,
            Self::UnknownClient => ErrorCode::Internal,
        }
    }
}
