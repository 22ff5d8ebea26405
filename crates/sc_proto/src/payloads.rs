//! Control payloads: hello handshake, acks, presence, errors.

use serde::{Deserialize, Serialize};

use sc_crypto::identity::IdentityPublic;

/// First frame on a connection, and again with `challenge_sig` set once the
/// broker has issued its challenge. The record stays unauthenticated until
/// the signature verifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub user_id: String,
    pub identity: IdentityPublic,
    /// Ed25519 signature (base64url) over the 32 challenge bytes from
    /// `ServerHello`. Absent on the opening hello.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_sig: Option<String>,
}

/// Broker reply to the opening hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub session_id: String,
    /// 32 random bytes (base64url) the client must sign to authenticate.
    pub challenge: String,
}

/// Broker confirmation that a routed envelope was accepted for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the envelope being acknowledged.
    #[serde(rename = "ref")]
    pub ref_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
    pub status: PresenceStatus,
}

/// Machine-readable relay error codes, serialized snake_case into
/// `ErrorPayload.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UserOffline,
    QueueFull,
    RateLimited,
    NotAuthenticated,
    Superseded,
    FrameInvalid,
    VersionUnsupported,
    UnknownType,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    /// Id of the envelope this error refers to, when there is one.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    pub reason: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, ref_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            code,
            ref_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_snake_case() {
        let payload = ErrorPayload::new(ErrorCode::UserOffline, Some("id-1".into()), "offline");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["code"], "user_offline");
        assert_eq!(json["ref"], "id-1");
    }

    #[test]
    fn hello_roundtrip() {
        let identity = sc_crypto::identity::IdentityKeyPair::generate().unwrap();
        let hello = ClientHello {
            user_id: "alice".into(),
            identity: identity.public().clone(),
            challenge_sig: None,
        };
        let json = serde_json::to_vec(&hello).unwrap();
        let back: ClientHello = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.user_id, "alice");
        assert_eq!(&back.identity, identity.public());
        assert!(back.challenge_sig.is_none());
    }
}
