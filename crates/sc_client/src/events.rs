//! The single event stream the host consumes. Fan-out to multiple UI
//! consumers happens outside the core.

use sc_proto::payloads::ErrorCode;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Transport is up; hello sent.
    Connected,
    /// Broker accepted our challenge signature.
    Authenticated { session_id: String },
    /// Transport dropped; reconnection in progress.
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    /// All reconnection attempts used up; host intervention required.
    PermanentlyDisconnected,

    /// Decrypted inbound message.
    MessageReceived {
        from: String,
        envelope_id: String,
        plaintext: String,
        timestamp: i64,
    },
    /// Broker accepted an outbound envelope for delivery.
    MessageAccepted { envelope_id: String },
    /// Terminal failure for an outbound envelope.
    MessageFailed {
        envelope_id: String,
        code: ErrorCode,
        reason: String,
    },
    /// Retryable relay pushback; the engine re-sends with backoff.
    MessageDeferred { envelope_id: String, code: ErrorCode },

    /// A peer's identity key changed; messaging is blocked until the user
    /// verifies the new safety number.
    IdentityMismatch { user_id: String },
    /// A new session became active with this peer.
    SessionEstablished { user_id: String },
}
