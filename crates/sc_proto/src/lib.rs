//! sc_proto — SecureChat wire protocol
//!
//! All frames share a fixed 12-byte binary header; payloads are versioned
//! JSON. Routed envelopes carry opaque ciphertext plus the ratchet header
//! and an identity signature; control frames (hello, ack, presence, error)
//! are plain signed-or-unsigned JSON.
//!
//! # Modules
//! - `frame`    — binary header, frame types, encode/decode
//! - `envelope` — signed chat / key-exchange envelopes
//! - `payloads` — hello handshake, acks, presence, error payloads

pub mod envelope;
pub mod error;
pub mod frame;
pub mod payloads;

pub use envelope::{Envelope, EnvelopeKind, KeyExchange, KeyExchangeBody, RoutingInfo};
pub use error::ProtoError;
pub use frame::{Frame, FrameType};
