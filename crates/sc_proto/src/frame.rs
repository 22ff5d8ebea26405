//! Binary framing for the relay transport.
//!
//! Every frame starts with a fixed 12-byte header:
//!
//!   offset  size  field
//!   0       4     magic 0x53434854 ("SCHT"), big-endian
//!   4       2     protocol version, big-endian (currently 0x0001)
//!   6       4     payload length, big-endian
//!   10      2     frame type, big-endian
//!
//! followed by `payload length` bytes of JSON payload. A frame with an
//! unknown type must be answered with an `Error` frame and the connection
//! closed.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

pub const MAGIC: u32 = 0x5343_4854;
pub const VERSION: u16 = 0x0001;
pub const HEADER_LEN: usize = 12;

/// Upper bound on payload size; larger frames are a protocol violation.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FrameType {
    ClientHello = 1,
    ServerHello = 2,
    Chat = 16,
    Ack = 17,
    Presence = 18,
    KeyExchange = 32,
    Ping = 64,
    Pong = 65,
    Error = 255,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ClientHello),
            2 => Some(Self::ServerHello),
            16 => Some(Self::Chat),
            17 => Some(Self::Ack),
            18 => Some(Self::Presence),
            32 => Some(Self::KeyExchange),
            64 => Some(Self::Ping),
            65 => Some(Self::Pong),
            255 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A decoded frame: type plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// A payload-less frame (ping/pong).
    pub fn control(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&encode_header(self.frame_type, self.payload.len()));
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a complete frame from `data`. The transport delivers whole
    /// messages (one websocket binary message per frame), so partial input
    /// is a framing error, not a retry condition.
    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < HEADER_LEN {
            return Err(ProtoError::FrameInvalid(format!(
                "frame shorter than header ({} bytes)",
                data.len()
            )));
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC {
            return Err(ProtoError::FrameInvalid(format!("bad magic {magic:#010x}")));
        }
        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(ProtoError::VersionUnsupported(version));
        }
        let len = u32::from_be_bytes([data[6], data[7], data[8], data[9]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(ProtoError::FrameInvalid(format!(
                "payload length {len} exceeds limit {MAX_PAYLOAD_LEN}"
            )));
        }
        if data.len() != HEADER_LEN + len {
            return Err(ProtoError::FrameInvalid(format!(
                "length field {len} does not match frame size {}",
                data.len() - HEADER_LEN
            )));
        }
        let raw_type = u16::from_be_bytes([data[10], data[11]]);
        let frame_type = FrameType::from_u16(raw_type).ok_or(ProtoError::UnknownType(raw_type))?;

        Ok(Self {
            frame_type,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }
}

/// The 12-byte header for a payload of the given length. Also the prefix of
/// the envelope signing input.
pub fn encode_header(frame_type: FrameType, payload_len: usize) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    out[4..6].copy_from_slice(&VERSION.to_be_bytes());
    out[6..10].copy_from_slice(&(payload_len as u32).to_be_bytes());
    out[10..12].copy_from_slice(&frame_type.as_u16().to_be_bytes());
    out
}
