//! sc_client — SecureChat client core
//!
//! Everything between the crypto primitives and the host UI: the stateful
//! identity store, per-peer sessions, the relay transport, and the engine
//! task that ties them together. The host drives the core through a command
//! channel and reads a single event stream; no callbacks cross the boundary.
//!
//! # Modules
//! - `config`    — host-supplied configuration struct
//! - `identity`  — identity + prekey lifecycle, trust decisions
//! - `contacts`  — contact directory on the storage contract
//! - `session`   — per-peer state machine around the ratchet
//! - `transport` — websocket task: framing, deadlines, reconnect
//! - `backoff`   — reconnect/retry pacing
//! - `engine`    — the session-owning task
//! - `events`    — the event stream the host consumes
//! - `client`    — facade wiring transport + engine

pub mod backoff;
pub mod client;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod session;
pub mod transport;

pub use client::ChatClient;
pub use config::Config;
pub use engine::{ChatEngine, Command};
pub use error::{ClientError, TransportError};
pub use events::EngineEvent;
pub use identity::IdentityStore;
pub use session::{Session, SessionState};
