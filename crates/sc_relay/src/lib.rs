//! sc_relay — the SecureChat relay broker
//!
//! A multiplexing router for opaque envelopes: clients authenticate with a
//! challenge-response hello, then the broker moves their chat and
//! key-exchange frames between bounded per-client queues. It inspects only
//! the routing fields; everything else passes through encrypted and signed.
//!
//! # Modules
//! - `broker`     — client records, user index, router task, statistics
//! - `conn`       — per-connection actor: handshake, liveness, dispatch
//! - `http`       — `/ws` upgrade plus `/health` and `/stats`
//! - `rate_limit` — per-user token bucket
//! - `error`      — relay error taxonomy

pub mod broker;
pub mod conn;
pub mod error;
pub mod http;
pub mod rate_limit;

pub use broker::{Broker, BrokerConfig, StatsSnapshot};
pub use error::RelayError;
pub use rate_limit::RateConfig;
