//! Host-supplied configuration. The core never parses files; the host loads
//! whatever format it likes and hands over this struct.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Local user id, stable for the life of the account.
    pub user_id: String,
    /// Relay servers in preference order (`ws://host:port/ws` or `wss://`).
    pub relay_servers: Vec<String>,
    /// Deadline for the websocket connect handshake.
    pub connection_timeout: Duration,
    /// Retention hint for the host's message store. Unused by the core.
    pub message_retention_days: u32,
    /// Refuse to message contacts whose safety number was never confirmed.
    pub require_verification: bool,
}

impl Config {
    pub fn new(user_id: impl Into<String>, relay_servers: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            relay_servers,
            connection_timeout: Duration::from_secs(10),
            message_retention_days: 30,
            require_verification: false,
        }
    }
}
