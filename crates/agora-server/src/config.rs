//! Server configuration.

use agora_relay::HubConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the Agora server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server-initiated pings, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Consecutive silent heartbeat intervals before the client is
    /// considered dead.
    pub heartbeat_missed_limit: u32,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Where to send clients during a migration handoff. `None` disables
    /// the handoff path; shutdown just closes connections.
    #[serde(default)]
    pub handoff_endpoint: Option<String>,
    /// Grace period for handoff acknowledgements, in seconds.
    pub handoff_grace_secs: u64,
    /// Relay core tunables.
    #[serde(default)]
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 4096,
            heartbeat_interval_secs: 30,
            heartbeat_missed_limit: 2,
            max_message_size: 64 * 1024,
            handoff_endpoint: None,
            handoff_grace_secs: 30,
            hub: HubConfig::default(),
        }
    }
}
