//! Tunables for the engine, the client transport and the relay server.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::PeerRole;

/// Reconciliation engine timings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a local pause rejects remote "running" updates.
    pub pause_guard_window: Duration,
    /// How long the drag lock stays held after a gesture ends.
    pub drag_grace: Duration,
    /// Re-broadcast period of the full timer state while running.
    pub heartbeat_interval: Duration,
    /// Wall-clock ticker period.
    pub tick_interval: Duration,
    /// Upper bound on the late-joiner snapshot fetch.
    pub bootstrap_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pause_guard_window: Duration::from_secs(10),
            drag_grace: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(3),
            tick_interval: Duration::from_secs(1),
            bootstrap_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Short bootstrap timeout so failure paths resolve quickly in tests.
    pub fn for_testing() -> Self {
        Self {
            bootstrap_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

/// Client transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Display name announced on join
    pub peer_name: String,
    pub role: PeerRole,
    /// Reconnect attempts after a drop before giving up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles on every failed attempt
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Outgoing frames buffered before publishes are dropped
    pub outgoing_capacity: usize,
    /// Inbound events buffered per subscription
    pub subscription_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            peer_name: "Operator".to_string(),
            role: PeerRole::Controller,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(16),
            outgoing_capacity: 256,
            subscription_capacity: 256,
        }
    }
}

impl TransportConfig {
    pub fn new(server_url: impl Into<String>, peer_name: impl Into<String>, role: PeerRole) -> Self {
        Self {
            server_url: server_url.into(),
            peer_name: peer_name.into(),
            role,
            ..Self::default()
        }
    }

    /// Backoff before reconnect attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Store directory (None = relay only, nothing persisted)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}
