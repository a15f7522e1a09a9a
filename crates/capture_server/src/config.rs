//! Server configuration types and defaults.

use crate::game::{GridSize, RoomSettings, DEFAULT_ROOM_TTL, MAX_PLAYERS, MIN_PLAYERS};
use std::net::SocketAddr;
use std::time::Duration;

/// Settings applied to rooms whose upgrade URL leaves them unspecified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDefaults {
    /// Seats per room when the URL carries no `players` parameter
    pub capacity: usize,

    /// Board preset when the URL carries no `grid` parameter
    pub grid: GridSize,

    /// How long a room lives after creation
    pub ttl: Duration,

    /// Buffered state updates per room before new ones are dropped
    pub update_buffer: usize,
}

impl Default for RoomDefaults {
    fn default() -> Self {
        Self {
            capacity: MIN_PLAYERS,
            grid: GridSize::Small,
            ttl: DEFAULT_ROOM_TTL,
            update_buffer: 64,
        }
    }
}

impl RoomDefaults {
    /// Resolves the settings for a new room, clamping the requested player
    /// count into the supported range.
    pub fn settings_for(&self, players: Option<usize>, grid: Option<GridSize>) -> RoomSettings {
        let capacity = players.unwrap_or(self.capacity).clamp(MIN_PLAYERS, MAX_PLAYERS);
        RoomSettings::new(capacity, grid.unwrap_or(self.grid), self.ttl)
    }
}

/// Configuration structure for the game server.
///
/// Contains the listener addresses, connection limits and the tuning knobs of
/// the dispatch loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address the game listener binds to
    pub bind_address: SocketAddr,

    /// Optional address for the JSON introspection endpoints
    pub admin_address: Option<SocketAddr>,

    /// Maximum number of concurrent WebSocket connections
    pub max_connections: usize,

    /// How long a client may take to send its upgrade request
    pub handshake_timeout: Duration,

    /// Upper bound on a single multiplexer wait
    pub poll_timeout: Duration,

    /// Readiness events collected per multiplexer wait
    pub max_events: usize,

    /// Period of the room sweeper and stats log
    pub sweep_interval: Duration,

    pub rooms: RoomDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            admin_address: None,
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(100),
            max_events: 100,
            sweep_interval: Duration::from_secs(30),
            rooms: RoomDefaults::default(),
        }
    }
}
