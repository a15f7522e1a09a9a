//! # Capture Server
//!
//! A multiplayer server for a turn-based territory capture game played over
//! WebSockets. Players join a named room, pick a color and take turns placing
//! atoms on a grid; overfull cells explode into their neighbours and capture
//! them, and the last player left owning cells wins.
//!
//! ## Architecture Overview
//!
//! * **Accept loop** - tokio task that serves plain HTTP and upgrades
//!   `/websocket?room=...` requests
//! * **Multiplexer** - level-triggered epoll set keyed by socket descriptor,
//!   backed by a concurrent connection registry
//! * **Dispatch loop** - dedicated thread that serves ready connections and
//!   applies decoded messages to the right [`game::GameInstance`]
//! * **Broadcasters** - one task per room fanning state updates and defeat
//!   notices out to the room's players
//! * **Sweeper** - periodic removal of finished and expired rooms
//!
//! ## Message Flow
//!
//! 1. Client upgrades to a WebSocket and receives `welcome`
//! 2. Client sends `{"type":"join", ...}` and `{"type":"move", ...}` frames
//! 3. The dispatch loop applies them under the instance's locks
//! 4. The instance publishes a snapshot; the room broadcaster sends `state`
//!    (and `player_defeated` / `game_over` when relevant) to every player
//!
//! ## Error Handling
//!
//! Failures are typed by layer ([`error`]): multiplexer failures stay in the
//! dispatch loop, connection failures close one socket, and game errors are
//! answered to the offending client with a stable `code`.

#[cfg(not(target_os = "linux"))]
compile_error!("capture_server relies on epoll and only builds on Linux");

pub use config::{RoomDefaults, ServerConfig};
pub use error::{ConnectionError, GameError, MultiplexerError, ServerError};
pub use server::GameServer;
pub use utils::{create_server, create_server_with_config};

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod game;
pub mod messaging;
pub mod multiplexer;
pub mod server;
pub mod utils;
