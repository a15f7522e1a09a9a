//! Game state: board rules, players, per-room instances and the room table.

pub mod board;
pub mod color;
pub mod instance;
pub mod player;
pub mod rooms;

pub use board::{Board, Cell, GridSize, Placement, Position};
pub use color::{Color, ParseColorError};
pub use instance::{
    BoardUpdate, DefeatNotice, GameInstance, InstanceEvents, InstanceSnapshot, InstanceStatus,
    MoveOutcome, RoomSettings, UpdateReason, DEFAULT_ROOM_TTL, MAX_ROOM_TTL,
};
pub use player::{Player, PlayerSummary};
pub use rooms::{RoomId, RoomManager, RoomSummary};

/// Upper bound on players per room, one per palette color.
pub const MAX_PLAYERS: usize = Color::PALETTE.len();

/// Lower bound on players per room.
pub const MIN_PLAYERS: usize = 2;
