//! Message type definitions for client-server communication.
//!
//! Every message is a JSON object whose `type` field selects the variant.

use crate::game::{Color, InstanceSnapshot, InstanceStatus, PlayerSummary, RoomId, UpdateReason};
use serde::{Deserialize, Serialize};

/// A message sent from a client to the server.
///
/// # Example
///
/// ```json
/// { "type": "join", "username": "alice", "color": "#FF0000" }
/// { "type": "move", "username": "alice", "row": 2, "col": 3 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Take a seat in the room this connection was upgraded into.
    Join { username: String, color: Color },

    /// Place an atom on `(row, col)`.
    Move {
        username: String,
        row: usize,
        col: usize,
    },
}

/// A message sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message after the upgrade.
    Welcome {
        room: RoomId,
        status: InstanceStatus,
        capacity: usize,
        rows: usize,
        cols: usize,
        available_colors: Vec<Color>,
    },

    /// Reply to a successful join.
    Joined { player: PlayerSummary },

    /// Room-wide state after a join, move or disconnect.
    State {
        reason: UpdateReason,
        snapshot: InstanceSnapshot,
    },

    PlayerDefeated { player: PlayerSummary },

    GameOver { winner: PlayerSummary },

    /// A rejected request. `code` is stable, `message` is for humans.
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
