//! Player records kept by a game instance.

use super::Color;
use serde::Serialize;
use std::os::fd::RawFd;

/// A seated player.
///
/// `connection` is only the descriptor of the socket the player last joined
/// from; the handle itself is owned by the connection registry.
#[derive(Debug, Clone)]
pub struct Player {
    pub username: String,
    pub color: Color,
    pub cell_count: usize,
    pub defeated: bool,
    pub connection: Option<RawFd>,
}

impl Player {
    pub fn new(username: String, color: Color) -> Self {
        Self {
            username,
            color,
            cell_count: 0,
            defeated: false,
            connection: None,
        }
    }

    pub fn summary(&self, seat: usize) -> PlayerSummary {
        PlayerSummary {
            username: self.username.clone(),
            color: self.color,
            seat,
            cell_count: self.cell_count,
            defeated: self.defeated,
            connected: self.connection.is_some(),
        }
    }
}

/// Read-only view of a player, safe to hand out and serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerSummary {
    pub username: String,
    pub color: Color,
    pub seat: usize,
    pub cell_count: usize,
    pub defeated: bool,
    pub connected: bool,
}
