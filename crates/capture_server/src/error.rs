//! Error types for the capture server.
//!
//! Errors are split by the layer that produces them so that each caller can
//! decide how far a failure is allowed to travel: multiplexer failures stay in
//! the dispatch loop, connection failures tear down a single socket, and game
//! errors are reported back to the offending client only.

use crate::game::{Color, Position};
use std::io::Error as IoError;
use std::os::fd::RawFd;
use thiserror::Error;

/// Failures of the readiness multiplexer.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    #[error("Failed to allocate epoll instance: {0}")]
    ResourceExhaustion(IoError),

    #[error("Failed to register descriptor {fd}: {source}")]
    RegistrationFailed { fd: RawFd, source: IoError },

    #[error("Descriptor {0} is not registered")]
    NotRegistered(RawFd),

    #[error("epoll_wait failed: {0}")]
    WaitFailed(IoError),
}

/// Failures on a single client connection.
///
/// Every variant ends with the connection being torn down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Expected, user-facing game conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("Room is full")]
    RoomFull,

    #[error("Color {0} is already taken")]
    ColorTaken(Color),

    #[error("Username '{0}' is already taken")]
    UsernameTaken(String),

    #[error("Username must be 1 to 32 characters")]
    InvalidUsername,

    #[error("Invalid room id '{0}'")]
    InvalidRoom(String),

    #[error("It is not {0}'s turn")]
    NotYourTurn(String),

    #[error("Unknown player '{0}'")]
    UnknownPlayer(String),

    #[error("Player '{0}' is seated on another connection")]
    NotYourSeat(String),

    #[error("This connection already plays as '{0}'")]
    AlreadySeated(String),

    #[error("Unknown game instance '{0}'")]
    UnknownInstance(String),

    #[error("Cell {0} is owned by another player")]
    InvalidMove(Position),

    #[error("Cell {0} is outside the board")]
    OutOfBounds(Position),

    #[error("Waiting for players to join")]
    NotStarted,

    #[error("Game is already finished")]
    GameFinished,
}

impl GameError {
    /// Stable identifier sent to clients in error replies.
    pub fn code(&self) -> &'static str {
        match self {
            GameError::RoomFull => "room_full",
            GameError::ColorTaken(_) => "color_taken",
            GameError::UsernameTaken(_) => "username_taken",
            GameError::InvalidUsername => "invalid_username",
            GameError::InvalidRoom(_) => "invalid_room",
            GameError::NotYourTurn(_) => "not_your_turn",
            GameError::UnknownPlayer(_) => "unknown_player",
            GameError::NotYourSeat(_) => "not_your_seat",
            GameError::AlreadySeated(_) => "already_seated",
            GameError::UnknownInstance(_) => "unknown_instance",
            GameError::InvalidMove(_) => "invalid_move",
            GameError::OutOfBounds(_) => "out_of_bounds",
            GameError::NotStarted => "not_started",
            GameError::GameFinished => "game_finished",
        }
    }
}

/// Top-level server errors, mostly fatal at startup.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Multiplexer error: {0}")]
    Multiplexer(#[from] MultiplexerError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_error_codes_are_snake_case() {
        let errors = [
            GameError::RoomFull,
            GameError::ColorTaken(Color::Red),
            GameError::NotYourTurn("alice".to_string()),
            GameError::UnknownInstance("lobby".to_string()),
            GameError::OutOfBounds(Position::new(9, 9)),
        ];

        for error in errors {
            let code = error.code();
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{code}");
        }
    }

    #[test]
    fn test_error_display() {
        let err = GameError::ColorTaken(Color::Green);
        assert_eq!(err.to_string(), "Color #00FF00 is already taken");

        let err = MultiplexerError::NotRegistered(7);
        assert_eq!(err.to_string(), "Descriptor 7 is not registered");
    }
}
