//! Wire messages and their JSON encoding.

pub mod types;

pub use types::{ClientMessage, ServerMessage};

use crate::error::{ConnectionError, GameError};

/// Decodes a raw client payload.
pub fn decode(payload: &[u8]) -> Result<ClientMessage, ConnectionError> {
    serde_json::from_slice(payload).map_err(|e| ConnectionError::Decode(e.to_string()))
}

/// Encodes a server message as a JSON text frame.
pub fn encode(message: &ServerMessage) -> Result<String, ConnectionError> {
    serde_json::to_string(message).map_err(|e| ConnectionError::Protocol(e.to_string()))
}

impl From<&GameError> for ServerMessage {
    fn from(error: &GameError) -> Self {
        ServerMessage::error(error.code(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Color, Position};
    use serde_json::{json, Value};

    #[test]
    fn test_decode_client_messages() {
        let join = decode(br##"{"type":"join","username":"alice","color":"#ff0000"}"##).unwrap();
        assert_eq!(
            join,
            ClientMessage::Join {
                username: "alice".to_string(),
                color: Color::Red,
            }
        );

        let mv = decode(br#"{"type":"move","username":"alice","row":1,"col":4}"#).unwrap();
        assert_eq!(
            mv,
            ClientMessage::Move {
                username: "alice".to_string(),
                row: 1,
                col: 4,
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(ConnectionError::Decode(_))));
        assert!(matches!(
            decode(br#"{"type":"teleport","username":"alice"}"#),
            Err(ConnectionError::Decode(_))
        ));
        assert!(matches!(
            decode(br##"{"type":"join","username":"alice","color":"#123456"}"##),
            Err(ConnectionError::Decode(_))
        ));
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = ServerMessage::from(&GameError::InvalidMove(Position::new(0, 1)));
        let value: Value = serde_json::from_str(&encode(&reply).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "code": "invalid_move",
                "message": "Cell (0, 1) is owned by another player",
            })
        );
    }
}
