//! Convenience constructors for [`GameServer`].

use crate::{config::ServerConfig, error::ServerError, server::GameServer};

/// Creates a server with the default configuration.
pub fn create_server() -> Result<GameServer, ServerError> {
    create_server_with_config(ServerConfig::default())
}

pub fn create_server_with_config(config: ServerConfig) -> Result<GameServer, ServerError> {
    GameServer::new(config)
}
