//! Server orchestration: listeners, accept loop and background tasks.

pub mod admin;
pub mod core;
pub mod handlers;

pub use self::core::{GameServer, ServerContext, ServerStats, StatsSnapshot};
