//! Per-connection handling between accept and registration.

use crate::{
    broadcast::spawn_broadcaster,
    connection::{upgrade, ConnectionHandle, UpgradeOutcome},
    error::{ConnectionError, ServerError},
    messaging::{self, ServerMessage},
    server::ServerContext,
};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Upgrades an accepted stream and hands it to the multiplexer.
///
/// The blocking handshake runs on tokio's blocking pool. Once upgraded, the
/// room named in the URL is resolved (or created, along with its
/// broadcaster), the client is greeted with a `welcome` message and the
/// connection is registered for dispatch.
///
/// # Arguments
///
/// * `stream` - The freshly accepted TCP stream
/// * `addr` - Remote address of the client
/// * `ctx` - Shared server state
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), ServerError> {
    let mut stream = stream.into_std().map_err(ConnectionError::Io)?;
    stream.set_nonblocking(false).map_err(ConnectionError::Io)?;

    if ctx.multiplexer.len() >= ctx.config.max_connections {
        warn!("Connection limit reached, rejecting {}", addr);
        ctx.stats.rejected.fetch_add(1, Ordering::Relaxed);
        tokio::task::spawn_blocking(move || upgrade::respond(&mut stream, 503, "Server is full"))
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))??;
        return Ok(());
    }

    let timeout = ctx.config.handshake_timeout;
    let outcome = tokio::task::spawn_blocking(move || upgrade::accept_client(stream, timeout))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;

    let (connection, request) = match outcome {
        UpgradeOutcome::Answered { status, path } => {
            debug!("Answered {} {} for {}", status, path, addr);
            ctx.stats.answered.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        UpgradeOutcome::Upgraded {
            connection,
            request,
        } => (connection, request),
    };
    ctx.stats.upgraded.fetch_add(1, Ordering::Relaxed);

    let settings = ctx.config.rooms.settings_for(request.players, request.grid);
    let (instance, events) = ctx.rooms.get_or_create(&request.room, settings);
    if let Some(events) = events {
        spawn_broadcaster(&instance, events, Arc::clone(&ctx.multiplexer), ctx.subscribe_shutdown());
    }

    let handle = Arc::new(ConnectionHandle::new(Box::new(connection), request.room.clone(), addr));

    let (rows, cols) = instance.board_dimensions();
    let welcome = ServerMessage::Welcome {
        room: request.room.clone(),
        status: instance.status(),
        capacity: instance.capacity(),
        rows,
        cols,
        available_colors: instance.available_colors(),
    };
    if let Err(e) = messaging::encode(&welcome).and_then(|text| handle.send_text(&text)) {
        handle.close();
        return Err(e.into());
    }

    if let Err(e) = ctx.multiplexer.register(Arc::clone(&handle)) {
        handle.close();
        return Err(e.into());
    }
    // The welcome frame may still be queued
    ctx.multiplexer.sync_write_interest(&handle);

    info!("👋 Client {} entered room {} (fd {})", addr, request.room, handle.fd());
    Ok(())
}
