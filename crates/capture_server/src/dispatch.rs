//! The dispatch loop: readiness in, game operations out.
//!
//! A single dedicated thread waits on the [`Multiplexer`], serves one message
//! from every ready connection per pass, decodes it and routes it to the game
//! instance named by the connection's room. Connections that may still hold
//! buffered messages are kept on a backlog and served again on the next pass,
//! so one busy socket cannot starve the rest.
//!
//! This thread is the only place connections are unregistered. Rooms removed
//! by the sweeper arrive as [`RetiredRoom`]s and their sockets are closed
//! here. Failures on one connection tear down that connection only;
//! multiplexer failures are logged and the loop keeps going.

use crate::connection::ConnectionHandle;
use crate::error::{ConnectionError, MultiplexerError};
use crate::game::{Position, RoomId, RoomManager};
use crate::messaging::{self, ClientMessage, ServerMessage};
use crate::multiplexer::Multiplexer;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A room dropped by the sweeper whose connections still need closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredRoom {
    pub room: RoomId,
    /// Connections that arrived after this instant belong to a newer room
    /// with the same name and are left open.
    pub swept_at: SystemTime,
}

pub struct Dispatcher {
    multiplexer: Arc<Multiplexer>,
    rooms: Arc<RoomManager>,
    retired: Mutex<mpsc::Receiver<RetiredRoom>>,
    backlog: Mutex<Vec<Arc<ConnectionHandle>>>,
    poll_timeout: Duration,
    max_events: usize,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        multiplexer: Arc<Multiplexer>,
        rooms: Arc<RoomManager>,
        retired: mpsc::Receiver<RetiredRoom>,
        poll_timeout: Duration,
        max_events: usize,
    ) -> Self {
        Self {
            multiplexer,
            rooms,
            retired: Mutex::new(retired),
            backlog: Mutex::new(Vec::new()),
            poll_timeout,
            max_events,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that makes [`Dispatcher::run`] return after its current wait.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs the loop on a dedicated OS thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("capture-dispatch".to_string())
            .spawn(move || self.run())
    }

    pub fn run(&self) {
        info!("🔁 Dispatch loop started");
        while !self.stop.load(Ordering::Acquire) {
            self.poll_once();
        }
        info!("Dispatch loop stopped");
    }

    /// Closes retired rooms, then serves one message from every backlogged or
    /// ready connection. Returns how many connections were served.
    ///
    /// The wait does not block while the backlog is non-empty.
    pub fn poll_once(&self) -> usize {
        self.close_retired_rooms();

        let backlog = std::mem::take(&mut *self.backlog.lock());
        let timeout = if backlog.is_empty() { self.poll_timeout } else { Duration::ZERO };
        let ready = match self.multiplexer.wait(timeout, self.max_events) {
            Ok(ready) => ready,
            Err(e) => {
                error!("Multiplexer wait failed: {}", e);
                Vec::new()
            }
        };

        let mut served = HashSet::new();
        let mut again = Vec::new();
        for handle in backlog.iter().chain(ready.iter()) {
            if handle.is_closed() || !served.insert(handle.fd()) {
                continue;
            }
            if self.service(handle) {
                again.push(Arc::clone(handle));
            }
        }
        *self.backlog.lock() = again;
        served.len()
    }

    /// Flushes queued output, then handles at most one message. Returns
    /// `true` when the connection may have more messages buffered.
    fn service(&self, handle: &Arc<ConnectionHandle>) -> bool {
        if handle.has_pending_output() {
            if let Err(e) = handle.flush() {
                self.teardown(handle, &e);
                return false;
            }
        }

        let more = match handle.read_message() {
            Ok(Some(payload)) => {
                if let Err(e) = self.handle_payload(handle, &payload) {
                    if matches!(e, ConnectionError::Decode(_)) {
                        let reply = ServerMessage::error("bad_request", e.to_string());
                        let _ = messaging::encode(&reply).and_then(|text| handle.send_text(&text));
                    }
                    self.teardown(handle, &e);
                    return false;
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.teardown(handle, &e);
                return false;
            }
        };

        self.multiplexer.sync_write_interest(handle);
        more
    }

    fn handle_payload(&self, handle: &ConnectionHandle, payload: &[u8]) -> Result<(), ConnectionError> {
        let message = messaging::decode(payload)?;
        if let Some(reply) = self.route(handle, message) {
            handle.send_text(&messaging::encode(&reply)?)?;
        }
        Ok(())
    }

    /// Applies `message` to the room of `handle` and returns the direct reply,
    /// if any. Successful moves are answered through the room broadcast.
    pub fn route(&self, handle: &ConnectionHandle, message: ClientMessage) -> Option<ServerMessage> {
        let instance = match self.rooms.get(handle.room()) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(fd = handle.fd(), room = %handle.room(), "Message for unknown room");
                return Some(ServerMessage::from(&e));
            }
        };

        match message {
            ClientMessage::Join { username, color } => {
                match instance.join_connected(&username, color, handle.fd()) {
                    Ok(player) => Some(ServerMessage::Joined { player }),
                    Err(e) => {
                        debug!(room = %handle.room(), username = %username, error = %e, "Join rejected");
                        Some(ServerMessage::from(&e))
                    }
                }
            }
            ClientMessage::Move { username, row, col } => {
                match instance.apply_move_from(handle.fd(), &username, Position::new(row, col)) {
                    Ok(_) => None,
                    Err(e) => {
                        debug!(room = %handle.room(), username = %username, error = %e, "Move rejected");
                        Some(ServerMessage::from(&e))
                    }
                }
            }
        }
    }

    /// Closes every connection of the rooms the sweeper retired.
    fn close_retired_rooms(&self) {
        let mut retired = self.retired.lock();
        while let Ok(RetiredRoom { room, swept_at }) = retired.try_recv() {
            let mut closed = 0;
            for handle in self.multiplexer.connections_in(&room) {
                if handle.connected_at() > swept_at {
                    continue;
                }
                self.release(&handle);
                closed += 1;
            }
            info!(room = %room, closed, "🧹 Closed connections of retired room");
        }
    }

    /// Unregisters, detaches and closes a failed connection.
    ///
    /// The player keeps their seat and cells; only the association with this
    /// socket is cleared.
    fn teardown(&self, handle: &Arc<ConnectionHandle>, reason: &ConnectionError) {
        self.release(handle);

        match reason {
            ConnectionError::Closed => {
                info!(fd = handle.fd(), room = %handle.room(), addr = %handle.remote_addr(), "🔌 Connection closed");
            }
            other => {
                warn!(fd = handle.fd(), room = %handle.room(), addr = %handle.remote_addr(), error = %other, "Connection dropped");
            }
        }
    }

    fn release(&self, handle: &Arc<ConnectionHandle>) {
        match self.multiplexer.unregister(handle) {
            Ok(()) => {}
            Err(MultiplexerError::NotRegistered(fd)) => {
                error!(fd, room = %handle.room(), "🐛 Connection was unregistered outside the dispatch loop");
            }
            Err(e) => warn!("Failed to unregister connection: {}", e),
        }

        // Detach before closing so the descriptor number cannot be reused meanwhile.
        if let Ok(instance) = self.rooms.get(handle.room()) {
            instance.detach_connection(handle.fd());
        }
        handle.close();
    }
}
