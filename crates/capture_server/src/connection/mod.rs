//! Client connection abstraction.
//!
//! The multiplexer and dispatch loop only ever see [`Connection`] trait
//! objects wrapped in a [`ConnectionHandle`], which carries the metadata the
//! server needs to route messages: the descriptor, the room the socket was
//! upgraded into, and when it arrived.

pub mod upgrade;
pub mod websocket;

pub use upgrade::{UpgradeOutcome, UpgradeRequest};
pub use websocket::WsConnection;

use crate::error::ConnectionError;
use crate::game::RoomId;
use parking_lot::{Mutex, MutexGuard};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::debug;

/// A message-oriented, readiness-driven client connection.
///
/// Implementations must be usable from several threads at once: the dispatch
/// loop reads while room broadcasters write.
pub trait Connection: Send + Sync {
    /// Descriptor the multiplexer watches for readability.
    fn native_descriptor(&self) -> RawFd;

    /// Reads the next complete application message.
    ///
    /// Returns `Ok(None)` when no complete message is available yet. Control
    /// frames are handled internally and never surface here.
    fn read_message(&self) -> Result<Option<Vec<u8>>, ConnectionError>;

    /// Queues a text message for the peer.
    ///
    /// A frame the socket cannot take right away stays buffered, and
    /// [`Connection::has_pending_output`] reports it until a flush succeeds.
    fn send_text(&self, text: &str) -> Result<(), ConnectionError>;

    /// Pushes buffered output to the socket.
    fn flush(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        false
    }

    /// Starts an orderly shutdown of the connection.
    fn close(&self);
}

/// Shared handle to a live connection.
///
/// # Fields
///
/// * `fd` - Cached native descriptor, the multiplexer key
/// * `room` - Room named by the upgrade request
/// * `remote_addr` - Peer address
/// * `connected_at` - When the upgrade completed
pub struct ConnectionHandle {
    fd: RawFd,
    room: RoomId,
    remote_addr: SocketAddr,
    connected_at: SystemTime,
    closed: AtomicBool,
    /// Whether the multiplexer currently watches for writability.
    write_interest: Mutex<bool>,
    inner: Box<dyn Connection>,
}

impl ConnectionHandle {
    pub fn new(inner: Box<dyn Connection>, room: RoomId, remote_addr: SocketAddr) -> Self {
        Self {
            fd: inner.native_descriptor(),
            room,
            remote_addr,
            connected_at: SystemTime::now(),
            closed: AtomicBool::new(false),
            write_interest: Mutex::new(false),
            inner,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn read_message(&self) -> Result<Option<Vec<u8>>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.inner.read_message()
    }

    pub fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.inner.send_text(text)
    }

    pub fn flush(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.inner.flush()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.is_closed() && self.inner.has_pending_output()
    }

    /// Guard over the write interest flag. Closing takes the same lock, so
    /// the descriptor stays open while the guard is held.
    pub(crate) fn write_interest(&self) -> MutexGuard<'_, bool> {
        self.write_interest.lock()
    }

    /// Closes the underlying connection. Only the first call has an effect.
    pub fn close(&self) {
        let _interest = self.write_interest.lock();
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(fd = self.fd, room = %self.room, addr = %self.remote_addr, "Closing connection");
            self.inner.close();
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("fd", &self.fd)
            .field("room", &self.room)
            .field("remote_addr", &self.remote_addr)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Newline-delimited connection over a Unix socket pair, for exercising the
/// multiplexer and dispatch loop without a WebSocket handshake.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::io::{ErrorKind, Read, Write};
    use std::net::Shutdown;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    pub struct LineConnection {
        stream: Mutex<UnixStream>,
        pending: Mutex<Vec<u8>>,
    }

    impl LineConnection {
        pub fn new(stream: UnixStream) -> Self {
            stream
                .set_nonblocking(true)
                .expect("socket pair supports non-blocking mode");
            Self {
                stream: Mutex::new(stream),
                pending: Mutex::new(Vec::new()),
            }
        }

        /// Returns a connected pair: the server-side connection and the peer.
        pub fn pair() -> (Self, UnixStream) {
            let (server, client) = UnixStream::pair().expect("socket pair");
            (Self::new(server), client)
        }
    }

    impl Connection for LineConnection {
        fn native_descriptor(&self) -> RawFd {
            self.stream.lock().as_raw_fd()
        }

        fn read_message(&self) -> Result<Option<Vec<u8>>, ConnectionError> {
            let mut pending = self.pending.lock();
            loop {
                if let Some(end) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).take(end).collect();
                    return Ok(Some(line));
                }
                let mut buf = [0u8; 512];
                match self.stream.lock().read(&mut buf) {
                    Ok(0) => return Err(ConnectionError::Closed),
                    Ok(n) => pending.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(ConnectionError::Io(e)),
                }
            }
        }

        fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
            let mut stream = self.stream.lock();
            stream.write_all(text.as_bytes())?;
            stream.write_all(b"\n")?;
            Ok(())
        }

        fn close(&self) {
            let _ = self.stream.lock().shutdown(Shutdown::Both);
        }
    }
}
