//! WebSocket connection over a non-blocking TCP stream.

use super::Connection;
use crate::error::ConnectionError;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use tungstenite::{Error as WsError, Message, WebSocket};

/// A server-side WebSocket whose socket has completed the upgrade handshake.
///
/// The socket is switched to non-blocking mode on construction, so reads
/// return as soon as the kernel buffer and tungstenite's own buffer run dry.
/// Writes that hit a full send buffer are kept in tungstenite's write buffer
/// and flagged until a later flush drains them.
pub struct WsConnection {
    fd: RawFd,
    socket: Mutex<WebSocket<TcpStream>>,
    pending_flush: AtomicBool,
}

impl WsConnection {
    pub fn new(socket: WebSocket<TcpStream>) -> Result<Self, ConnectionError> {
        let stream = socket.get_ref();
        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            fd: stream.as_raw_fd(),
            socket: Mutex::new(socket),
            pending_flush: AtomicBool::new(false),
        })
    }
}

impl Connection for WsConnection {
    fn native_descriptor(&self) -> RawFd {
        self.fd
    }

    fn read_message(&self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let mut socket = self.socket.lock();
        loop {
            match socket.read() {
                Ok(Message::Text(text)) => return Ok(Some(text.as_str().as_bytes().to_vec())),
                Ok(Message::Binary(data)) => return Ok(Some(data.to_vec())),
                // Pongs to pings are queued by tungstenite and flushed on the next read.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => return Err(ConnectionError::Closed),
                Err(error) => return classify(error).map(|()| None),
            }
        }
    }

    fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        let mut socket = self.socket.lock();
        let sent = socket.send(Message::text(text.to_string()));
        self.settle(sent)
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        let mut socket = self.socket.lock();
        let flushed = socket.flush();
        self.settle(flushed)
    }

    fn has_pending_output(&self) -> bool {
        self.pending_flush.load(Ordering::Acquire)
    }

    fn close(&self) {
        let mut socket = self.socket.lock();
        let _ = socket.close(None);
        let _ = socket.flush();
        let _ = socket.get_ref().shutdown(Shutdown::Both);
    }
}

impl WsConnection {
    /// Records whether the last write left bytes behind. Must be called with
    /// the socket lock held.
    fn settle(&self, result: Result<(), WsError>) -> Result<(), ConnectionError> {
        match result {
            Ok(()) => {
                self.pending_flush.store(false, Ordering::Release);
                Ok(())
            }
            Err(WsError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                self.pending_flush.store(true, Ordering::Release);
                Ok(())
            }
            Err(error) => classify(error),
        }
    }
}

/// `Ok(())` for would-block, which is not an error on a non-blocking socket.
fn classify(error: WsError) -> Result<(), ConnectionError> {
    match error {
        WsError::Io(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
        WsError::Io(e) => Err(ConnectionError::Io(e)),
        WsError::ConnectionClosed | WsError::AlreadyClosed => Err(ConnectionError::Closed),
        other => Err(ConnectionError::Protocol(other.to_string())),
    }
}
