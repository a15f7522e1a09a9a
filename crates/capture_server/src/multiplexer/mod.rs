//! Readiness multiplexer over Linux epoll.
//!
//! Interest is level-triggered: a connection that still has unread data after
//! a dispatch pass is reported again by the next [`Multiplexer::wait`]. Each
//! epoll registration carries the descriptor as its token, and readiness is
//! resolved back to a handle through the [`ConnectionRegistry`]. Tokens whose
//! descriptor is no longer in the registry are silently dropped.
//!
//! Writability is only watched while a connection has output it could not
//! flush; see [`Multiplexer::sync_write_interest`].

pub mod registry;

pub use registry::ConnectionRegistry;

use crate::connection::ConnectionHandle;
use crate::error::MultiplexerError;
use crate::game::RoomId;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
const WRITE_INTEREST: u32 = libc::EPOLLOUT as u32;

pub struct Multiplexer {
    epoll: OwnedFd,
    registry: ConnectionRegistry,
}

impl Multiplexer {
    /// Allocates the epoll instance.
    pub fn new() -> Result<Self, MultiplexerError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(MultiplexerError::ResourceExhaustion(io::Error::last_os_error()));
        }
        // SAFETY: `fd` was just returned by epoll_create1 and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(epoll_fd = fd, "Multiplexer created");

        Ok(Self {
            epoll,
            registry: ConnectionRegistry::new(),
        })
    }

    /// Starts watching `handle` for readability.
    ///
    /// # Arguments
    ///
    /// * `handle` - Connection to watch; its descriptor must not already be registered
    ///
    /// # Returns
    ///
    /// `RegistrationFailed` if the kernel refuses the descriptor, in which case
    /// the registry is left untouched.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), MultiplexerError> {
        let fd = handle.fd();
        self.add_interest(fd)
            .map_err(|source| MultiplexerError::RegistrationFailed { fd, source })?;

        if let Some(previous) = self.registry.insert(handle) {
            warn!(fd, room = %previous.room(), "Replaced a stale registry entry");
        }
        trace!(fd, "Registered descriptor");
        Ok(())
    }

    /// Stops watching `handle`.
    ///
    /// A handle that is not currently registered, including one already
    /// unregistered, yields `NotRegistered`.
    pub fn unregister(&self, handle: &Arc<ConnectionHandle>) -> Result<(), MultiplexerError> {
        let fd = handle.fd();
        if !self.registry.remove(handle) {
            return Err(MultiplexerError::NotRegistered(fd));
        }

        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let source = io::Error::last_os_error();
            return match source.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => Err(MultiplexerError::NotRegistered(fd)),
                _ => Err(MultiplexerError::RegistrationFailed { fd, source }),
            };
        }
        trace!(fd, "Unregistered descriptor");
        Ok(())
    }

    /// Watches `handle` for writability exactly while it has pending output.
    ///
    /// Call after anything that may queue or flush output on the connection.
    /// The kernel is only asked to change the interest set when the wanted
    /// state differs from the current one.
    pub fn sync_write_interest(&self, handle: &ConnectionHandle) {
        let mut watching = handle.write_interest();
        if handle.is_closed() {
            *watching = false;
            return;
        }
        let wanted = handle.has_pending_output();
        if *watching == wanted {
            return;
        }
        match self.modify_interest(handle.fd(), wanted) {
            Ok(()) => {
                *watching = wanted;
                trace!(fd = handle.fd(), writable = wanted, "Updated write interest");
            }
            // Expected for a connection that was unregistered meanwhile
            Err(e) => debug!(fd = handle.fd(), error = %e, "Failed to update write interest"),
        }
    }

    /// Blocks for up to `timeout` and returns the connections that are ready
    /// to read, or to flush when they asked for writability. At most `max_events` handles are returned per call.
    ///
    /// An interrupted wait returns an empty list.
    pub fn wait(
        &self,
        timeout: Duration,
        max_events: usize,
    ) -> Result<Vec<Arc<ConnectionHandle>>, MultiplexerError> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(MultiplexerError::WaitFailed(err));
        }

        let ready = events[..n as usize]
            .iter()
            .filter_map(|event| {
                let fd = event.u64 as RawFd;
                let handle = self.registry.get(fd);
                if handle.is_none() {
                    trace!(fd, "Dropping readiness for unknown descriptor");
                }
                handle
            })
            .collect();
        Ok(ready)
    }

    pub fn connection(&self, fd: RawFd) -> Option<Arc<ConnectionHandle>> {
        self.registry.get(fd)
    }

    pub fn connections_in(&self, room: &RoomId) -> Vec<Arc<ConnectionHandle>> {
        self.registry.in_room(room)
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.registry.handles()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn modify_interest(&self, fd: RawFd, writable: bool) -> io::Result<()> {
        let events = if writable { READ_INTEREST | WRITE_INTEREST } else { READ_INTEREST };
        let mut event = libc::epoll_event { events, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn add_interest(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: READ_INTEREST,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::LineConnection;
    use crate::connection::Connection;
    use crate::error::ConnectionError;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SHORT: Duration = Duration::from_millis(50);

    fn line_handle() -> (Arc<ConnectionHandle>, UnixStream) {
        let (conn, peer) = LineConnection::pair();
        let handle = Arc::new(ConnectionHandle::new(
            Box::new(conn),
            RoomId::parse("lobby").unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        ));
        (handle, peer)
    }

    #[test]
    fn test_wait_reports_readable_connection() {
        let mux = Multiplexer::new().unwrap();
        let (handle, mut peer) = line_handle();
        mux.register(Arc::clone(&handle)).unwrap();

        assert!(mux.wait(SHORT, 16).unwrap().is_empty());

        peer.write_all(b"{}\n").unwrap();
        let ready = mux.wait(SHORT, 16).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &handle));

        // Level-triggered: still ready until drained.
        assert_eq!(mux.wait(SHORT, 16).unwrap().len(), 1);
        assert_eq!(handle.read_message().unwrap(), Some(b"{}".to_vec()));
        assert!(handle.read_message().unwrap().is_none());
        assert!(mux.wait(SHORT, 16).unwrap().is_empty());
    }

    #[test]
    fn test_peer_close_is_reported_as_ready() {
        let mux = Multiplexer::new().unwrap();
        let (handle, peer) = line_handle();
        mux.register(Arc::clone(&handle)).unwrap();

        drop(peer);
        let ready = mux.wait(SHORT, 16).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(matches!(ready[0].read_message(), Err(ConnectionError::Closed)));

        mux.unregister(&handle).unwrap();
        assert!(mux.wait(SHORT, 16).unwrap().is_empty());
    }

    #[test]
    fn test_double_unregister_is_reported() {
        let mux = Multiplexer::new().unwrap();
        let (handle, _peer) = line_handle();
        let fd = handle.fd();

        assert!(matches!(mux.unregister(&handle), Err(MultiplexerError::NotRegistered(f)) if f == fd));

        mux.register(Arc::clone(&handle)).unwrap();
        assert_eq!(mux.len(), 1);
        mux.unregister(&handle).unwrap();
        assert!(matches!(mux.unregister(&handle), Err(MultiplexerError::NotRegistered(_))));
        assert!(mux.is_empty());
    }

    #[test]
    fn test_duplicate_register_fails() {
        let mux = Multiplexer::new().unwrap();
        let (handle, _peer) = line_handle();
        mux.register(Arc::clone(&handle)).unwrap();

        let err = mux.register(Arc::clone(&handle)).unwrap_err();
        assert!(matches!(err, MultiplexerError::RegistrationFailed { .. }));
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn test_unknown_descriptor_is_dropped() {
        let mux = Multiplexer::new().unwrap();
        let (handle, mut peer) = line_handle();

        mux.add_interest(handle.fd()).unwrap();
        peer.write_all(b"ping\n").unwrap();

        assert!(mux.wait(SHORT, 16).unwrap().is_empty());
    }

    /// Connection whose pending output is toggled by the test.
    struct Backlogged {
        stream: UnixStream,
        pending: Arc<AtomicBool>,
    }

    impl Connection for Backlogged {
        fn native_descriptor(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn read_message(&self) -> Result<Option<Vec<u8>>, ConnectionError> {
            Ok(None)
        }

        fn send_text(&self, _text: &str) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn has_pending_output(&self) -> bool {
            self.pending.load(Ordering::Acquire)
        }

        fn close(&self) {}
    }

    #[test]
    fn test_write_interest_follows_pending_output() {
        let mux = Multiplexer::new().unwrap();
        let (stream, _peer) = UnixStream::pair().unwrap();
        let pending = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(ConnectionHandle::new(
            Box::new(Backlogged { stream, pending: Arc::clone(&pending) }),
            RoomId::parse("lobby").unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        ));
        mux.register(Arc::clone(&handle)).unwrap();

        // Writable, but nobody asked
        assert!(mux.wait(SHORT, 16).unwrap().is_empty());

        pending.store(true, Ordering::Release);
        mux.sync_write_interest(&handle);
        assert!(*handle.write_interest());
        let ready = mux.wait(SHORT, 16).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &handle));

        pending.store(false, Ordering::Release);
        mux.sync_write_interest(&handle);
        assert!(!*handle.write_interest());
        assert!(mux.wait(SHORT, 16).unwrap().is_empty());

        pending.store(true, Ordering::Release);
        handle.close();
        mux.sync_write_interest(&handle);
        assert!(!*handle.write_interest());
    }

    #[test]
    fn test_wait_caps_event_count() {
        let mux = Multiplexer::new().unwrap();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (handle, mut peer) = line_handle();
            mux.register(handle).unwrap();
            peer.write_all(b"x\n").unwrap();
            peers.push(peer);
        }

        assert_eq!(mux.wait(SHORT, 2).unwrap().len(), 2);
        assert_eq!(mux.wait(SHORT, 16).unwrap().len(), 3);
    }
}
