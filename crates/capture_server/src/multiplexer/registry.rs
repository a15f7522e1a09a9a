//! Descriptor-keyed table of live connections.

use crate::connection::ConnectionHandle;
use crate::game::RoomId;
use dashmap::DashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Maps native descriptors to the handles the multiplexer reports as ready.
///
/// Removal is identity-checked so that a stale handle can never evict a newer
/// connection that happens to reuse the same descriptor number.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<RawFd, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `handle`, returning whatever was stored under its descriptor.
    pub fn insert(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        self.connections.insert(handle.fd(), handle)
    }

    /// Removes `handle` if it is the one stored under its descriptor.
    pub fn remove(&self, handle: &Arc<ConnectionHandle>) -> bool {
        self.connections
            .remove_if(&handle.fd(), |_, stored| Arc::ptr_eq(stored, handle))
            .is_some()
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&fd).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn in_room(&self, room: &RoomId) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().room() == room)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
