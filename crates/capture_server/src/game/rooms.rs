//! Room naming and the table of live instances.

use super::{GameInstance, InstanceEvents, InstanceStatus, RoomSettings};
use crate::error::GameError;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

const MAX_ROOM_ID_LEN: usize = 32;

/// Validated room name: 1 to 32 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(value: &str) -> Result<Self, GameError> {
        let valid = !value.is_empty()
            && value.len() <= MAX_ROOM_ID_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(GameError::InvalidRoom(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Introspection row for one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub room: RoomId,
    pub status: InstanceStatus,
    pub capacity: usize,
    pub joined_players: usize,
    pub active_players: usize,
    pub connected: usize,
    pub expires_in_secs: u64,
}

/// Concurrent map from room name to its game instance.
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<GameInstance>>,
    update_buffer: usize,
}

impl RoomManager {
    pub fn new(update_buffer: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            update_buffer,
        }
    }

    pub fn get(&self, room: &RoomId) -> Result<Arc<GameInstance>, GameError> {
        self.rooms
            .get(room)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GameError::UnknownInstance(room.to_string()))
    }

    /// Returns the room's live instance, creating one when the name is free or
    /// the previous instance has expired, or finished with its last broadcast
    /// sent.
    ///
    /// Event receivers are returned only for a freshly created instance; the
    /// caller is expected to hand them to a broadcaster.
    pub fn get_or_create(
        &self,
        room: &RoomId,
        settings: RoomSettings,
    ) -> (Arc<GameInstance>, Option<InstanceEvents>) {
        let now = SystemTime::now();
        match self.rooms.entry(room.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_sweepable_at(now) {
                    return (Arc::clone(entry.get()), None);
                }
                let (instance, events) = self.create(room, settings);
                entry.insert(Arc::clone(&instance));
                info!(room = %room, "Replaced finished room");
                (instance, Some(events))
            }
            Entry::Vacant(entry) => {
                let (instance, events) = self.create(room, settings);
                entry.insert(Arc::clone(&instance));
                info!(room = %room, capacity = instance.capacity(), "Created room");
                (instance, Some(events))
            }
        }
    }

    /// Rooms that [`RoomManager::remove_if_sweepable`] would drop at `now`.
    pub fn sweep_candidates(&self, now: SystemTime) -> Vec<RoomId> {
        let mut candidates: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_sweepable_at(now))
            .map(|entry| entry.key().clone())
            .collect();
        candidates.sort();
        if !candidates.is_empty() {
            debug!(count = candidates.len(), "Rooms ready to sweep");
        }
        candidates
    }

    /// Drops `room` if it is still sweepable at `now`.
    ///
    /// The check and the removal happen under the same shard lock, so a room
    /// replaced by [`RoomManager::get_or_create`] in between is left alone.
    pub fn remove_if_sweepable(&self, room: &RoomId, now: SystemTime) -> Option<Arc<GameInstance>> {
        self.rooms
            .remove_if(room, |_, instance| instance.is_sweepable_at(now))
            .map(|(_, instance)| instance)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        let now = SystemTime::now();
        let mut summaries: Vec<RoomSummary> = self
            .rooms
            .iter()
            .map(|entry| {
                let instance = entry.value();
                RoomSummary {
                    room: entry.key().clone(),
                    status: instance.status_at(now),
                    capacity: instance.capacity(),
                    joined_players: instance.joined_player_count(),
                    active_players: instance.active_player_count(),
                    connected: instance.connected_descriptors().len(),
                    expires_in_secs: instance
                        .expires_on()
                        .duration_since(now)
                        .map(|left| left.as_secs())
                        .unwrap_or(0),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.room.cmp(&b.room));
        summaries
    }

    fn create(&self, room: &RoomId, settings: RoomSettings) -> (Arc<GameInstance>, InstanceEvents) {
        let (instance, events) = GameInstance::new(room.clone(), settings, self.update_buffer);
        (Arc::new(instance), events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Color, GridSize};
    use std::time::Duration;

    fn settings(ttl: Duration) -> RoomSettings {
        RoomSettings::new(2, GridSize::Small, ttl)
    }

    #[test]
    fn test_room_id_validation() {
        assert!(RoomId::parse("lobby-1_A").is_ok());
        assert_eq!(RoomId::parse(""), Err(GameError::InvalidRoom(String::new())));
        assert!(RoomId::parse("has space").is_err());
        assert!(RoomId::parse(&"x".repeat(33)).is_err());
        assert!(RoomId::parse(&"x".repeat(32)).is_ok());
    }

    #[test]
    fn test_get_or_create_reuses_live_room() {
        let manager = RoomManager::new(8);
        let id = RoomId::parse("lobby").unwrap();

        assert_eq!(
            manager.get(&id).err(),
            Some(GameError::UnknownInstance("lobby".to_string()))
        );

        let (first, events) = manager.get_or_create(&id, settings(Duration::from_secs(60)));
        assert!(events.is_some());
        let (second, events) = manager.get_or_create(&id, settings(Duration::from_secs(60)));
        assert!(events.is_none());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &manager.get(&id).unwrap()));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_finished_room_is_replaced() {
        let manager = RoomManager::new(8);
        let id = RoomId::parse("lobby").unwrap();

        let (first, events) = manager.get_or_create(&id, settings(Duration::from_secs(60)));
        let mut events = events.unwrap();
        first.join("alice", Color::Red).unwrap();
        let alice = first.player("alice").unwrap();
        first.set_winner(alice);

        // Still owes the join broadcast
        let (same, none) = manager.get_or_create(&id, settings(Duration::from_secs(60)));
        assert!(none.is_none());
        assert!(Arc::ptr_eq(&first, &same));

        while events.updates.try_recv().is_ok() {
            first.event_delivered();
        }
        let (second, events) = manager.get_or_create(&id, settings(Duration::from_secs(60)));
        assert!(events.is_some());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.joined_player_count(), 0);
    }

    #[test]
    fn test_sweep_removes_expired_rooms() {
        let manager = RoomManager::new(8);
        let stale = RoomId::parse("stale").unwrap();
        let fresh = RoomId::parse("fresh").unwrap();
        manager.get_or_create(&stale, settings(Duration::ZERO));
        manager.get_or_create(&fresh, settings(Duration::from_secs(600)));

        let now = SystemTime::now();
        assert_eq!(manager.sweep_candidates(now), vec![stale.clone()]);
        assert!(manager.remove_if_sweepable(&fresh, now).is_none());
        assert!(manager.remove_if_sweepable(&stale, now).is_some());
        assert!(manager.remove_if_sweepable(&stale, now).is_none());
        assert!(manager.get(&stale).is_err());
        assert!(manager.get(&fresh).is_ok());

        let summaries = manager.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].room, fresh);
        assert_eq!(summaries[0].status, InstanceStatus::Filling);
    }

    #[test]
    fn test_replaced_room_is_not_swept() {
        let manager = RoomManager::new(8);
        let id = RoomId::parse("lobby").unwrap();
        manager.get_or_create(&id, settings(Duration::ZERO));

        let later = SystemTime::now() + Duration::from_secs(1);
        assert_eq!(manager.sweep_candidates(later), vec![id.clone()]);

        let (replacement, events) = manager.get_or_create(&id, settings(Duration::from_secs(600)));
        assert!(events.is_some());
        assert!(manager.remove_if_sweepable(&id, later).is_none());
        assert!(Arc::ptr_eq(&replacement, &manager.get(&id).unwrap()));
    }
}
