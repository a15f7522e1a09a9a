//! A single room's live game session.
//!
//! Every mutable field group sits behind its own lock so that cheap reads
//! (active player count, winner) never wait on a move being applied. The board
//! and the turn index share one mutex that is held for the whole of
//! [`GameInstance::apply_move`], which serializes moves per instance.
//!
//! Lock order, outermost first: `play`, `roster`, `joined_players`,
//! `active_players`, `winner`, `all_played_once`. Channel sends happen only
//! after every lock has been released.

use super::{Board, Color, GridSize, Player, PlayerSummary, Position, RoomId, MAX_PLAYERS, MIN_PLAYERS};
use crate::error::GameError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Default lifetime of a room.
pub const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(25 * 60);

/// Longest lifetime a room may be given.
pub const MAX_ROOM_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const MAX_USERNAME_LEN: usize = 32;

/// Parameters fixed when a room is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSettings {
    pub capacity: usize,
    pub rows: usize,
    pub cols: usize,
    pub ttl: Duration,
}

impl RoomSettings {
    pub fn new(capacity: usize, grid: GridSize, ttl: Duration) -> Self {
        let (rows, cols) = grid.dimensions();
        Self {
            capacity,
            rows,
            cols,
            ttl,
        }
    }

    pub fn with_dimensions(mut self, rows: usize, cols: usize) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self::new(MIN_PLAYERS, GridSize::Small, DEFAULT_ROOM_TTL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Filling,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    PlayerJoined,
    MoveApplied,
    PlayerLeft,
}

/// Consistent copy of an instance's state at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub room: RoomId,
    pub status: InstanceStatus,
    pub board: Board,
    pub players: Vec<PlayerSummary>,
    pub current_turn: usize,
    pub joined_players: usize,
    pub active_players: usize,
    pub winner: Option<PlayerSummary>,
    pub all_played_once: bool,
}

#[derive(Debug, Clone)]
pub struct BoardUpdate {
    pub reason: UpdateReason,
    pub snapshot: InstanceSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefeatNotice {
    pub room: RoomId,
    pub player: PlayerSummary,
}

/// Receiving ends of an instance's notification channels.
#[derive(Debug)]
pub struct InstanceEvents {
    pub defeated: mpsc::Receiver<DefeatNotice>,
    pub updates: mpsc::Receiver<BoardUpdate>,
}

/// Result of a successful move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub mover: PlayerSummary,
    pub position: Position,
    pub explosions: usize,
    pub defeated: Vec<PlayerSummary>,
    pub next_turn: Option<PlayerSummary>,
    pub winner: Option<PlayerSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnResolution {
    Next(usize),
    Winner(usize),
}

struct PlayState {
    board: Board,
    current_turn: usize,
}

pub struct GameInstance {
    room: RoomId,
    capacity: usize,
    created_on: SystemTime,
    expires_on: SystemTime,

    play: Mutex<PlayState>,
    roster: RwLock<Vec<Player>>,
    joined_players: Mutex<usize>,
    active_players: Mutex<usize>,
    winner: Mutex<Option<PlayerSummary>>,
    all_played_once: Mutex<bool>,

    defeated_tx: mpsc::Sender<DefeatNotice>,
    updates_tx: mpsc::Sender<BoardUpdate>,
    /// Notices queued on either channel and not yet fanned out.
    undelivered: AtomicUsize,
}

impl GameInstance {
    /// Creates an empty instance and the receivers for its notifications.
    ///
    /// The defeat channel holds one slot per seat, which is more than the
    /// number of defeats a single game can produce.
    pub fn new(room: RoomId, settings: RoomSettings, update_buffer: usize) -> (Self, InstanceEvents) {
        let capacity = settings.capacity.clamp(MIN_PLAYERS, MAX_PLAYERS);
        let (defeated_tx, defeated) = mpsc::channel(capacity);
        let (updates_tx, updates) = mpsc::channel(update_buffer.max(1));
        let created_on = SystemTime::now();

        let instance = Self {
            room,
            capacity,
            created_on,
            expires_on: created_on + settings.ttl.min(MAX_ROOM_TTL),
            play: Mutex::new(PlayState {
                board: Board::new(settings.rows, settings.cols),
                current_turn: 0,
            }),
            roster: RwLock::new(Vec::with_capacity(capacity)),
            joined_players: Mutex::new(0),
            active_players: Mutex::new(0),
            winner: Mutex::new(None),
            all_played_once: Mutex::new(false),
            defeated_tx,
            updates_tx,
            undelivered: AtomicUsize::new(0),
        };

        (instance, InstanceEvents { defeated, updates })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn created_on(&self) -> SystemTime {
        self.created_on
    }

    pub fn expires_on(&self) -> SystemTime {
        self.expires_on
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_on
    }

    /// Whether the room may be dropped at `now`: it expired, or it finished
    /// and its broadcaster has sent everything the game produced.
    pub fn is_sweepable_at(&self, now: SystemTime) -> bool {
        self.is_expired_at(now) || (self.winner().is_some() && !self.has_undelivered_events())
    }

    pub fn has_undelivered_events(&self) -> bool {
        self.undelivered.load(Ordering::Acquire) > 0
    }

    /// Called by the broadcaster once a received notice has been sent out.
    pub(crate) fn event_delivered(&self) {
        let _ = self
            .undelivered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn status(&self) -> InstanceStatus {
        self.status_at(SystemTime::now())
    }

    pub fn status_at(&self, now: SystemTime) -> InstanceStatus {
        let joined = self.joined_player_count();
        let finished = self.winner().is_some();
        self.derive_status(joined, finished, now)
    }

    pub fn joined_player_count(&self) -> usize {
        *self.joined_players.lock()
    }

    pub fn active_player_count(&self) -> usize {
        *self.active_players.lock()
    }

    pub fn all_played_once(&self) -> bool {
        *self.all_played_once.lock()
    }

    pub fn winner(&self) -> Option<PlayerSummary> {
        self.winner.lock().clone()
    }

    /// Records the winner. Returns `false` if one was already set.
    pub fn set_winner(&self, player: PlayerSummary) -> bool {
        let mut winner = self.winner.lock();
        if winner.is_some() {
            return false;
        }
        info!(room = %self.room, username = %player.username, "Winner decided");
        *winner = Some(player);
        true
    }

    pub fn current_turn(&self) -> usize {
        self.play.lock().current_turn
    }

    pub fn player(&self, username: &str) -> Option<PlayerSummary> {
        let roster = self.roster.read();
        roster
            .iter()
            .enumerate()
            .find(|(_, player)| player.username == username)
            .map(|(seat, player)| player.summary(seat))
    }

    pub fn players(&self) -> Vec<PlayerSummary> {
        let roster = self.roster.read();
        summarize(&roster)
    }

    /// Palette colors nobody in this room has picked yet.
    pub fn available_colors(&self) -> Vec<Color> {
        let roster = self.roster.read();
        Color::PALETTE
            .into_iter()
            .filter(|color| roster.iter().all(|player| player.color != *color))
            .collect()
    }

    pub fn board_dimensions(&self) -> (usize, usize) {
        let play = self.play.lock();
        (play.board.rows(), play.board.cols())
    }

    /// Seats a new player.
    pub fn join(&self, username: &str, color: Color) -> Result<PlayerSummary, GameError> {
        self.seat(username, color, None)
    }

    /// Seats a new player already associated with the socket at `fd`, so the
    /// join broadcast reaches them too.
    pub fn join_connected(&self, username: &str, color: Color, fd: RawFd) -> Result<PlayerSummary, GameError> {
        self.seat(username, color, Some(fd))
    }

    fn seat(&self, username: &str, color: Color, connection: Option<RawFd>) -> Result<PlayerSummary, GameError> {
        let username = username.trim();
        if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
            return Err(GameError::InvalidUsername);
        }
        if self.winner.lock().is_some() {
            return Err(GameError::GameFinished);
        }

        let summary = {
            let mut roster = self.roster.write();
            if let Some(seated) = connection.and_then(|fd| roster.iter().find(|player| player.connection == Some(fd))) {
                return Err(GameError::AlreadySeated(seated.username.clone()));
            }
            let mut joined = self.joined_players.lock();
            if *joined >= self.capacity {
                return Err(GameError::RoomFull);
            }
            if roster.iter().any(|player| player.username == username) {
                return Err(GameError::UsernameTaken(username.to_string()));
            }
            if roster.iter().any(|player| player.color == color) {
                return Err(GameError::ColorTaken(color));
            }

            let mut player = Player::new(username.to_string(), color);
            player.connection = connection;
            roster.push(player);
            let mut active = self.active_players.lock();
            *joined += 1;
            *active += 1;

            let seat = roster.len() - 1;
            roster[seat].summary(seat)
        };

        info!(
            room = %self.room,
            username = %summary.username,
            color = %summary.color,
            seat = summary.seat,
            "Player joined"
        );
        self.publish(UpdateReason::PlayerJoined);
        Ok(summary)
    }

    /// Applies `username`'s move on `pos` and advances the turn.
    ///
    /// Rejected moves leave the board, the roster and every counter untouched.
    pub fn apply_move(&self, username: &str, pos: Position) -> Result<MoveOutcome, GameError> {
        self.apply_move_as(username, pos, None)
    }

    /// Like [`GameInstance::apply_move`], but only when `username` is the
    /// player speaking from the socket at `fd`.
    pub fn apply_move_from(&self, fd: RawFd, username: &str, pos: Position) -> Result<MoveOutcome, GameError> {
        self.apply_move_as(username, pos, Some(fd))
    }

    fn apply_move_as(&self, username: &str, pos: Position, sender: Option<RawFd>) -> Result<MoveOutcome, GameError> {
        let mut play = self.play.lock();

        if self.winner.lock().is_some() {
            return Err(GameError::GameFinished);
        }
        if *self.joined_players.lock() < self.capacity {
            return Err(GameError::NotStarted);
        }

        let seat = play.current_turn;
        let color = {
            let roster = self.roster.read();
            let Some(named) = roster.iter().position(|player| player.username == username) else {
                return Err(GameError::UnknownPlayer(username.to_string()));
            };
            if sender.is_some() && roster[named].connection != sender {
                return Err(GameError::NotYourSeat(username.to_string()));
            }
            if named != seat {
                return Err(GameError::NotYourTurn(username.to_string()));
            }
            roster[named].color
        };

        let before = play.board.cell_counts();
        let placement = play.board.place(color, pos)?;
        let after = play.board.cell_counts();

        let mut roster = self.roster.write();
        let mut notices = Vec::new();
        for idx in 0..roster.len() {
            let player_color = roster[idx].color;
            let was = before.get(&player_color).copied().unwrap_or(0);
            let now = after.get(&player_color).copied().unwrap_or(0);
            if now > was {
                roster[idx].cell_count += now - was;
            } else if now < was {
                if let Some(notice) = self.dec_cell_count_locked(&mut roster, player_color, was - now)? {
                    notices.push(notice);
                }
            }
        }

        if seat + 1 == self.capacity {
            let mut latch = self.all_played_once.lock();
            if !*latch {
                debug!(room = %self.room, "Every player has moved once");
                *latch = true;
            }
        }

        // Counted before the winner is visible so the room cannot be swept
        // ahead of its final broadcast.
        self.reserve_events(notices.len() + 1);
        let all_played = *self.all_played_once.lock();
        let next_turn = match resolve_turn(&roster, seat, all_played) {
            TurnResolution::Winner(winner_seat) => {
                play.current_turn = winner_seat;
                self.set_winner(roster[winner_seat].summary(winner_seat));
                None
            }
            TurnResolution::Next(next_seat) => {
                play.current_turn = next_seat;
                Some(roster[next_seat].summary(next_seat))
            }
        };

        let outcome = MoveOutcome {
            mover: roster[seat].summary(seat),
            position: pos,
            explosions: placement.explosions,
            defeated: notices.iter().map(|notice| notice.player.clone()).collect(),
            next_turn,
            winner: self.winner(),
        };
        let snapshot = self.snapshot_locked(&play, &roster);
        drop(roster);
        drop(play);

        debug!(
            room = %self.room,
            username,
            row = pos.row,
            col = pos.col,
            explosions = outcome.explosions,
            "Move applied"
        );

        for notice in notices {
            self.notify_defeat(notice);
        }
        self.publish_snapshot(UpdateReason::MoveApplied, snapshot);

        Ok(outcome)
    }

    /// Adds `count` cells to the player holding `color`.
    pub fn inc_cell_count(&self, color: Color, count: usize) -> Result<(), GameError> {
        let mut roster = self.roster.write();
        let player = roster
            .iter_mut()
            .find(|player| player.color == color)
            .ok_or_else(|| GameError::UnknownPlayer(color.to_string()))?;
        player.cell_count += count;
        Ok(())
    }

    /// Removes `count` cells from the player holding `color`.
    ///
    /// Returns `true` only for the call that drives the count to zero; that
    /// call marks the player defeated, decrements the active count and emits a
    /// defeat notice. Later calls clamp at zero and do nothing else.
    pub fn dec_cell_count(&self, color: Color, count: usize) -> Result<bool, GameError> {
        let notice = {
            let mut roster = self.roster.write();
            self.dec_cell_count_locked(&mut roster, color, count)?
        };

        match notice {
            Some(notice) => {
                self.reserve_events(1);
                self.notify_defeat(notice);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clears the association of whichever player uses `fd`.
    ///
    /// Disconnecting does not defeat the player.
    pub fn detach_connection(&self, fd: RawFd) -> Option<String> {
        let username = {
            let mut roster = self.roster.write();
            let player = roster
                .iter_mut()
                .find(|player| player.connection == Some(fd))?;
            player.connection = None;
            player.username.clone()
        };

        info!(room = %self.room, username = %username, fd, "Player disconnected");
        self.publish(UpdateReason::PlayerLeft);
        Some(username)
    }

    pub fn connected_descriptors(&self) -> Vec<RawFd> {
        let roster = self.roster.read();
        roster.iter().filter_map(|player| player.connection).collect()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let play = self.play.lock();
        let roster = self.roster.read();
        self.snapshot_locked(&play, &roster)
    }

    fn dec_cell_count_locked(
        &self,
        roster: &mut [Player],
        color: Color,
        count: usize,
    ) -> Result<Option<DefeatNotice>, GameError> {
        let (seat, player) = roster
            .iter_mut()
            .enumerate()
            .find(|(_, player)| player.color == color)
            .ok_or_else(|| GameError::UnknownPlayer(color.to_string()))?;

        let before = player.cell_count;
        player.cell_count = before.saturating_sub(count);
        if before == 0 || player.cell_count > 0 || player.defeated {
            return Ok(None);
        }

        player.defeated = true;
        {
            let mut active = self.active_players.lock();
            *active = active.saturating_sub(1);
        }
        info!(room = %self.room, username = %player.username, "Player defeated");

        Ok(Some(DefeatNotice {
            room: self.room.clone(),
            player: player.summary(seat),
        }))
    }

    fn snapshot_locked(&self, play: &PlayState, roster: &[Player]) -> InstanceSnapshot {
        let joined_players = *self.joined_players.lock();
        let active_players = *self.active_players.lock();
        let winner = self.winner.lock().clone();
        let all_played_once = *self.all_played_once.lock();

        InstanceSnapshot {
            room: self.room.clone(),
            status: self.derive_status(joined_players, winner.is_some(), SystemTime::now()),
            board: play.board.clone(),
            players: summarize(roster),
            current_turn: play.current_turn,
            joined_players,
            active_players,
            winner,
            all_played_once,
        }
    }

    fn derive_status(&self, joined: usize, finished: bool, now: SystemTime) -> InstanceStatus {
        if finished || self.is_expired_at(now) {
            InstanceStatus::Finished
        } else if joined < self.capacity {
            InstanceStatus::Filling
        } else {
            InstanceStatus::InProgress
        }
    }

    fn publish(&self, reason: UpdateReason) {
        let snapshot = self.snapshot();
        self.reserve_events(1);
        self.publish_snapshot(reason, snapshot);
    }

    fn reserve_events(&self, count: usize) {
        self.undelivered.fetch_add(count, Ordering::AcqRel);
    }

    /// Each send consumes one slot taken with `reserve_events`.
    fn publish_snapshot(&self, reason: UpdateReason, snapshot: InstanceSnapshot) {
        match self.updates_tx.try_send(BoardUpdate { reason, snapshot }) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => {
                warn!(room = %self.room, ?reason, "Update buffer full, dropping update");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(room = %self.room, "No broadcaster attached");
            }
        }
        self.event_delivered();
    }

    fn notify_defeat(&self, notice: DefeatNotice) {
        match self.defeated_tx.try_send(notice) {
            Ok(()) => return,
            Err(TrySendError::Full(notice)) => {
                warn!(room = %self.room, username = %notice.player.username, "Defeat channel full");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(room = %self.room, "No broadcaster attached");
            }
        }
        self.event_delivered();
    }
}

fn summarize(roster: &[Player]) -> Vec<PlayerSummary> {
    roster
        .iter()
        .enumerate()
        .map(|(seat, player)| player.summary(seat))
        .collect()
}

/// Picks the next seat after `mover`, or the winner once the game is decided.
///
/// When nobody is left standing the mover wins: the last player to act takes
/// the tie.
fn resolve_turn(roster: &[Player], mover: usize, all_played_once: bool) -> TurnResolution {
    let standing: Vec<usize> = roster
        .iter()
        .enumerate()
        .filter(|(_, player)| !player.defeated)
        .map(|(seat, _)| seat)
        .collect();

    match standing.as_slice() {
        [] => TurnResolution::Winner(mover),
        [only] if all_played_once => TurnResolution::Winner(*only),
        _ => {
            let len = roster.len();
            let next = (1..=len)
                .map(|step| (mover + step) % len)
                .find(|seat| !roster[*seat].defeated)
                .unwrap_or(mover);
            TurnResolution::Next(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(capacity: usize) -> (GameInstance, InstanceEvents) {
        let settings = RoomSettings::new(capacity, GridSize::Small, DEFAULT_ROOM_TTL);
        GameInstance::new(RoomId::parse("test").unwrap(), settings, 64)
    }

    fn seated(usernames: &[(&str, Color)]) -> (GameInstance, InstanceEvents) {
        let (instance, events) = room(usernames.len());
        for (username, color) in usernames {
            instance.join(username, *color).unwrap();
        }
        (instance, events)
    }

    #[test]
    fn test_join_counts_and_room_full() {
        let (instance, _events) = room(3);
        instance.join("alice", Color::Red).unwrap();
        instance.join("bob", Color::Green).unwrap();
        assert_eq!(instance.joined_player_count(), 2);
        assert_eq!(instance.status(), InstanceStatus::Filling);

        instance.join("carol", Color::Blue).unwrap();
        assert_eq!(instance.joined_player_count(), 3);
        assert_eq!(instance.active_player_count(), 3);
        assert_eq!(instance.status(), InstanceStatus::InProgress);

        let before = instance.snapshot();
        assert_eq!(instance.join("dave", Color::Yellow), Err(GameError::RoomFull));
        assert_eq!(instance.snapshot(), before);
    }

    #[test]
    fn test_join_rejects_collisions() {
        let (instance, _events) = room(4);
        instance.join("alice", Color::Red).unwrap();

        assert_eq!(
            instance.join("alice", Color::Green),
            Err(GameError::UsernameTaken("alice".to_string()))
        );
        assert_eq!(instance.join("bob", Color::Red), Err(GameError::ColorTaken(Color::Red)));
        assert_eq!(instance.join("   ", Color::Blue), Err(GameError::InvalidUsername));
        assert_eq!(instance.joined_player_count(), 1);
        assert!(!instance.available_colors().contains(&Color::Red));
        assert_eq!(instance.available_colors().len(), 7);
    }

    #[test]
    fn test_concurrent_joins_never_share_a_color() {
        let (instance, _events) = room(MAX_PLAYERS);

        let successes: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..MAX_PLAYERS)
                .map(|i| {
                    let instance = &instance;
                    scope.spawn(move || instance.join(&format!("player{i}"), Color::Red).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| usize::from(handle.join().unwrap()))
                .sum()
        });

        assert_eq!(successes, 1);
        assert_eq!(instance.joined_player_count(), 1);
        assert_eq!(instance.players().len(), 1);
    }

    #[test]
    fn test_moves_rejected_while_filling() {
        let (instance, _events) = room(3);
        instance.join("alice", Color::Red).unwrap();
        assert_eq!(
            instance.apply_move("alice", Position::new(2, 2)),
            Err(GameError::NotStarted)
        );
    }

    #[test]
    fn test_out_of_turn_move_has_no_side_effects() {
        let (instance, _events) = seated(&[("alice", Color::Red), ("bob", Color::Green)]);
        let before = instance.snapshot();

        assert_eq!(
            instance.apply_move("bob", Position::new(1, 1)),
            Err(GameError::NotYourTurn("bob".to_string()))
        );
        assert_eq!(instance.snapshot(), before);

        assert_eq!(
            instance.apply_move("mallory", Position::new(1, 1)),
            Err(GameError::UnknownPlayer("mallory".to_string()))
        );
        assert_eq!(instance.snapshot(), before);
    }

    #[test]
    fn test_full_rotation_returns_to_first_seat() {
        let (instance, _events) = seated(&[
            ("alice", Color::Red),
            ("bob", Color::Green),
            ("carol", Color::Blue),
        ]);
        assert_eq!(instance.current_turn(), 0);

        instance.apply_move("alice", Position::new(2, 2)).unwrap();
        assert_eq!(instance.current_turn(), 1);
        assert!(!instance.all_played_once());

        instance.apply_move("bob", Position::new(2, 5)).unwrap();
        assert_eq!(instance.current_turn(), 2);
        assert!(!instance.all_played_once());

        let outcome = instance.apply_move("carol", Position::new(3, 7)).unwrap();
        assert_eq!(instance.current_turn(), 0);
        assert!(instance.all_played_once());
        assert_eq!(outcome.next_turn.map(|p| p.username), Some("alice".to_string()));
        assert_eq!(outcome.winner, None);

        let players = instance.players();
        assert!(players.iter().all(|player| player.cell_count == 1));
    }

    #[test]
    fn test_turn_skips_defeated_players() {
        let (instance, _events) = seated(&[
            ("alice", Color::Red),
            ("bob", Color::Green),
            ("carol", Color::Blue),
        ]);
        instance.apply_move("alice", Position::new(2, 2)).unwrap();
        instance.apply_move("bob", Position::new(2, 5)).unwrap();
        instance.apply_move("carol", Position::new(3, 7)).unwrap();

        assert_eq!(instance.dec_cell_count(Color::Green, 1), Ok(true));
        assert_eq!(instance.active_player_count(), 2);

        instance.apply_move("alice", Position::new(4, 4)).unwrap();
        assert_eq!(instance.current_turn(), 2);
        assert!(!instance.players()[instance.current_turn()].defeated);
    }

    #[test]
    fn test_dec_cell_count_defeats_once() {
        let (instance, mut events) = seated(&[("alice", Color::Red), ("bob", Color::Green)]);
        instance.inc_cell_count(Color::Green, 2).unwrap();

        assert_eq!(instance.dec_cell_count(Color::Green, 1), Ok(false));
        assert_eq!(instance.dec_cell_count(Color::Green, 1), Ok(true));
        assert_eq!(instance.active_player_count(), 1);

        assert_eq!(instance.dec_cell_count(Color::Green, 1), Ok(false));
        assert_eq!(instance.dec_cell_count(Color::Green, 5), Ok(false));
        assert_eq!(instance.active_player_count(), 1);
        assert_eq!(instance.player("bob").unwrap().cell_count, 0);
        assert!(instance.player("bob").unwrap().defeated);

        let notice = events.defeated.try_recv().unwrap();
        assert_eq!(notice.player.username, "bob");
        assert!(events.defeated.try_recv().is_err());

        assert_eq!(
            instance.dec_cell_count(Color::Blue, 1),
            Err(GameError::UnknownPlayer("#0000FF".to_string()))
        );
    }

    #[test]
    fn test_capture_defeats_opponent_and_decides_winner() {
        let settings = RoomSettings::default().with_dimensions(2, 3);
        let (instance, mut events) = GameInstance::new(RoomId::parse("duel").unwrap(), settings, 64);
        instance.join("alice", Color::Red).unwrap();
        instance.join("bob", Color::Green).unwrap();

        let opening = [
            ("alice", 0, 0),
            ("bob", 0, 1),
            ("alice", 0, 2),
            ("bob", 1, 0),
            ("alice", 0, 2),
            ("bob", 1, 0),
        ];
        for (username, row, col) in opening {
            instance.apply_move(username, Position::new(row, col)).unwrap();
        }
        assert_eq!(instance.player("bob").unwrap().cell_count, 4);
        assert_eq!(instance.player("alice").unwrap().cell_count, 1);
        assert_eq!(instance.active_player_count(), 2);

        let outcome = instance.apply_move("alice", Position::new(1, 2)).unwrap();

        assert_eq!(outcome.defeated.len(), 1);
        assert_eq!(outcome.defeated[0].username, "bob");
        assert_eq!(outcome.winner.as_ref().map(|p| p.username.as_str()), Some("alice"));
        assert_eq!(outcome.next_turn, None);

        let bob = instance.player("bob").unwrap();
        assert!(bob.defeated);
        assert_eq!(bob.cell_count, 0);
        assert_eq!(instance.player("alice").unwrap().cell_count, 4);
        assert_eq!(instance.active_player_count(), 1);
        assert_eq!(instance.status(), InstanceStatus::Finished);
        assert_eq!(instance.current_turn(), 0);

        let notice = events.defeated.try_recv().unwrap();
        assert_eq!(notice.player.color, Color::Green);

        assert_eq!(
            instance.apply_move("alice", Position::new(0, 0)),
            Err(GameError::GameFinished)
        );
    }

    #[test]
    fn test_winner_is_set_once() {
        let (instance, _events) = seated(&[("alice", Color::Red), ("bob", Color::Green)]);
        let alice = instance.player("alice").unwrap();
        let bob = instance.player("bob").unwrap();

        assert!(instance.set_winner(alice.clone()));
        assert!(!instance.set_winner(bob));
        assert_eq!(instance.winner(), Some(alice));
    }

    #[test]
    fn test_simultaneous_elimination_goes_to_mover() {
        let mut roster = vec![
            Player::new("alice".to_string(), Color::Red),
            Player::new("bob".to_string(), Color::Green),
        ];
        roster.iter_mut().for_each(|player| player.defeated = true);

        assert_eq!(resolve_turn(&roster, 1, true), TurnResolution::Winner(1));
    }

    #[test]
    fn test_resolve_turn_wraps_around() {
        let mut roster = vec![
            Player::new("alice".to_string(), Color::Red),
            Player::new("bob".to_string(), Color::Green),
            Player::new("carol".to_string(), Color::Blue),
        ];
        roster[0].defeated = true;

        assert_eq!(resolve_turn(&roster, 2, true), TurnResolution::Next(1));
        assert_eq!(resolve_turn(&roster, 1, false), TurnResolution::Next(2));
    }

    #[test]
    fn test_connection_association() {
        let (instance, mut events) = room(2);
        instance.join_connected("alice", Color::Red, 11).unwrap();
        instance.join_connected("bob", Color::Green, 12).unwrap();
        assert_eq!(instance.connected_descriptors(), vec![11, 12]);

        while events.updates.try_recv().is_ok() {}

        assert_eq!(instance.detach_connection(11), Some("alice".to_string()));
        assert_eq!(instance.detach_connection(11), None);
        assert_eq!(instance.connected_descriptors(), vec![12]);
        assert!(!instance.player("alice").unwrap().defeated);

        let update = events.updates.try_recv().unwrap();
        assert_eq!(update.reason, UpdateReason::PlayerLeft);
    }

    #[test]
    fn test_one_seat_per_connection() {
        let (instance, _events) = room(3);
        instance.join_connected("alice", Color::Red, 11).unwrap();

        assert_eq!(
            instance.join_connected("alice2", Color::Green, 11),
            Err(GameError::AlreadySeated("alice".to_string()))
        );
        assert_eq!(instance.joined_player_count(), 1);
        instance.join_connected("bob", Color::Green, 12).unwrap();
    }

    #[test]
    fn test_move_only_from_own_connection() {
        let (instance, _events) = room(2);
        instance.join_connected("alice", Color::Red, 11).unwrap();
        instance.join_connected("bob", Color::Green, 12).unwrap();
        let before = instance.snapshot();

        assert_eq!(
            instance.apply_move_from(12, "alice", Position::new(1, 1)),
            Err(GameError::NotYourSeat("alice".to_string()))
        );
        assert_eq!(
            instance.apply_move_from(12, "bob", Position::new(1, 1)),
            Err(GameError::NotYourTurn("bob".to_string()))
        );
        assert_eq!(instance.snapshot(), before);

        instance.apply_move_from(11, "alice", Position::new(1, 1)).unwrap();
        assert_eq!(instance.current_turn(), 1);

        instance.detach_connection(12);
        assert_eq!(
            instance.apply_move_from(12, "bob", Position::new(2, 2)),
            Err(GameError::NotYourSeat("bob".to_string()))
        );
    }

    #[test]
    fn test_finished_room_waits_for_broadcast() {
        let (instance, mut events) = seated(&[("alice", Color::Red), ("bob", Color::Green)]);
        let now = SystemTime::now();
        assert!(instance.has_undelivered_events());

        instance.set_winner(instance.player("alice").unwrap());
        assert!(!instance.is_sweepable_at(now));

        while events.updates.try_recv().is_ok() {
            instance.event_delivered();
        }
        assert!(!instance.has_undelivered_events());
        assert!(instance.is_sweepable_at(now));
    }

    #[test]
    fn test_undelivered_count_ignores_closed_channels() {
        let (instance, events) = room(2);
        drop(events);
        instance.join("alice", Color::Red).unwrap();
        assert!(!instance.has_undelivered_events());
    }

    #[test]
    fn test_huge_ttl_is_capped() {
        let settings = RoomSettings::new(2, GridSize::Small, Duration::MAX);
        let (instance, _events) = GameInstance::new(RoomId::parse("forever").unwrap(), settings, 8);
        assert_eq!(
            instance.expires_on().duration_since(instance.created_on()).unwrap(),
            MAX_ROOM_TTL
        );
        assert!(!instance.is_sweepable_at(SystemTime::now()));
    }

    #[test]
    fn test_expiry_finishes_instance() {
        let settings = RoomSettings::new(2, GridSize::Small, Duration::ZERO);
        let (instance, _events) = GameInstance::new(RoomId::parse("stale").unwrap(), settings, 8);
        assert!(instance.is_expired_at(SystemTime::now()));
        assert_eq!(instance.status(), InstanceStatus::Finished);
    }
}
