//! Per-room fan-out of state updates and defeat notices.
//!
//! Each room gets one task that drains its instance's channels and writes the
//! encoded messages to every connection currently associated with a player.
//! The task holds only a weak reference to the instance and ends once the
//! instance is dropped or the server shuts down. Every notice it finishes
//! sending is acknowledged to the instance, which keeps a finished room from
//! being swept before its `game_over` went out.

use crate::game::{GameInstance, InstanceEvents, RoomId};
use crate::messaging::{self, ServerMessage};
use crate::multiplexer::Multiplexer;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Spawns the broadcaster for `instance` on the current tokio runtime.
pub fn spawn_broadcaster(
    instance: &Arc<GameInstance>,
    events: InstanceEvents,
    multiplexer: Arc<Multiplexer>,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(instance);
    let room = instance.room().clone();
    tokio::spawn(run(weak, room, events, multiplexer, shutdown))
}

async fn run(
    instance: Weak<GameInstance>,
    room: RoomId,
    mut events: InstanceEvents,
    multiplexer: Arc<Multiplexer>,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(room = %room, "Broadcaster started");
    let mut announced = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            Some(notice) = events.defeated.recv() => {
                let Some(instance) = instance.upgrade() else { break };
                deliver(&instance, &multiplexer, &ServerMessage::PlayerDefeated { player: notice.player });
                instance.event_delivered();
            }

            Some(update) = events.updates.recv() => {
                let Some(instance) = instance.upgrade() else { break };
                let winner = update.snapshot.winner.clone();
                deliver(&instance, &multiplexer, &ServerMessage::State {
                    reason: update.reason,
                    snapshot: update.snapshot,
                });
                if let Some(winner) = winner {
                    if !announced {
                        announced = true;
                        deliver(&instance, &multiplexer, &ServerMessage::GameOver { winner });
                    }
                }
                instance.event_delivered();
            }

            else => break,
        }
    }

    debug!(room = %room, "Broadcaster stopped");
}

/// Sends `message` to every connected player of the instance. Returns the
/// number of connections written to.
///
/// Frames that could not be written in full stay queued on the connection,
/// and the multiplexer is told to wake the dispatch loop once they can be
/// flushed.
pub(crate) fn deliver(instance: &GameInstance, multiplexer: &Multiplexer, message: &ServerMessage) -> usize {
    let text = match messaging::encode(message) {
        Ok(text) => text,
        Err(e) => {
            debug!(room = %instance.room(), "Failed to encode broadcast: {}", e);
            return 0;
        }
    };

    let mut delivered = 0;
    for fd in instance.connected_descriptors() {
        let Some(handle) = multiplexer.connection(fd) else {
            continue;
        };
        if handle.room() != instance.room() {
            continue;
        }
        match handle.send_text(&text) {
            Ok(()) => delivered += 1,
            Err(e) => trace!(fd, room = %instance.room(), "Broadcast write failed: {}", e),
        }
        multiplexer.sync_write_interest(&handle);
    }
    delivered
}
