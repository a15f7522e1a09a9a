//! Core game server implementation.
//!
//! This module contains the `GameServer` struct, which owns the listeners and
//! wires the accept loop, the dispatch thread, the room sweeper and the
//! optional admin endpoint together.

use crate::{
    config::ServerConfig,
    dispatch::{Dispatcher, RetiredRoom},
    error::ServerError,
    game::RoomManager,
    multiplexer::Multiplexer,
    server::{admin, handlers::handle_connection},
};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn, Level};

/// Rooms the sweeper may hand over before the dispatch loop catches up.
const RETIRED_ROOM_BACKLOG: usize = 256;

/// Monotonic counters exposed through the admin endpoint.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepted: AtomicU64,
    pub upgraded: AtomicU64,
    pub answered: AtomicU64,
    pub rejected: AtomicU64,
    pub swept_rooms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub rooms: usize,
    pub connections: usize,
    pub accepted: u64,
    pub upgraded: u64,
    pub answered: u64,
    pub rejected: u64,
    pub swept_rooms: u64,
}

/// State shared by every server task.
pub struct ServerContext {
    pub config: ServerConfig,
    pub multiplexer: Arc<Multiplexer>,
    pub rooms: Arc<RoomManager>,
    pub stats: ServerStats,
    pub started_at: SystemTime,
    shutdown_sender: broadcast::Sender<()>,
    retired: mpsc::Sender<RetiredRoom>,
}

impl ServerContext {
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().map(|d| d.as_secs()).unwrap_or(0),
            rooms: self.rooms.len(),
            connections: self.multiplexer.len(),
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            upgraded: self.stats.upgraded.load(Ordering::Relaxed),
            answered: self.stats.answered.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            swept_rooms: self.stats.swept_rooms.load(Ordering::Relaxed),
        }
    }

    /// Removes expired rooms and finished rooms whose last broadcast went
    /// out, and hands each one to the dispatch loop, which closes the
    /// connections bound to it.
    ///
    /// A room is only removed once its hand-over slot is reserved, so a full
    /// queue leaves the rest for the next sweep.
    pub fn sweep_rooms(&self, now: SystemTime) -> usize {
        let mut swept = 0;
        for room in self.rooms.sweep_candidates(now) {
            let permit = match self.retired.try_reserve() {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("Deferring room sweep: {}", e);
                    break;
                }
            };
            if self.rooms.remove_if_sweepable(&room, now).is_none() {
                continue;
            }
            info!(room = %room, "🧹 Room removed");
            permit.send(RetiredRoom { room, swept_at: now });
            swept += 1;
        }
        self.stats.swept_rooms.fetch_add(swept as u64, Ordering::Relaxed);
        swept
    }
}

/// The capture game server.
///
/// # Architecture
///
/// * **Accept loop**: tokio task that upgrades incoming sockets off the runtime
/// * **Dispatch thread**: waits on the multiplexer and applies client messages
/// * **Broadcasters**: one tokio task per room pushing state to its players
/// * **Sweeper**: periodic removal of finished and expired rooms
pub struct GameServer {
    context: Arc<ServerContext>,
    /// Taken by the dispatch loop on start.
    retired_rooms: parking_lot::Mutex<Option<mpsc::Receiver<RetiredRoom>>>,
}

impl GameServer {
    /// Creates a new game server with the specified configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration parameters for server behavior
    ///
    /// # Returns
    ///
    /// The server, or `ServerError::Multiplexer` if the epoll instance could
    /// not be allocated.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let multiplexer = Arc::new(Multiplexer::new()?);
        let rooms = Arc::new(RoomManager::new(config.rooms.update_buffer));
        let (shutdown_sender, _) = broadcast::channel(1);
        let (retired, retired_rooms) = mpsc::channel(RETIRED_ROOM_BACKLOG);

        Ok(Self {
            context: Arc::new(ServerContext {
                config,
                multiplexer,
                rooms,
                stats: ServerStats::default(),
                started_at: SystemTime::now(),
                shutdown_sender,
                retired,
            }),
            retired_rooms: parking_lot::Mutex::new(Some(retired_rooms)),
        })
    }

    /// Runs the server until [`GameServer::shutdown`] is called.
    ///
    /// # Startup Sequence
    ///
    /// 1. Bind the admin listener, if configured, then the game listener
    /// 2. Start the dispatch thread
    /// 3. Start the sweeper
    /// 4. Accept connections until shutdown
    pub async fn start(&self) -> Result<(), ServerError> {
        let ctx = &self.context;
        let retired_rooms = self
            .retired_rooms
            .lock()
            .take()
            .ok_or_else(|| ServerError::Internal("Server was already started".to_string()))?;
        info!("🚀 Starting capture server on {}", ctx.config.bind_address);

        if let Some(admin_address) = ctx.config.admin_address {
            let admin_listener = bind_listener(admin_address)?;
            info!("🩺 Admin endpoint bound on {}", admin_address);
            tokio::spawn(admin::serve(admin_listener, Arc::clone(ctx)));
        }

        let listener = bind_listener(ctx.config.bind_address)?;
        info!("✅ Listener bound on {}", ctx.config.bind_address);

        let dispatcher = Dispatcher::new(
            Arc::clone(&ctx.multiplexer),
            Arc::clone(&ctx.rooms),
            retired_rooms,
            ctx.config.poll_timeout,
            ctx.config.max_events,
        );
        let dispatch_stop = dispatcher.stop_flag();
        let dispatch_thread = dispatcher
            .spawn()
            .map_err(|e| ServerError::Internal(format!("Failed to start dispatch thread: {e}")))?;

        self.start_sweeper();

        let mut shutdown_receiver = ctx.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        ctx.stats.accepted.fetch_add(1, Ordering::Relaxed);
                        let ctx = Arc::clone(ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, ctx).await {
                                report_connection_failure(addr, &e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("🧹 Performing server cleanup...");
        self.stop_dispatch(dispatch_stop, dispatch_thread).await;
        for handle in ctx.multiplexer.connections() {
            let _ = ctx.multiplexer.unregister(&handle);
            handle.close();
        }
        info!("✅ Server stopped");
        Ok(())
    }

    /// Signals every server task to stop.
    pub fn shutdown(&self) -> Result<(), ServerError> {
        info!("🛑 Shutting down capture server");
        let _ = self.context.shutdown_sender.send(());
        Ok(())
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.context)
    }

    pub fn rooms(&self) -> Arc<RoomManager> {
        Arc::clone(&self.context.rooms)
    }

    pub fn multiplexer(&self) -> Arc<Multiplexer> {
        Arc::clone(&self.context.multiplexer)
    }

    /// Periodically sweeps dead rooms and logs a stats line.
    fn start_sweeper(&self) {
        let ctx = Arc::clone(&self.context);
        let mut shutdown = ctx.subscribe_shutdown();

        tokio::spawn(async move {
            let mut ticker = interval(ctx.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        ctx.sweep_rooms(SystemTime::now());
                        let stats = ctx.stats_snapshot();
                        info!(
                            "📊 Server stats - rooms: {}, connections: {}, accepted: {}, upgraded: {}",
                            stats.rooms, stats.connections, stats.accepted, stats.upgraded
                        );
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    async fn stop_dispatch(&self, stop: Arc<AtomicBool>, thread: std::thread::JoinHandle<()>) {
        stop.store(true, Ordering::Release);
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => error!("Dispatch thread panicked"),
            Err(e) => warn!("Failed to join dispatch thread: {}", e),
        }
    }
}

/// Registration failures mean the multiplexer itself is in trouble; anything
/// else is one client going away mid-upgrade.
fn failure_level(error: &ServerError) -> Level {
    match error {
        ServerError::Multiplexer(_) => Level::ERROR,
        _ => Level::DEBUG,
    }
}

fn report_connection_failure(addr: SocketAddr, e: &ServerError) {
    if failure_level(e) == Level::ERROR {
        error!("❌ Connection from {} could not be served: {}", addr, e);
    } else {
        debug!("Connection from {} failed: {}", addr, e);
    }
}

/// Binds a non-blocking listener with `SO_REUSEADDR` set.
pub(crate) fn bind_listener(address: SocketAddr) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();

    socket
        .bind(&address.into())
        .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true).ok();

    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}
