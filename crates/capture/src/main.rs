//! Main application entry point for the capture game server
//!
//! Loads the TOML configuration, applies command-line overrides, installs
//! logging and runs the server until SIGINT or SIGTERM.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context, Result};
use capture_server::GameServer;
use cli::CliArgs;
use config::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long the server gets to finish its cleanup after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Main application struct
pub struct Application {
    config: AppConfig,
    server: Arc<GameServer>,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self> {
        // Configuration is loaded before logging so the file can pick the level
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(admin_address) = args.admin_address {
            config.server.admin_address = Some(admin_address);
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging.level, config.logging.json_format)?;
        display_banner();

        let server = GameServer::new(config.to_server_config()?)
            .context("Failed to create game server")?;

        info!("📂 Config: {}", args.config_path.display());

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    pub async fn run(self) -> Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        if let Some(admin) = &self.config.server.admin_address {
            info!("  🩺 Admin address: {}", admin);
        }
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!(
            "  🎲 Room defaults: {} players, {:?} grid, {} min TTL",
            self.config.rooms.default_players,
            self.config.rooms.default_grid,
            self.config.rooms.ttl_minutes
        );

        let mut server_handle = {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move { server.start().await })
        };

        info!("🛑 Press Ctrl+C to gracefully shutdown");

        tokio::select! {
            signal = signals::wait_for_shutdown() => {
                signal?;
                info!("🛑 Shutdown signal received, initiating graceful shutdown...");
            }
            finished = &mut server_handle => {
                return match finished {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow!("Server error: {e}")),
                    Err(e) => Err(anyhow!("Server task failed: {e}")),
                };
            }
        }

        self.server.shutdown()?;

        match tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("❌ Server error during shutdown: {}", e),
            Ok(Err(e)) => error!("❌ Server task failed: {}", e),
            Err(_) => warn!("⏳ Server did not stop within {:?}", SHUTDOWN_GRACE),
        }

        let stats = self.server.context().stats_snapshot();
        info!("📊 Final Statistics:");
        info!("  - Connections accepted: {}", stats.accepted);
        info!("  - WebSocket upgrades: {}", stats.upgraded);
        info!("  - Rooms swept: {}", stats.swept_rooms);
        info!("👋 Capture server shutdown complete");

        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }
}

fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════╗");
    info!("║         🟥 CAPTURE SERVER 🟦         ║");
    info!("║                v{:<8}             ║", version);
    info!("╚══════════════════════════════════════╝");
}
