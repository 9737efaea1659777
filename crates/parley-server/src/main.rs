//! # parley-server
//!
//! Real-time chat delivery server.
//!
//! This binary provides:
//! - **WebSocket endpoint** (axum) where authenticated users send, edit,
//!   remove and read messages and manage their conversations
//! - **Presence registry** in Redis (or in-process) mapping each user to
//!   their live connection
//! - **Acknowledged delivery** with timeout and retry; anything a push could
//!   not deliver is replayed when the user reconnects
//! - **SQLite store** for users, conversations and messages

mod api;
mod config;
mod delivery;
mod error;
mod handlers;
mod hub;
mod presence;
mod session;
mod state;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::config::ServerConfig;
use crate::presence::{MemoryPresence, PresenceStore, RedisPresence};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Opened message store");

    let presence: Arc<dyn PresenceStore> = match &config.redis_url {
        Some(url) => {
            info!("Using Redis presence registry");
            Arc::new(RedisPresence::connect(url, config.presence_ttl).await?)
        }
        None => {
            if config.presence_ttl.is_some() {
                warn!("PRESENCE_TTL_SECS has no effect without REDIS_URL");
            }
            info!("Using in-process presence registry");
            Arc::new(MemoryPresence::new())
        }
    };

    // Handles from a previous run are meaningless now.
    match presence.purge().await {
        Ok(removed) => info!(removed, "Purged stale presence entries"),
        Err(e) => warn!(error = %e, "Failed to purge presence entries"),
    }

    let http_addr = config.http_addr;
    let state = AppState::new(db, presence, config);

    // -----------------------------------------------------------------------
    // 4. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
