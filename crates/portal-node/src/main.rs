//! # portal-node
//!
//! Long-running endpoint for a portal. It owns the encryption sessions,
//! peer connections, presence and transfers of the local user and keeps
//! them swept until shutdown.

mod config;
mod sweeper;

use tracing::info;
use tracing_subscriber::EnvFilter;

use portal_client::{TransferManager, TransferPipeline};
use portal_media::SignalingSession;
use portal_net::PresenceTracker;
use portal_shared::SessionStore;

use crate::config::NodeConfig;
use crate::sweeper::Sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,portal_node=debug")),
        )
        .init();

    info!("Starting portal node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    let sessions = SessionStore::new();
    let signaling = SignalingSession::new();
    let presence = PresenceTracker::new();
    let transfers = TransferManager::with_chunk_size(config.chunk_size);

    let wallet = config
        .wallet_address
        .clone()
        .ok_or_else(|| anyhow::anyhow!("PORTAL_WALLET must be set"))?;
    let local = sessions.init_session(&config.portal_id, &wallet, None).await;
    info!(
        session = %local.session_id,
        public_key = %hex::encode(local.public_key()),
        portal = %config.portal_id,
        chunk_size = config.chunk_size,
        "Local encryption session ready"
    );

    let pipeline = TransferPipeline::new(
        sessions.clone(),
        signaling.clone(),
        presence.clone(),
        transfers.clone(),
    );

    let sweeper = Sweeper::new(&config, sessions, signaling, presence, transfers).spawn();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    sweeper.abort();

    let unfinished = pipeline.transfers().list_active(&config.portal_id).await;
    if !unfinished.is_empty() {
        tracing::warn!(count = unfinished.len(), "Exiting with unfinished transfers");
    }

    info!("Portal node stopped");
    Ok(())
}
