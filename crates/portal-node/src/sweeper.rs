//! Periodic eviction of expired sessions, idle connections, stale presence
//! and finished transfers.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use portal_client::TransferManager;
use portal_media::SignalingSession;
use portal_net::PresenceTracker;
use portal_shared::SessionStore;

use crate::config::NodeConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub connections: usize,
    pub peers: usize,
    pub transfers: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    sessions: SessionStore,
    signaling: SignalingSession,
    presence: PresenceTracker,
    transfers: TransferManager,
    session_max_age_hours: u64,
    connection_idle_secs: u64,
    presence_stale_secs: u64,
    transfer_retention_secs: u64,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        config: &NodeConfig,
        sessions: SessionStore,
        signaling: SignalingSession,
        presence: PresenceTracker,
        transfers: TransferManager,
    ) -> Self {
        Self {
            sessions,
            signaling,
            presence,
            transfers,
            session_max_age_hours: config.session_max_age_hours,
            connection_idle_secs: config.connection_idle_secs,
            presence_stale_secs: config.presence_stale_secs,
            transfer_retention_secs: config.transfer_retention_secs,
            interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let report = SweepReport {
            sessions: self.sessions.cleanup_sessions(self.session_max_age_hours).await,
            connections: self.signaling.cleanup_idle(self.connection_idle_secs).await,
            peers: self.presence.purge_stale(self.presence_stale_secs).await,
            transfers: self.transfers.purge_finished(self.transfer_retention_secs).await,
        };
        debug!(?report, "Sweep finished");
        report
    }

    /// Run `sweep_once` on every tick until the returned task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                self.sweep_once().await;
            }
        })
    }
}
