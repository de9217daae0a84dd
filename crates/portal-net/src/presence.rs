//! Peer presence tracking.
//!
//! Maintains an in-memory record per `(portal_id, peer_id)` pair: connection
//! state, activity, link quality and the data channels open to that peer.
//! Portals are kept in separate maps so peers in different portals never
//! touch the same entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use portal_shared::error::ErrorClass;
use portal_shared::types::NetworkQuality;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("A wallet address is required to track a peer")]
    WalletRequired,

    #[error("Peer {peer_id} not found in portal {portal_id}")]
    PeerNotFound { portal_id: String, peer_id: String },
}

impl PresenceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::WalletRequired => ErrorClass::InputValidation,
            Self::PeerNotFound { .. } => ErrorClass::Lookup,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    #[default]
    Active,
    Idle,
    Away,
    Offline,
}

/// Tracked state of one peer inside one portal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Presence {
    pub peer_id: String,
    pub wallet_address: String,
    pub ens_name: Option<String>,
    pub portal_id: String,
    pub connection_state: ConnectionStatus,
    pub activity_status: ActivityStatus,
    pub connection_quality: NetworkQuality,
    pub last_seen: DateTime<Utc>,
    pub data_channels: BTreeSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    pub wallet_address: Option<String>,
    pub ens_name: Option<String>,
    pub connection_state: Option<ConnectionStatus>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Partial update; `None` fields are left as they are and metadata keys merge.
#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    pub ens_name: Option<String>,
    pub connection_state: Option<ConnectionStatus>,
    pub activity_status: Option<ActivityStatus>,
    pub connection_quality: Option<NetworkQuality>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceStats {
    pub total_peers: usize,
    pub connecting: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub failed: usize,
    pub by_quality: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortalSummary {
    pub portal_id: String,
    pub peer_count: usize,
    pub active_peers: Vec<Presence>,
    pub last_activity: Option<DateTime<Utc>>,
    pub connection_stats: PresenceStats,
}

type PortalPeers = HashMap<String, Presence>;

#[derive(Clone, Default)]
pub struct PresenceTracker {
    portals: Arc<RwLock<HashMap<String, PortalPeers>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a peer, replacing any previous record for the pair.
    pub async fn track(
        &self,
        portal_id: &str,
        peer_id: &str,
        opts: TrackOptions,
    ) -> Result<Presence, PresenceError> {
        let wallet_address = opts
            .wallet_address
            .filter(|w| !w.trim().is_empty())
            .ok_or(PresenceError::WalletRequired)?;

        let presence = Presence {
            peer_id: peer_id.to_string(),
            wallet_address,
            ens_name: opts.ens_name,
            portal_id: portal_id.to_string(),
            connection_state: opts.connection_state.unwrap_or_default(),
            activity_status: ActivityStatus::Active,
            connection_quality: NetworkQuality::Good,
            last_seen: Utc::now(),
            data_channels: BTreeSet::new(),
            metadata: opts.metadata,
        };

        debug!(portal = %portal_id, peer = %peer_id, "Tracking peer presence");
        self.portals
            .write()
            .await
            .entry(portal_id.to_string())
            .or_default()
            .insert(peer_id.to_string(), presence.clone());
        Ok(presence)
    }

    pub async fn update(
        &self,
        portal_id: &str,
        peer_id: &str,
        changes: PresenceUpdate,
    ) -> Result<Presence, PresenceError> {
        self.with_peer(portal_id, peer_id, |p| {
            if let Some(ens) = changes.ens_name {
                p.ens_name = Some(ens);
            }
            if let Some(state) = changes.connection_state {
                p.connection_state = state;
            }
            if let Some(status) = changes.activity_status {
                p.activity_status = status;
            }
            if let Some(quality) = changes.connection_quality {
                p.connection_quality = quality;
            }
            p.metadata.extend(changes.metadata);
        })
        .await
    }

    pub async fn untrack(&self, portal_id: &str, peer_id: &str) -> Result<(), PresenceError> {
        let mut portals = self.portals.write().await;
        let peers = portals
            .get_mut(portal_id)
            .ok_or_else(|| not_found(portal_id, peer_id))?;
        peers
            .remove(peer_id)
            .ok_or_else(|| not_found(portal_id, peer_id))?;
        if peers.is_empty() {
            portals.remove(portal_id);
        }
        debug!(portal = %portal_id, peer = %peer_id, "Untracked peer");
        Ok(())
    }

    pub async fn get(&self, portal_id: &str, peer_id: &str) -> Result<Presence, PresenceError> {
        self.portals
            .read()
            .await
            .get(portal_id)
            .and_then(|peers| peers.get(peer_id))
            .cloned()
            .ok_or_else(|| not_found(portal_id, peer_id))
    }

    pub async fn list_for_portal(&self, portal_id: &str) -> Vec<Presence> {
        self.filtered(portal_id, |_| true).await
    }

    pub async fn list_by_state(&self, portal_id: &str, state: ConnectionStatus) -> Vec<Presence> {
        self.filtered(portal_id, |p| p.connection_state == state).await
    }

    pub async fn list_active(&self, portal_id: &str) -> Vec<Presence> {
        self.filtered(portal_id, |p| p.activity_status == ActivityStatus::Active)
            .await
    }

    pub async fn update_activity(
        &self,
        portal_id: &str,
        peer_id: &str,
        status: ActivityStatus,
    ) -> Result<Presence, PresenceError> {
        self.with_peer(portal_id, peer_id, |p| p.activity_status = status)
            .await
    }

    pub async fn update_connection_quality(
        &self,
        portal_id: &str,
        peer_id: &str,
        quality: NetworkQuality,
    ) -> Result<Presence, PresenceError> {
        self.with_peer(portal_id, peer_id, |p| p.connection_quality = quality)
            .await
    }

    /// Idempotent: a name already present is not duplicated.
    pub async fn add_data_channel(
        &self,
        portal_id: &str,
        peer_id: &str,
        name: &str,
    ) -> Result<Presence, PresenceError> {
        self.with_peer(portal_id, peer_id, |p| {
            p.data_channels.insert(name.to_string());
        })
        .await
    }

    pub async fn remove_data_channel(
        &self,
        portal_id: &str,
        peer_id: &str,
        name: &str,
    ) -> Result<Presence, PresenceError> {
        self.with_peer(portal_id, peer_id, |p| {
            p.data_channels.remove(name);
        })
        .await
    }

    /// Refresh `last_seen` without changing anything else.
    pub async fn touch(&self, portal_id: &str, peer_id: &str) -> Result<Presence, PresenceError> {
        self.with_peer(portal_id, peer_id, |_| {}).await
    }

    pub async fn portal_summary(&self, portal_id: &str) -> PortalSummary {
        let peers = self.list_for_portal(portal_id).await;

        let mut stats = PresenceStats {
            total_peers: peers.len(),
            ..Default::default()
        };
        for q in NetworkQuality::ALL {
            stats.by_quality.insert(q.to_string(), 0);
        }
        for p in &peers {
            match p.connection_state {
                ConnectionStatus::Connecting => stats.connecting += 1,
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Disconnected => stats.disconnected += 1,
                ConnectionStatus::Failed => stats.failed += 1,
            }
            *stats
                .by_quality
                .entry(p.connection_quality.to_string())
                .or_default() += 1;
        }

        PortalSummary {
            portal_id: portal_id.to_string(),
            peer_count: peers.len(),
            last_activity: peers.iter().map(|p| p.last_seen).max(),
            active_peers: peers
                .into_iter()
                .filter(|p| p.activity_status == ActivityStatus::Active)
                .collect(),
            connection_stats: stats,
        }
    }

    /// Remove peers not seen for `max_age_secs`. Returns how many were dropped.
    pub async fn purge_stale(&self, max_age_secs: u64) -> usize {
        let now = Utc::now();
        let max_age = i64::try_from(max_age_secs).unwrap_or(i64::MAX);
        let mut portals = self.portals.write().await;
        let mut removed = 0;
        for peers in portals.values_mut() {
            let before = peers.len();
            peers.retain(|_, p| now.signed_duration_since(p.last_seen).num_seconds() <= max_age);
            removed += before - peers.len();
        }
        portals.retain(|_, peers| !peers.is_empty());
        if removed > 0 {
            info!(removed, "Purged stale peer presence");
        }
        removed
    }

    async fn filtered(&self, portal_id: &str, keep: impl Fn(&Presence) -> bool) -> Vec<Presence> {
        let portals = self.portals.read().await;
        let mut out: Vec<Presence> = portals
            .get(portal_id)
            .map(|peers| peers.values().filter(|p| keep(p)).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    // Every mutation of a single peer goes through here under the write lock.
    async fn with_peer(
        &self,
        portal_id: &str,
        peer_id: &str,
        f: impl FnOnce(&mut Presence),
    ) -> Result<Presence, PresenceError> {
        let mut portals = self.portals.write().await;
        let presence = portals
            .get_mut(portal_id)
            .and_then(|peers| peers.get_mut(peer_id))
            .ok_or_else(|| not_found(portal_id, peer_id))?;
        f(presence);
        presence.last_seen = Utc::now();
        Ok(presence.clone())
    }

    #[cfg(test)]
    async fn backdate(&self, portal_id: &str, peer_id: &str, secs: i64) {
        let mut portals = self.portals.write().await;
        if let Some(p) = portals.get_mut(portal_id).and_then(|m| m.get_mut(peer_id)) {
            p.last_seen = Utc::now() - chrono::Duration::seconds(secs);
        }
    }
}

fn not_found(portal_id: &str, peer_id: &str) -> PresenceError {
    PresenceError::PeerNotFound {
        portal_id: portal_id.to_string(),
        peer_id: peer_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(w: &str) -> TrackOptions {
        TrackOptions {
            wallet_address: Some(w.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_track_defaults() {
        let tracker = PresenceTracker::new();
        let p = tracker.track("portal-1", "bob", wallet("0xbob")).await.unwrap();

        assert_eq!(p.connection_state, ConnectionStatus::Connecting);
        assert_eq!(p.activity_status, ActivityStatus::Active);
        assert_eq!(p.connection_quality, NetworkQuality::Good);
        assert!(p.data_channels.is_empty());
    }

    #[tokio::test]
    async fn test_wallet_required() {
        let tracker = PresenceTracker::new();
        let err = tracker
            .track("portal-1", "bob", TrackOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, PresenceError::WalletRequired);
        assert!(tracker.list_for_portal("portal-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_lookup_errors() {
        let tracker = PresenceTracker::new();
        tracker.track("portal-1", "bob", wallet("0xbob")).await.unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert("client".to_string(), serde_json::json!("web"));
        let p = tracker
            .update(
                "portal-1",
                "bob",
                PresenceUpdate {
                    connection_state: Some(ConnectionStatus::Connected),
                    ens_name: Some("bob.eth".into()),
                    metadata,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(p.connection_state, ConnectionStatus::Connected);
        assert_eq!(p.ens_name.as_deref(), Some("bob.eth"));
        assert_eq!(p.metadata["client"], "web");

        let err = tracker
            .update("portal-2", "bob", PresenceUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Lookup);
        assert!(tracker.get("portal-1", "carol").await.is_err());
    }

    #[tokio::test]
    async fn test_data_channel_idempotent() {
        let tracker = PresenceTracker::new();
        tracker.track("portal-1", "bob", wallet("0xbob")).await.unwrap();

        tracker.add_data_channel("portal-1", "bob", "file-transfer").await.unwrap();
        let p = tracker
            .add_data_channel("portal-1", "bob", "file-transfer")
            .await
            .unwrap();
        assert_eq!(p.data_channels.len(), 1);

        let p = tracker
            .remove_data_channel("portal-1", "bob", "file-transfer")
            .await
            .unwrap();
        assert!(p.data_channels.is_empty());
    }

    #[tokio::test]
    async fn test_listing_filters() {
        let tracker = PresenceTracker::new();
        for peer in ["alice", "bob", "carol"] {
            tracker
                .track("portal-1", peer, wallet(&format!("0x{peer}")))
                .await
                .unwrap();
        }
        tracker.track("portal-2", "dave", wallet("0xdave")).await.unwrap();

        tracker
            .update_activity("portal-1", "bob", ActivityStatus::Away)
            .await
            .unwrap();
        tracker
            .update(
                "portal-1",
                "carol",
                PresenceUpdate {
                    connection_state: Some(ConnectionStatus::Connected),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(tracker.list_for_portal("portal-1").await.len(), 3);
        let active: Vec<String> = tracker
            .list_active("portal-1")
            .await
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        assert_eq!(active, vec!["alice", "carol"]);
        assert_eq!(
            tracker
                .list_by_state("portal-1", ConnectionStatus::Connected)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_portal_summary() {
        let tracker = PresenceTracker::new();
        tracker.track("portal-1", "alice", wallet("0xa")).await.unwrap();
        tracker.track("portal-1", "bob", wallet("0xb")).await.unwrap();
        tracker
            .update_connection_quality("portal-1", "bob", NetworkQuality::Poor)
            .await
            .unwrap();
        tracker
            .update_activity("portal-1", "alice", ActivityStatus::Idle)
            .await
            .unwrap();

        let summary = tracker.portal_summary("portal-1").await;
        assert_eq!(summary.peer_count, 2);
        assert_eq!(summary.active_peers.len(), 1);
        assert_eq!(summary.connection_stats.total_peers, 2);
        assert_eq!(summary.connection_stats.connecting, 2);
        assert_eq!(summary.connection_stats.by_quality["poor"], 1);
        assert_eq!(summary.connection_stats.by_quality["good"], 1);
        assert!(summary.last_activity.is_some());

        let empty = tracker.portal_summary("nowhere").await;
        assert_eq!(empty.peer_count, 0);
        assert!(empty.last_activity.is_none());
    }

    #[tokio::test]
    async fn test_untrack_and_purge() {
        let tracker = PresenceTracker::new();
        tracker.track("portal-1", "alice", wallet("0xa")).await.unwrap();
        tracker.track("portal-1", "bob", wallet("0xb")).await.unwrap();

        tracker.untrack("portal-1", "alice").await.unwrap();
        assert!(tracker.untrack("portal-1", "alice").await.is_err());

        tracker.backdate("portal-1", "bob", 500).await;
        assert_eq!(tracker.purge_stale(120).await, 1);
        assert!(tracker.list_for_portal("portal-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_distinct_peers() {
        let tracker = PresenceTracker::new();
        for i in 0..16 {
            tracker
                .track("portal-1", &format!("peer-{i}"), wallet("0xw"))
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let t = tracker.clone();
                tokio::spawn(async move {
                    t.add_data_channel("portal-1", &format!("peer-{i}"), "file-transfer")
                        .await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let peers = tracker.list_for_portal("portal-1").await;
        assert!(peers.iter().all(|p| p.data_channels.contains("file-transfer")));
    }
}
