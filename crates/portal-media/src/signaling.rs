use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use portal_shared::error::ErrorClass;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sdp::{IceCandidate, SdpType, SessionDescription};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Missing required parameters: {}", .0.join(", "))]
    MissingRequiredParams(Vec<&'static str>),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Invalid SDP answer: {0}")]
    InvalidSdpAnswer(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidIceCandidate(String),

    #[error("Cannot {action} while connection is {state:?}")]
    InvalidState {
        action: &'static str,
        state: ConnectionState,
    },
}

impl SignalingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingRequiredParams(_) => ErrorClass::InputValidation,
            Self::ConnectionNotFound(_) => ErrorClass::Lookup,
            Self::InvalidSdpAnswer(_) | Self::InvalidIceCandidate(_) => ErrorClass::Protocol,
            Self::InvalidState { .. } => ErrorClass::State,
        }
    }
}

/// `new -> have_offer -> connected -> closed`, with `failed` absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    HaveOffer,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub portal_id: Option<String>,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Traffic {
    bytes_sent: u64,
    bytes_received: u64,
    packets_lost: u64,
    rtt_ms: Option<f64>,
}

/// One peer connection's negotiation state.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub id: String,
    pub peer_id: String,
    pub portal_id: String,
    pub wallet_address: String,
    pub state: ConnectionState,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub ice_candidates: Vec<IceCandidate>,
    /// Channel names are unique within a connection only.
    pub data_channels: BTreeMap<String, DataChannelOptions>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    traffic: Traffic,
}

impl PeerConnection {
    fn new(peer_id: &str, portal_id: String, wallet_address: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            portal_id,
            wallet_address,
            state: ConnectionState::New,
            offer: None,
            answer: None,
            ice_candidates: Vec::new(),
            data_channels: BTreeMap::new(),
            failure_reason: None,
            created_at: now,
            last_activity: now,
            traffic: Traffic::default(),
        }
    }

    fn ensure_live(&self, action: &'static str) -> Result<(), SignalingError> {
        if self.state.is_terminal() {
            return Err(SignalingError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    fn create_offer(&mut self, channels: &[String]) -> Result<SessionDescription, SignalingError> {
        if !matches!(self.state, ConnectionState::New | ConnectionState::HaveOffer) {
            return Err(SignalingError::InvalidState {
                action: "create offer",
                state: self.state,
            });
        }

        for name in channels {
            self.data_channels.entry(name.clone()).or_default();
        }
        let offer = SessionDescription::data_offer(
            self.created_at.timestamp_millis().unsigned_abs(),
            channels,
        );
        self.offer = Some(offer.clone());
        self.state = ConnectionState::HaveOffer;
        self.touch();
        debug!(peer = %self.peer_id, connection = %self.id, "Creating SDP offer");
        Ok(offer)
    }

    fn process_answer(&mut self, answer: SessionDescription) -> Result<(), SignalingError> {
        // Malformed input leaves the connection untouched.
        answer
            .validate(SdpType::Answer)
            .map_err(SignalingError::InvalidSdpAnswer)?;
        if self.state != ConnectionState::HaveOffer {
            return Err(SignalingError::InvalidState {
                action: "process answer",
                state: self.state,
            });
        }

        self.answer = Some(answer);
        self.state = ConnectionState::Connected;
        self.touch();
        debug!(peer = %self.peer_id, connection = %self.id, "Received SDP answer");
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), SignalingError> {
        candidate
            .validate()
            .map_err(SignalingError::InvalidIceCandidate)?;
        self.ensure_live("add ICE candidate")?;
        self.ice_candidates.push(candidate);
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.data_channels.contains_key(name)
    }

    /// Connected and carrying the named channel.
    pub fn is_channel_open(&self, name: &str) -> bool {
        self.state == ConnectionState::Connected && self.has_channel(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub data_channels: usize,
    pub uptime_seconds: i64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub rtt: Option<f64>,
}

/// The local endpoint's peer connections, keyed by connection id.
#[derive(Clone, Default)]
pub struct SignalingSession {
    connections: Arc<RwLock<HashMap<String, PeerConnection>>>,
}

impl SignalingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both `portal_id` and `wallet_address` are mandatory.
    pub async fn create_connection(
        &self,
        peer_id: &str,
        opts: ConnectionOptions,
    ) -> Result<PeerConnection, SignalingError> {
        let portal_id = opts.portal_id.filter(|s| !s.trim().is_empty());
        let wallet = opts.wallet_address.filter(|s| !s.trim().is_empty());

        let (portal_id, wallet) = match (portal_id, wallet) {
            (Some(p), Some(w)) => (p, w),
            (p, w) => {
                let mut missing = Vec::new();
                if p.is_none() {
                    missing.push("portal_id");
                }
                if w.is_none() {
                    missing.push("wallet_address");
                }
                return Err(SignalingError::MissingRequiredParams(missing));
            }
        };

        let conn = PeerConnection::new(peer_id, portal_id, wallet);
        info!(
            peer = %peer_id,
            portal = %conn.portal_id,
            connection = %conn.id,
            "Created peer connection"
        );
        self.connections
            .write()
            .await
            .insert(conn.id.clone(), conn.clone());
        Ok(conn)
    }

    pub async fn create_offer(
        &self,
        connection_id: &str,
        data_channels: &[String],
    ) -> Result<SessionDescription, SignalingError> {
        self.with_connection(connection_id, |c| c.create_offer(data_channels))
            .await
    }

    pub async fn process_answer(
        &self,
        connection_id: &str,
        answer: SessionDescription,
    ) -> Result<PeerConnection, SignalingError> {
        self.with_connection(connection_id, |c| {
            c.process_answer(answer)?;
            Ok(c.clone())
        })
        .await
    }

    /// Candidates accumulate; they never replace earlier ones.
    pub async fn add_ice_candidate(
        &self,
        connection_id: &str,
        candidate: IceCandidate,
    ) -> Result<PeerConnection, SignalingError> {
        self.with_connection(connection_id, |c| {
            c.add_ice_candidate(candidate)?;
            Ok(c.clone())
        })
        .await
    }

    pub async fn create_data_channel(
        &self,
        connection_id: &str,
        name: &str,
        opts: DataChannelOptions,
    ) -> Result<PeerConnection, SignalingError> {
        self.with_connection(connection_id, |c| {
            c.ensure_live("create data channel")?;
            c.data_channels.insert(name.to_string(), opts);
            c.touch();
            debug!(connection = %c.id, channel = %name, "Registered data channel");
            Ok(c.clone())
        })
        .await
    }

    /// Destroys the connection. Later lookups return `ConnectionNotFound`.
    pub async fn close(&self, connection_id: &str) -> Result<(), SignalingError> {
        let conn = self
            .connections
            .write()
            .await
            .remove(connection_id)
            .ok_or_else(|| SignalingError::ConnectionNotFound(connection_id.to_string()))?;
        info!(peer = %conn.peer_id, connection = %conn.id, "Closed peer connection");
        Ok(())
    }

    /// Transport reported an unrecoverable failure.
    pub async fn mark_failed(
        &self,
        connection_id: &str,
        reason: &str,
    ) -> Result<PeerConnection, SignalingError> {
        self.with_connection(connection_id, |c| {
            if c.state != ConnectionState::Failed {
                warn!(peer = %c.peer_id, connection = %c.id, reason, "Peer connection failed");
            }
            c.state = ConnectionState::Failed;
            c.failure_reason = Some(reason.to_string());
            c.touch();
            Ok(c.clone())
        })
        .await
    }

    pub async fn record_traffic(
        &self,
        connection_id: &str,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<(), SignalingError> {
        self.with_connection(connection_id, |c| {
            c.traffic.bytes_sent = c.traffic.bytes_sent.saturating_add(bytes_sent);
            c.traffic.bytes_received = c.traffic.bytes_received.saturating_add(bytes_received);
            c.touch();
            Ok(())
        })
        .await
    }

    pub async fn record_network(
        &self,
        connection_id: &str,
        packets_lost: u64,
        rtt_ms: Option<f64>,
    ) -> Result<(), SignalingError> {
        self.with_connection(connection_id, |c| {
            c.traffic.packets_lost = c.traffic.packets_lost.saturating_add(packets_lost);
            if rtt_ms.is_some() {
                c.traffic.rtt_ms = rtt_ms;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_connection(&self, connection_id: &str) -> Result<PeerConnection, SignalingError> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| SignalingError::ConnectionNotFound(connection_id.to_string()))
    }

    pub async fn get_stats(&self, connection_id: &str) -> Result<ConnectionStats, SignalingError> {
        let conn = self.get_connection(connection_id).await?;
        Ok(ConnectionStats {
            state: conn.state,
            data_channels: conn.data_channels.len(),
            uptime_seconds: Utc::now()
                .signed_duration_since(conn.created_at)
                .num_seconds()
                .max(0),
            bytes_sent: conn.traffic.bytes_sent,
            bytes_received: conn.traffic.bytes_received,
            packets_lost: conn.traffic.packets_lost,
            rtt: conn.traffic.rtt_ms,
        })
    }

    pub async fn list_connections(&self) -> Vec<PeerConnection> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Drop connections idle for longer than `max_idle_secs`.
    pub async fn cleanup_idle(&self, max_idle_secs: u64) -> usize {
        let now = Utc::now();
        let max_idle = i64::try_from(max_idle_secs).unwrap_or(i64::MAX);
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections
            .retain(|_, c| now.signed_duration_since(c.last_activity).num_seconds() <= max_idle);
        let removed = before - connections.len();
        if removed > 0 {
            info!(removed, remaining = connections.len(), "Purged idle peer connections");
        }
        removed
    }

    async fn with_connection<T>(
        &self,
        connection_id: &str,
        f: impl FnOnce(&mut PeerConnection) -> Result<T, SignalingError>,
    ) -> Result<T, SignalingError> {
        let mut connections = self.connections.write().await;
        let conn = connections
            .get_mut(connection_id)
            .ok_or_else(|| SignalingError::ConnectionNotFound(connection_id.to_string()))?;
        f(conn)
    }

    #[cfg(test)]
    async fn backdate(&self, connection_id: &str, secs: i64) {
        if let Some(c) = self.connections.write().await.get_mut(connection_id) {
            c.last_activity = Utc::now() - chrono::Duration::seconds(secs);
        }
    }
}
