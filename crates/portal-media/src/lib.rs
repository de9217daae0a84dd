//! Peer-connection negotiation for Portal data channels.

pub mod sdp;
pub mod signaling;

pub use sdp::{IceCandidate, SdpType, SessionDescription};
pub use signaling::{
    ConnectionState, ConnectionStats, PeerConnection, SignalingError, SignalingSession,
};
