//! Presence tracking for peers inside a portal.

pub mod presence;

pub use presence::{
    ActivityStatus, ConnectionStatus, PortalSummary, Presence, PresenceError, PresenceTracker,
    PresenceStats, PresenceUpdate, TrackOptions,
};
