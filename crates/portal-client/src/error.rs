use thiserror::Error;

use portal_media::SignalingError;
use portal_net::PresenceError;
use portal_shared::error::{ChunkError, CryptoError, ErrorClass};

use crate::transfer::TransferState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("A sender is required to start a transfer")]
    SenderRequired,

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Transfer cannot be resumed from state {0:?}")]
    NotResumable(TransferState),

    #[error("Invalid transfer transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("Data channel {channel} is not open on connection {connection_id}")]
    ChannelNotOpen {
        connection_id: String,
        channel: String,
    },

    #[error("Data channel closed")]
    ChannelClosed,

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Wire encoding error: {0}")]
    Wire(String),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Presence(#[from] PresenceError),
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SenderRequired => ErrorClass::InputValidation,
            Self::TransferNotFound(_) => ErrorClass::Lookup,
            Self::NotResumable(_) | Self::InvalidTransition { .. } | Self::ChannelNotOpen { .. } => {
                ErrorClass::State
            }
            Self::UnexpectedFrame(_) => ErrorClass::Protocol,
            Self::ChannelClosed | Self::Wire(_) => ErrorClass::Internal,
            Self::Chunk(e) => e.class(),
            Self::Crypto(e) => e.class(),
            Self::Signaling(e) => e.class(),
            Self::Presence(e) => e.class(),
        }
    }
}

impl From<bincode::Error> for TransferError {
    fn from(e: bincode::Error) -> Self {
        Self::Wire(e.to_string())
    }
}
