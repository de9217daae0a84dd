//! Portal transfer orchestration.
//!
//! Owns the lifecycle of each file transfer and the pipeline that moves
//! encrypted chunks over a peer connection's data channel.

pub mod error;
pub mod pipeline;
pub mod transfer;

pub use error::TransferError;
pub use pipeline::{Frame, PeerRoute, ReceiveBuffer, ReceiveEvent, Received, TransferPipeline};
pub use transfer::{
    ProgressUpdate, StartOptions, Transfer, TransferCounters, TransferManager, TransferProgress,
    TransferState,
};
