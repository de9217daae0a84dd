//! Shared building blocks for Portal peer-to-peer file transfer.
//!
//! Everything in here is transport-agnostic: content-addressed chunking,
//! per-peer encryption sessions and the binary wire protocol.

pub mod chunker;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod session;
pub mod types;

pub use chunker::{Chunk, ChunkOptions, ChunkedFile, FileMetadata, ReassembledFile};
pub use error::{ChunkError, CryptoError, ErrorClass};
pub use protocol::{EncryptedChunk, EncryptedMetadata, WireMessage};
pub use session::{EncryptionSession, PeerSession, SessionStore};
pub use types::NetworkQuality;
