use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All wire protocol messages exchanged over a file-transfer data channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Encrypted file metadata, always sent before the first chunk
    FileOffer {
        transfer_id: String,
        metadata: EncryptedMetadata,
    },

    /// One encrypted chunk
    FileChunk {
        transfer_id: String,
        chunk: EncryptedChunk,
    },

    /// Receiver's cumulative counters, sent back to the sender
    Ack {
        transfer_id: String,
        /// Chunk this ack confirms; `None` for offer replies and rejections
        index: Option<u32>,
        received_chunks: u32,
        failed_chunks: u32,
    },

    /// Sender stopped the transfer; already delivered chunks stay valid
    Cancel { transfer_id: String },
}

/// A chunk as it travels between peers.
///
/// `file_id`, `index`, `is_last` and the sender's `checksum` stay in the
/// clear for routing but are bound to the ciphertext as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedChunk {
    pub chunk_id: String,
    pub file_id: String,
    pub index: u32,
    pub is_last: bool,
    /// Hex SHA-256 of the plaintext as computed by the sender
    pub checksum: String,
    /// XChaCha20-Poly1305 ciphertext without the tag
    pub encrypted_data: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
    pub peer_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl EncryptedChunk {
    pub fn associated_data(&self) -> Vec<u8> {
        chunk_associated_data(
            &self.chunk_id,
            &self.file_id,
            self.index,
            self.is_last,
            &self.checksum,
        )
    }
}

pub fn chunk_associated_data(
    chunk_id: &str,
    file_id: &str,
    index: u32,
    is_last: bool,
    checksum: &str,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(chunk_id.len() + file_id.len() + checksum.len() + 7);
    aad.extend_from_slice(chunk_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(file_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&index.to_be_bytes());
    aad.push(is_last as u8);
    aad.extend_from_slice(checksum.as_bytes());
    aad
}

/// Serialized `FileMetadata`, sealed the same way as a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMetadata {
    pub file_id: String,
    pub encrypted_metadata: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
    pub peer_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl WireMessage {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn transfer_id(&self) -> &str {
        match self {
            Self::FileOffer { transfer_id, .. }
            | Self::FileChunk { transfer_id, .. }
            | Self::Ack { transfer_id, .. }
            | Self::Cancel { transfer_id } => transfer_id,
        }
    }
}
