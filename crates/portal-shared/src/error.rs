use thiserror::Error;

/// Coarse classification of every caller-facing failure.
///
/// A UI uses this to decide between "try again" and "this peer is gone".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A mandatory field was omitted; nothing was mutated.
    InputValidation,
    /// The referenced peer, session, connection or transfer does not exist.
    Lookup,
    /// Data arrived incomplete or corrupted.
    Integrity,
    /// A malformed signaling payload was rejected.
    Protocol,
    /// The operation is not valid in the entity's current state.
    State,
    /// Local failure (serialization, worker pool, transport).
    Internal,
}

impl ErrorClass {
    /// Whether `resume` is a sensible reaction to a transfer failing this way.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Integrity | Self::Internal)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("A sender is required to chunk a file")]
    SenderRequired,

    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("Missing chunks: {0:?}")]
    MissingChunks(Vec<u32>),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid checksum for chunk {chunk_id}")]
    InvalidChecksum { chunk_id: String },
}

impl ChunkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SenderRequired | Self::InvalidChunkSize => ErrorClass::InputValidation,
            Self::MissingChunks(_)
            | Self::SizeMismatch { .. }
            | Self::ChecksumMismatch { .. }
            | Self::InvalidChecksum { .. } => ErrorClass::Integrity,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption session not found: {0}")]
    SessionNotFound(String),

    #[error("No peer session for peer {0}")]
    PeerSessionNotFound(String),

    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CryptoError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SessionNotFound(_) | Self::PeerSessionNotFound(_) => ErrorClass::Lookup,
            Self::KeyExchangeFailed(_) => ErrorClass::Protocol,
            Self::DecryptionFailed => ErrorClass::Integrity,
            Self::EncryptionFailed | Self::Serialization(_) => ErrorClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_distinct_from_lookup() {
        assert_eq!(ChunkError::MissingChunks(vec![1]).class(), ErrorClass::Integrity);
        assert_eq!(
            CryptoError::PeerSessionNotFound("bob".into()).class(),
            ErrorClass::Lookup
        );
        assert!(ErrorClass::Integrity.is_resumable());
        assert!(!ErrorClass::Lookup.is_resumable());
    }
}
