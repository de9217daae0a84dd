//! Content-addressed file chunking.
//!
//! Splits a byte buffer into SHA-256 checksummed chunks and reassembles them,
//! verifying completeness, size and the whole-file checksum. Pure data
//! transformation: no I/O and no shared state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MIME_TYPE, FILE_ID_HEX_LEN, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::crypto::sha256_hex;
use crate::error::ChunkError;
use crate::types::NetworkQuality;

/// One checksummed slice of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_id: String,
    pub index: u32,
    pub data: Vec<u8>,
    pub size: usize,
    /// Hex SHA-256 of `data`
    pub checksum: String,
    pub is_last: bool,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Build a chunk, computing size and checksum from `data`.
    pub fn new(file_id: &str, index: u32, data: Vec<u8>, is_last: bool) -> Self {
        Self {
            id: chunk_id(file_id, index),
            file_id: file_id.to_string(),
            index,
            size: data.len(),
            checksum: sha256_hex(&data),
            data,
            is_last,
            created_at: Utc::now(),
        }
    }
}

pub fn chunk_id(file_id: &str, index: u32) -> String {
    format!("{file_id}:{index}")
}

/// Sender-owned description of a chunked file. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub total_chunks: u32,
    pub chunk_size: usize,
    pub sender: String,
    pub recipients: BTreeSet<String>,
    /// Hex SHA-256 of the full reassembled data
    pub checksum: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkOptions {
    pub chunk_size: Option<usize>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkedFile {
    pub file_id: String,
    pub chunks: Vec<Chunk>,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFile {
    pub data: Vec<u8>,
    pub filename: String,
    pub size: u64,
    pub verified: bool,
}

/// Split `data` into checksummed chunks attributed to `sender`.
///
/// The last chunk may be shorter than the chunk size. Empty input yields
/// no chunks and `total_chunks == 0`.
pub fn chunk(
    data: &[u8],
    filename: &str,
    sender: &str,
    opts: ChunkOptions,
) -> Result<ChunkedFile, ChunkError> {
    if sender.trim().is_empty() {
        return Err(ChunkError::SenderRequired);
    }
    let chunk_size = opts.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk_size == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }

    let file_id = derive_file_id(data, filename, sender);
    let total_chunks = data.len().div_ceil(chunk_size);

    let chunks: Vec<Chunk> = data
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, piece)| Chunk::new(&file_id, i as u32, piece.to_vec(), i + 1 == total_chunks))
        .collect();

    let metadata = FileMetadata {
        id: file_id.clone(),
        filename: filename.to_string(),
        size: data.len() as u64,
        total_chunks: total_chunks as u32,
        chunk_size,
        sender: sender.to_string(),
        recipients: opts.recipients.into_iter().collect(),
        checksum: sha256_hex(data),
        mime_type: mime_type_for(filename).to_string(),
        created_at: Utc::now(),
    };

    Ok(ChunkedFile {
        file_id,
        chunks,
        metadata,
    })
}

/// Reassemble chunks received in any order.
///
/// Checks run in order and the first failure short-circuits: missing
/// indices, total size, whole-file checksum.
pub fn reassemble(chunks: &[Chunk], metadata: &FileMetadata) -> Result<ReassembledFile, ChunkError> {
    let by_index: BTreeMap<u32, &Chunk> = chunks.iter().map(|c| (c.index, c)).collect();

    let missing: Vec<u32> = (0..metadata.total_chunks)
        .filter(|i| !by_index.contains_key(i))
        .collect();
    if !missing.is_empty() {
        return Err(ChunkError::MissingChunks(missing));
    }

    let mut data = Vec::with_capacity(metadata.size as usize);
    for chunk in by_index.values() {
        data.extend_from_slice(&chunk.data);
    }

    if data.len() as u64 != metadata.size {
        return Err(ChunkError::SizeMismatch {
            expected: metadata.size,
            actual: data.len() as u64,
        });
    }

    let actual = sha256_hex(&data);
    if actual != metadata.checksum {
        return Err(ChunkError::ChecksumMismatch {
            expected: metadata.checksum.clone(),
            actual,
        });
    }

    Ok(ReassembledFile {
        size: data.len() as u64,
        data,
        filename: metadata.filename.clone(),
        verified: true,
    })
}

pub fn validate_chunk(chunk: &Chunk) -> Result<(), ChunkError> {
    if sha256_hex(&chunk.data) == chunk.checksum {
        Ok(())
    } else {
        Err(ChunkError::InvalidChecksum {
            chunk_id: chunk.id.clone(),
        })
    }
}

/// Pick a chunk size for a file of `file_size` bytes over a link of the
/// given quality. Non-decreasing in both size and quality, clamped to
/// `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
pub fn optimal_chunk_size(file_size: u64, quality: NetworkQuality) -> usize {
    const MIB: u64 = 1024 * 1024;

    let base = match quality {
        NetworkQuality::Excellent => 256 * 1024,
        NetworkQuality::Good => 128 * 1024,
        NetworkQuality::Fair => 64 * 1024,
        NetworkQuality::Poor => 16 * 1024,
    };

    // Small files get smaller chunks, huge files larger ones.
    let scaled = match file_size {
        s if s < MIB => base / 4,
        s if s < 10 * MIB => base / 2,
        s if s < 100 * MIB => base,
        _ => base * 2,
    };

    scaled.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Rebuild sender metadata from a complete chunk set.
pub fn metadata_from_chunks(
    chunks: &[Chunk],
    filename: &str,
    sender: &str,
    recipients: impl IntoIterator<Item = String>,
) -> FileMetadata {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let mut hasher = Sha256::new();
    for chunk in &ordered {
        hasher.update(&chunk.data);
    }

    FileMetadata {
        id: ordered.first().map(|c| c.file_id.clone()).unwrap_or_default(),
        filename: filename.to_string(),
        size: ordered.iter().map(|c| c.size as u64).sum(),
        total_chunks: ordered.len() as u32,
        chunk_size: ordered.first().map(|c| c.size).unwrap_or(0),
        sender: sender.to_string(),
        recipients: recipients.into_iter().collect(),
        checksum: hex::encode(hasher.finalize()),
        mime_type: mime_type_for(filename).to_string(),
        created_at: Utc::now(),
    }
}

/// MIME type from the filename extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let ext = match filename.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_MIME_TYPE,
    };

    match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => DEFAULT_MIME_TYPE,
    }
}

fn derive_file_id(data: &[u8], filename: &str, sender: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update([0u8]);
    hasher.update(filename.as_bytes());
    hasher.update([0u8]);
    hasher.update(data);
    let mut id = hex::encode(hasher.finalize());
    id.truncate(FILE_ID_HEX_LEN);
    id
}
