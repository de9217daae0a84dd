/// Protocol version advertised in SDP offers
pub const PROTOCOL_VERSION: &str = "/portal/1.0.0";

/// Default chunk size in bytes (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size `optimal_chunk_size` will select (16 KiB)
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size `optimal_chunk_size` will select (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Number of message keys derived ahead from each session key
pub const MESSAGE_KEY_CHAIN_LEN: usize = 8;

/// Length of the hex-encoded file id
pub const FILE_ID_HEX_LEN: usize = 32;

/// Name of the data channel file transfers run over
pub const FILE_TRANSFER_CHANNEL: &str = "file-transfer";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SESSION_KEY: &str = "portal-session-key-v1";
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "portal-message-key-v1";

/// Fallback MIME type for unknown extensions
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
