//! Per-portal encryption sessions.
//!
//! Each endpoint holds one [`EncryptionSession`] per portal: an X25519
//! keypair bound to its wallet address plus one [`PeerSession`] per peer it
//! has exchanged keys with. Session keys are derived locally from the
//! Diffie-Hellman result and never leave the process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::chunker::{Chunk, FileMetadata};
use crate::constants::PUBKEY_SIZE;
use crate::crypto::{self, SymmetricKey};
use crate::error::CryptoError;
use crate::protocol::{chunk_associated_data, EncryptedChunk, EncryptedMetadata};

/// Keys shared with one remote peer. Exists only after a successful exchange.
#[derive(Clone)]
pub struct PeerSession {
    pub peer_id: String,
    pub peer_wallet: String,
    shared_secret: [u8; 32],
    session_key: SymmetricKey,
    message_keys: Vec<SymmetricKey>,
    pub established_at: DateTime<Utc>,
}

impl PeerSession {
    fn derive(
        local: &StaticSecret,
        portal_id: &str,
        peer_id: &str,
        peer_public_key: &[u8],
        peer_wallet: &str,
    ) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBKEY_SIZE] = peer_public_key.try_into().map_err(|_| {
            CryptoError::KeyExchangeFailed(format!(
                "peer public key must be {PUBKEY_SIZE} bytes, got {}",
                peer_public_key.len()
            ))
        })?;

        let shared = local.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchangeFailed(
                "non-contributory peer public key".into(),
            ));
        }

        let session_key = crypto::derive_session_key(shared.as_bytes(), portal_id.as_bytes());
        Ok(Self {
            peer_id: peer_id.to_string(),
            peer_wallet: peer_wallet.to_string(),
            shared_secret: *shared.as_bytes(),
            message_keys: crypto::derive_message_keys(&session_key),
            session_key,
            established_at: Utc::now(),
        })
    }

    pub fn session_key(&self) -> &SymmetricKey {
        &self.session_key
    }

    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }

    pub fn message_keys(&self) -> &[SymmetricKey] {
        &self.message_keys
    }

    fn seal_chunk(&self, session_id: &str, chunk: &Chunk) -> Result<EncryptedChunk, CryptoError> {
        let aad = chunk_associated_data(
            &chunk.id,
            &chunk.file_id,
            chunk.index,
            chunk.is_last,
            &chunk.checksum,
        );
        let sealed = crypto::seal(&self.session_key, &chunk.data, &aad)?;

        Ok(EncryptedChunk {
            chunk_id: chunk.id.clone(),
            file_id: chunk.file_id.clone(),
            index: chunk.index,
            is_last: chunk.is_last,
            checksum: chunk.checksum.clone(),
            encrypted_data: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            tag: sealed.tag.to_vec(),
            peer_id: self.peer_id.clone(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
        })
    }

    fn open_chunk(&self, encrypted: &EncryptedChunk) -> Result<Chunk, CryptoError> {
        let data = crypto::open(
            &self.session_key,
            &encrypted.encrypted_data,
            &encrypted.nonce,
            &encrypted.tag,
            &encrypted.associated_data(),
        )?;

        // Keep the sender's checksum so `validate_chunk` compares it with the
        // decrypted data.
        let mut chunk = Chunk::new(&encrypted.file_id, encrypted.index, data, encrypted.is_last);
        chunk.id = encrypted.chunk_id.clone();
        chunk.checksum = encrypted.checksum.clone();
        Ok(chunk)
    }

    fn seal_metadata(
        &self,
        session_id: &str,
        metadata: &FileMetadata,
    ) -> Result<EncryptedMetadata, CryptoError> {
        let plaintext =
            bincode::serialize(metadata).map_err(|e| CryptoError::Serialization(e.to_string()))?;
        let sealed = crypto::seal(&self.session_key, &plaintext, metadata.id.as_bytes())?;

        Ok(EncryptedMetadata {
            file_id: metadata.id.clone(),
            encrypted_metadata: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            tag: sealed.tag.to_vec(),
            peer_id: self.peer_id.clone(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
        })
    }

    fn open_metadata(&self, encrypted: &EncryptedMetadata) -> Result<FileMetadata, CryptoError> {
        let plaintext = crypto::open(
            &self.session_key,
            &encrypted.encrypted_metadata,
            &encrypted.nonce,
            &encrypted.tag,
            encrypted.file_id.as_bytes(),
        )?;
        bincode::deserialize(&plaintext).map_err(|e| CryptoError::Serialization(e.to_string()))
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("peer_wallet", &self.peer_wallet)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

/// Portal-scoped cryptographic context of the local endpoint.
#[derive(Clone)]
pub struct EncryptionSession {
    pub session_id: String,
    pub portal_id: String,
    pub wallet_address: String,
    secret: StaticSecret,
    public: PublicKey,
    peer_sessions: HashMap<String, PeerSession>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl EncryptionSession {
    /// Generate a fresh keypair. `session_id` is random unless supplied.
    pub fn new(portal_id: &str, wallet_address: &str, session_id: Option<String>) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let now = Utc::now();

        Self {
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            portal_id: portal_id.to_string(),
            wallet_address: wallet_address.to_string(),
            secret,
            public,
            peer_sessions: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn public_key(&self) -> [u8; PUBKEY_SIZE] {
        self.public.to_bytes()
    }

    /// Add or replace the peer session for `peer_id`.
    pub fn exchange_keys(
        &mut self,
        peer_id: &str,
        peer_public_key: &[u8],
        peer_wallet: &str,
    ) -> Result<&PeerSession, CryptoError> {
        let peer = PeerSession::derive(
            &self.secret,
            &self.portal_id,
            peer_id,
            peer_public_key,
            peer_wallet,
        )?;
        self.insert_peer(peer);
        self.peer(peer_id)
    }

    fn insert_peer(&mut self, peer: PeerSession) {
        debug!(
            session = %self.session_id,
            peer = %peer.peer_id,
            "Peer session established"
        );
        self.peer_sessions.insert(peer.peer_id.clone(), peer);
        self.touch();
    }

    pub fn peer_session(&self, peer_id: &str) -> Option<&PeerSession> {
        self.peer_sessions.get(peer_id)
    }

    fn peer(&self, peer_id: &str) -> Result<&PeerSession, CryptoError> {
        self.peer_sessions
            .get(peer_id)
            .ok_or_else(|| CryptoError::PeerSessionNotFound(peer_id.to_string()))
    }

    pub fn peer_count(&self) -> usize {
        self.peer_sessions.len()
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.peer_sessions.remove(peer_id).is_some()
    }

    pub fn encrypt_chunk(&self, chunk: &Chunk, peer_id: &str) -> Result<EncryptedChunk, CryptoError> {
        self.peer(peer_id)?.seal_chunk(&self.session_id, chunk)
    }

    pub fn decrypt_chunk(
        &self,
        encrypted: &EncryptedChunk,
        peer_id: &str,
    ) -> Result<Chunk, CryptoError> {
        self.peer(peer_id)?.open_chunk(encrypted)
    }

    pub fn encrypt_metadata(
        &self,
        metadata: &FileMetadata,
        peer_id: &str,
    ) -> Result<EncryptedMetadata, CryptoError> {
        self.peer(peer_id)?.seal_metadata(&self.session_id, metadata)
    }

    pub fn decrypt_metadata(
        &self,
        encrypted: &EncryptedMetadata,
        peer_id: &str,
    ) -> Result<FileMetadata, CryptoError> {
        self.peer(peer_id)?.open_metadata(encrypted)
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_expired(&self, max_age_hours: u64, now: DateTime<Utc>) -> bool {
        let max_secs = i64::try_from(max_age_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
        now.signed_duration_since(self.last_activity).num_seconds() > max_secs
    }
}

impl std::fmt::Debug for EncryptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSession")
            .field("session_id", &self.session_id)
            .field("portal_id", &self.portal_id)
            .field("wallet_address", &self.wallet_address)
            .field("peers", &self.peer_sessions.keys().collect::<Vec<_>>())
            .field("last_activity", &self.last_activity)
            .finish_non_exhaustive()
    }
}

/// Registry of the local endpoint's sessions, keyed by `session_id`.
///
/// Key exchange and AEAD work run on the blocking pool so they never stall
/// the task driving signaling traffic.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, EncryptionSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init_session(
        &self,
        portal_id: &str,
        wallet_address: &str,
        session_id: Option<String>,
    ) -> EncryptionSession {
        let session = EncryptionSession::new(portal_id, wallet_address, session_id);
        info!(
            session = %session.session_id,
            portal = %portal_id,
            "Created encryption session"
        );
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        session
    }

    pub async fn get_session(&self, session_id: &str) -> Result<EncryptionSession, CryptoError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CryptoError::SessionNotFound(session_id.to_string()))
    }

    pub async fn exchange_keys(
        &self,
        session_id: &str,
        peer_id: &str,
        peer_public_key: Vec<u8>,
        peer_wallet: &str,
    ) -> Result<EncryptionSession, CryptoError> {
        let (secret, portal_id) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| CryptoError::SessionNotFound(session_id.to_string()))?;
            (session.secret.clone(), session.portal_id.clone())
        };

        let (peer, wallet) = (peer_id.to_string(), peer_wallet.to_string());
        let peer_session = tokio::task::spawn_blocking(move || {
            PeerSession::derive(&secret, &portal_id, &peer, &peer_public_key, &wallet)
        })
        .await
        .map_err(|e| CryptoError::KeyExchangeFailed(e.to_string()))??;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CryptoError::SessionNotFound(session_id.to_string()))?;
        session.insert_peer(peer_session);
        Ok(session.clone())
    }

    pub async fn encrypt_chunk(
        &self,
        session_id: &str,
        chunk: Chunk,
        peer_id: &str,
    ) -> Result<EncryptedChunk, CryptoError> {
        let peer = self.peer_session(session_id, peer_id).await?;
        let sid = session_id.to_string();
        let encrypted = tokio::task::spawn_blocking(move || peer.seal_chunk(&sid, &chunk))
            .await
            .map_err(|_| CryptoError::EncryptionFailed)??;
        self.touch(session_id).await;
        Ok(encrypted)
    }

    pub async fn decrypt_chunk(
        &self,
        session_id: &str,
        encrypted: EncryptedChunk,
        peer_id: &str,
    ) -> Result<Chunk, CryptoError> {
        let peer = self.peer_session(session_id, peer_id).await?;
        let chunk = tokio::task::spawn_blocking(move || peer.open_chunk(&encrypted))
            .await
            .map_err(|_| CryptoError::DecryptionFailed)??;
        self.touch(session_id).await;
        Ok(chunk)
    }

    pub async fn encrypt_metadata(
        &self,
        session_id: &str,
        metadata: &FileMetadata,
        peer_id: &str,
    ) -> Result<EncryptedMetadata, CryptoError> {
        let peer = self.peer_session(session_id, peer_id).await?;
        let encrypted = peer.seal_metadata(session_id, metadata)?;
        self.touch(session_id).await;
        Ok(encrypted)
    }

    pub async fn decrypt_metadata(
        &self,
        session_id: &str,
        encrypted: &EncryptedMetadata,
        peer_id: &str,
    ) -> Result<FileMetadata, CryptoError> {
        let peer = self.peer_session(session_id, peer_id).await?;
        let metadata = peer.open_metadata(encrypted)?;
        self.touch(session_id).await;
        Ok(metadata)
    }

    pub async fn remove_peer(&self, session_id: &str, peer_id: &str) -> Result<bool, CryptoError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CryptoError::SessionNotFound(session_id.to_string()))?;
        Ok(session.remove_peer(peer_id))
    }

    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Drop sessions idle for longer than `max_age_hours`. Returns how many
    /// were removed.
    pub async fn cleanup_sessions(&self, max_age_hours: u64) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(max_age_hours, now));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Purged expired sessions");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn peer_session(&self, session_id: &str, peer_id: &str) -> Result<PeerSession, CryptoError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CryptoError::SessionNotFound(session_id.to_string()))?;
        session.peer(peer_id).cloned()
    }

    async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.touch();
        }
    }

    #[cfg(test)]
    async fn backdate(&self, session_id: &str, hours: i64) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity = Utc::now() - chrono::Duration::hours(hours);
        }
    }
}
