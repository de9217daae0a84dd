use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::{
    KDF_CONTEXT_MESSAGE_KEY, KDF_CONTEXT_SESSION_KEY, MESSAGE_KEY_CHAIN_LEN, NONCE_SIZE,
    SYMMETRIC_KEY_SIZE, TAG_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Output of a detached AEAD seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// Fresh random nonce per call; tag is split off the ciphertext.
pub fn seal(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::EncryptionFailed);
    }
    let tag_bytes = ciphertext.split_off(ciphertext.len() - TAG_SIZE);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&tag_bytes);

    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
        tag,
    })
}

/// Verifies the tag before any plaintext is returned.
pub fn open(
    key: &SymmetricKey,
    ciphertext: &[u8],
    nonce: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce);

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(nonce, Payload { msg: &combined, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation
pub fn derive_session_key(shared_secret: &[u8], portal_id: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SESSION_KEY);
    hasher.update(shared_secret);
    hasher.update(portal_id);
    *hasher.finalize().as_bytes()
}

/// Forward-secrecy chain: each key is derived from the previous one only.
pub fn derive_message_keys(session_key: &SymmetricKey) -> Vec<SymmetricKey> {
    let mut keys = Vec::with_capacity(MESSAGE_KEY_CHAIN_LEN);
    let mut current = *session_key;
    for _ in 0..MESSAGE_KEY_CHAIN_LEN {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
        hasher.update(&current);
        current = *hasher.finalize().as_bytes();
        keys.push(current);
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_symmetric_key() -> SymmetricKey {
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"portal chunk payload";

        let sealed = seal(&key, plaintext, b"aad").unwrap();
        let opened = open(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag, b"aad").unwrap();

        assert_eq!(opened, plaintext);
        assert_eq!(sealed.ciphertext.len(), plaintext.len());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&generate_symmetric_key(), b"Secret", b"").unwrap();
        let other = generate_symmetric_key();
        assert_eq!(
            open(&other, &sealed.ciphertext, &sealed.nonce, &sealed.tag, b""),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_tag_or_aad_fails() {
        let key = generate_symmetric_key();
        let sealed = seal(&key, b"Important data", b"chunk-1").unwrap();

        let mut tag = sealed.tag;
        tag[0] ^= 0xFF;
        assert!(open(&key, &sealed.ciphertext, &sealed.nonce, &tag, b"chunk-1").is_err());
        assert!(open(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag, b"chunk-2").is_err());
    }

    #[test]
    fn test_short_nonce_rejected() {
        let key = generate_symmetric_key();
        let sealed = seal(&key, b"x", b"").unwrap();
        assert!(open(&key, &sealed.ciphertext, &sealed.nonce[..12], &sealed.tag, b"").is_err());
    }

    #[test]
    fn test_nonces_unique() {
        let key = generate_symmetric_key();
        let a = seal(&key, b"same", b"").unwrap();
        let b = seal(&key, b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_session_key_derivation_deterministic() {
        let k1 = derive_session_key(b"shared", b"portal-1");
        let k2 = derive_session_key(b"shared", b"portal-1");
        let k3 = derive_session_key(b"shared", b"portal-2");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_message_key_chain() {
        let keys = derive_message_keys(&[7u8; 32]);
        assert_eq!(keys.len(), MESSAGE_KEY_CHAIN_LEN);
        assert_ne!(keys[0], [7u8; 32]);
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
