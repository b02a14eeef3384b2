//! AES-GCM sealing.
//!
//! Sealed layout is `IV (12 bytes) || ciphertext || tag (16 bytes)`. The key
//! length selects AES-128 or AES-256.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};

use super::CryptoError;

/// GCM nonce length.
pub const IV_LEN: usize = 12;

/// GCM tag length.
pub const TAG_LEN: usize = 16;

/// Decrypt and authenticate a sealed buffer.
pub fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::SealedTooShort(sealed.len()));
    }
    let (iv, body) = sealed.split_at(IV_LEN);
    let nonce = Nonce::from_slice(iv);

    let opened = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .decrypt(nonce, body),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .decrypt(nonce, body),
        other => return Err(CryptoError::InvalidKeyLength(other)),
    };

    opened.map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt under the given IV and prepend it.
pub fn seal(key: &[u8], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = Nonce::from_slice(iv);

    let body = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .encrypt(nonce, plaintext),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .encrypt(nonce, plaintext),
        other => return Err(CryptoError::InvalidKeyLength(other)),
    }
    .map_err(|_| CryptoError::AuthenticationFailed)?;

    let mut sealed = Vec::with_capacity(IV_LEN + body.len());
    sealed.extend_from_slice(iv);
    sealed.extend_from_slice(&body);
    Ok(sealed)
}
