// src/crypto/session.rs
//! Per-connection session keys.
//!
//! The client generates a 32-byte AES key during the handshake and hands it
//! to the server under RSA-OAEP. From then on every packet in either
//! direction is AES-256-CBC encrypted under that key.

use rand::RngCore;
use std::fmt;

use crate::config::constants::{IV_SIZE, SESSION_KEY_SIZE};
use crate::crypto::encryption::{decrypt_aes_cbc, encrypt_aes_cbc, EncryptionError};

/// A 32-byte AES session key
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    /// Generate a new random session key
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Build a session key from received bytes, which must be exactly 32 long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EncryptionError> {
        let key: [u8; SESSION_KEY_SIZE] =
            bytes.try_into().map_err(|_| EncryptionError::InvalidKeyLength {
                expected: SESSION_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(key))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encrypt under this key with a fresh IV, returning `(ciphertext, iv)`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; IV_SIZE]), EncryptionError> {
        encrypt_aes_cbc(plaintext, &self.0)
    }

    /// Decrypt a ciphertext produced by [`SessionKey::encrypt`]
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        decrypt_aes_cbc(ciphertext, &self.0, iv)
    }
}
