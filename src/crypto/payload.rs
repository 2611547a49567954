// src/crypto/payload.rs
//! Chat payload ciphers.
//!
//! A chat message names its cipher with a one-digit code. This module maps
//! the code onto the matching encrypt/decrypt pair and handles key
//! transport: for the keyed symmetric ciphers the chat key travels with
//! the message, RSA-OAEP wrapped to the recipient's public key.

use rsa::RsaPublicKey;
use std::fmt;
use tracing::trace;

use crate::config::constants::SENTINEL;
use crate::crypto::classical::{rot13, vigenere_decrypt, vigenere_encrypt};
use crate::crypto::encryption::{decrypt_aes_cbc, encrypt_aes_cbc, EncryptionError};
use crate::crypto::fernet::{fernet_decrypt, fernet_encrypt};
use crate::crypto::keys::{encrypt_for, Identity, KeyError};

/// Cipher applied to a chat payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherType {
    Plaintext,
    Rot13,
    Vigenere,
    Aes,
    Rsa,
    Fernet,
}

impl CipherType {
    pub const ALL: [CipherType; 6] = [
        Self::Plaintext,
        Self::Rot13,
        Self::Vigenere,
        Self::Aes,
        Self::Rsa,
        Self::Fernet,
    ];

    /// Numeric code carried on the wire
    pub fn code(&self) -> u8 {
        match self {
            Self::Plaintext => 0,
            Self::Rot13 => 1,
            Self::Vigenere => 2,
            Self::Aes => 3,
            Self::Rsa => 4,
            Self::Fernet => 5,
        }
    }

    /// Parse a numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Parse the ASCII decimal form used in record fields
    pub fn from_field(field: &[u8]) -> Option<Self> {
        std::str::from_utf8(field)
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .and_then(Self::from_code)
    }

    /// ASCII decimal form for record fields
    pub fn to_field(&self) -> Vec<u8> {
        self.code().to_string().into_bytes()
    }

    /// Get string representation for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Rot13 => "rot13",
            Self::Vigenere => "vigenere",
            Self::Aes => "aes",
            Self::Rsa => "rsa",
            Self::Fernet => "fernet",
        }
    }

    /// Whether the message carries an IV
    pub fn uses_iv(&self) -> bool {
        matches!(self, Self::Aes)
    }

    /// Whether a shared chat key travels wrapped alongside the message
    pub fn transports_key(&self) -> bool {
        matches!(self, Self::Vigenere | Self::Aes | Self::Fernet)
    }

    /// Whether sealing needs the recipient's public key
    pub fn needs_peer_key(&self) -> bool {
        self.transports_key() || matches!(self, Self::Rsa)
    }
}

impl fmt::Display for CipherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A chat payload ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// AES IV, or the sentinel
    pub iv: Vec<u8>,
    /// OAEP-wrapped chat key, or the sentinel
    pub wrapped_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn key_error(err: KeyError) -> EncryptionError {
    match err {
        KeyError::MessageTooLong { max, actual } => EncryptionError::MessageTooLong { max, actual },
        KeyError::Crypto(msg) => EncryptionError::DecryptionFailed(msg),
        other => EncryptionError::InvalidKey(other.to_string()),
    }
}

fn require_peer(peer: Option<&RsaPublicKey>, cipher: CipherType) -> Result<&RsaPublicKey, EncryptionError> {
    peer.ok_or_else(|| EncryptionError::MissingKey(format!("{} needs the recipient public key", cipher)))
}

/// Encrypt a message with the selected cipher.
///
/// Returns `(iv, ciphertext)`; the IV is the sentinel for every cipher but
/// AES. `key` is the shared chat key and is ignored by the unkeyed ciphers
/// and RSA, which encrypts to `peer` instead.
pub fn encrypt_payload(
    cipher: CipherType,
    message: &[u8],
    key: &[u8],
    peer: Option<&RsaPublicKey>,
) -> Result<(Vec<u8>, Vec<u8>), EncryptionError> {
    let sentinel = SENTINEL.to_vec();
    match cipher {
        CipherType::Plaintext => Ok((sentinel, message.to_vec())),
        CipherType::Rot13 => Ok((sentinel, rot13(message))),
        CipherType::Vigenere => Ok((sentinel, vigenere_encrypt(message, key)?)),
        CipherType::Aes => {
            let (ciphertext, iv) = encrypt_aes_cbc(message, key)?;
            Ok((iv.to_vec(), ciphertext))
        }
        CipherType::Rsa => {
            let peer = require_peer(peer, cipher)?;
            Ok((sentinel, encrypt_for(peer, message).map_err(key_error)?))
        }
        CipherType::Fernet => Ok((sentinel, fernet_encrypt(message, key)?)),
    }
}

/// Decrypt a message with the selected cipher.
///
/// `identity` is only consulted for RSA.
pub fn decrypt_payload(
    cipher: CipherType,
    iv: &[u8],
    ciphertext: &[u8],
    key: &[u8],
    identity: &Identity,
) -> Result<Vec<u8>, EncryptionError> {
    match cipher {
        CipherType::Plaintext => Ok(ciphertext.to_vec()),
        CipherType::Rot13 => Ok(rot13(ciphertext)),
        CipherType::Vigenere => vigenere_decrypt(ciphertext, key),
        CipherType::Aes => decrypt_aes_cbc(ciphertext, key, iv),
        CipherType::Rsa => identity.decrypt(ciphertext).map_err(key_error),
        CipherType::Fernet => fernet_decrypt(ciphertext, key),
    }
}

/// Encrypt a chat message and wrap its key for the recipient
pub fn seal_payload(
    cipher: CipherType,
    message: &[u8],
    key: &[u8],
    peer: Option<&RsaPublicKey>,
) -> Result<SealedPayload, EncryptionError> {
    let (iv, ciphertext) = encrypt_payload(cipher, message, key, peer)?;

    let wrapped_key = if cipher.transports_key() {
        let peer = require_peer(peer, cipher)?;
        encrypt_for(peer, key).map_err(key_error)?
    } else {
        SENTINEL.to_vec()
    };

    trace!("Sealed {} byte {} payload into {} bytes", message.len(), cipher, ciphertext.len());
    Ok(SealedPayload {
        iv,
        wrapped_key,
        ciphertext,
    })
}

/// Unwrap the chat key with our identity and decrypt the message
pub fn open_payload(
    cipher: CipherType,
    payload: &SealedPayload,
    identity: &Identity,
) -> Result<Vec<u8>, EncryptionError> {
    let key = if cipher.transports_key() {
        identity.decrypt(&payload.wrapped_key).map_err(key_error)?
    } else {
        Vec::new()
    };

    decrypt_payload(cipher, &payload.iv, &payload.ciphertext, &key, identity)
}
