// src/crypto/keys.rs
//! RSA identity management.
//!
//! Every participant (the relay server and each client) holds one RSA-2048
//! identity. The private half is persisted as PKCS#8 PEM; the public half
//! travels on the wire as DER-encoded SubjectPublicKeyInfo.
//!
//! Signatures use RSA-PSS over SHA-256 with MGF1(SHA-256) and the maximum
//! salt length the key allows. Asymmetric encryption uses RSA-OAEP with
//! SHA-256 for both the digest and MGF1.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::constants::RSA_KEY_BITS;

/// SHA-256 output length, used by both the PSS and OAEP size rules
const DIGEST_LEN: usize = 32;

/// Error type for key-related operations
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Key format error: {0}")]
    Format(String),

    #[error("Invalid key data: {0}")]
    InvalidData(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Message too long for RSA-OAEP: {actual} bytes exceeds {max}")]
    MessageTooLong { max: usize, actual: usize },

    #[error("Signature verification failed")]
    SignatureVerification,
}

/// An RSA key pair together with its cached DER public encoding
pub struct Identity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_der: Vec<u8>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a fresh RSA-2048 identity
    pub fn generate() -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| KeyError::Crypto(format!("Key generation failed: {}", e)))?;
        Self::from_private_key(private_key)
    }

    /// Wrap an existing private key
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, KeyError> {
        let public_key = private_key.to_public_key();
        let public_der = public_key_to_der(&public_key)?;
        Ok(Self {
            private_key,
            public_key,
            public_der,
        })
    }

    /// Load an identity from file or generate and persist a new one
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref();
        if path.exists() {
            let identity = Self::load(path)?;
            info!("Loaded identity {} from {}", identity.fingerprint(), path.display());
            Ok(identity)
        } else {
            let identity = Self::generate()?;
            identity.save(path)?;
            info!("Generated new identity {} at {}", identity.fingerprint(), path.display());
            Ok(identity)
        }
    }

    /// Load an identity from a PKCS#8 PEM file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let pem = fs::read_to_string(path)?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| KeyError::Format(format!("Invalid PKCS#8 private key: {}", e)))?;
        Self::from_private_key(private_key)
    }

    /// Save the private key as PKCS#8 PEM
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), KeyError> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Format(format!("PEM encoding failed: {}", e)))?;

        let mut file = fs::File::create(path)?;
        file.write_all(pem.as_bytes())?;

        // Set restrictive permissions on Unix systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// The public key
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// The DER SubjectPublicKeyInfo encoding of the public key
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Short fingerprint for logging
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.public_der)
    }

    /// Sign a message with RSA-PSS/SHA-256
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let hashed = Sha256::digest(message);
        let padding = Pss::new_with_salt::<Sha256>(max_pss_salt_len(&self.public_key));
        self.private_key
            .sign_with_rng(&mut OsRng, padding, &hashed)
            .map_err(|e| KeyError::Crypto(format!("Signing failed: {}", e)))
    }

    /// Decrypt an RSA-OAEP ciphertext addressed to this identity
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| KeyError::Crypto(format!("OAEP decryption failed: {}", e)))
    }
}

/// Largest PSS salt for a key: `k - hLen - 2`
fn max_pss_salt_len(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(DIGEST_LEN + 2)
}

/// Largest plaintext RSA-OAEP/SHA-256 accepts for this key: `k - 2*hLen - 2`
pub fn max_oaep_message_len(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(2 * DIGEST_LEN + 2)
}

/// Encode a public key as DER SubjectPublicKeyInfo
pub fn public_key_to_der(key: &RsaPublicKey) -> Result<Vec<u8>, KeyError> {
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| KeyError::Format(format!("DER encoding failed: {}", e)))
}

/// Decode a DER SubjectPublicKeyInfo public key
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, KeyError> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|e| KeyError::InvalidData(format!("Invalid DER public key: {}", e)))
}

/// Verify an RSA-PSS/SHA-256 signature
pub fn verify_signature(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let hashed = Sha256::digest(message);
    let padding = Pss::new_with_salt::<Sha256>(max_pss_salt_len(key));
    match key.verify(padding, &hashed, signature) {
        Ok(()) => true,
        Err(e) => {
            debug!("Signature verification failed: {}", e);
            false
        }
    }
}

/// Encrypt a short message to a public key with RSA-OAEP/SHA-256
pub fn encrypt_for(key: &RsaPublicKey, message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let max = max_oaep_message_len(key);
    if message.len() > max {
        return Err(KeyError::MessageTooLong {
            max,
            actual: message.len(),
        });
    }

    key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), message)
        .map_err(|e| KeyError::Crypto(format!("OAEP encryption failed: {}", e)))
}

/// Compute a key fingerprint (for logging/identification)
pub fn compute_fingerprint(public_der: &[u8]) -> String {
    let hash = Sha256::digest(public_der);
    hex::encode(&hash[0..4])
}
