// src/crypto/fernet.rs
//! Fernet authenticated encryption.
//!
//! Token layout before base64url encoding:
//!
//! ```text
//! 0x80 | timestamp (u64 BE) | IV (16) | AES-128-CBC/PKCS7 ciphertext | HMAC-SHA256 (32)
//! ```
//!
//! The key is the base64url encoding of 32 bytes: the first half signs,
//! the second half encrypts. Tokens and keys are exchanged as their ASCII
//! base64 text.

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::config::constants::{FERNET_VERSION, IV_SIZE};
use crate::crypto::encryption::{generate_iv, EncryptionError};
use crate::utils::current_timestamp_secs;

type Aes128CbcEnc = Encryptor<Aes128>;
type Aes128CbcDec = Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const FERNET_KEY_LEN: usize = 32;
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = 1 + 8 + IV_SIZE;

struct FernetKey {
    signing: [u8; 16],
    encryption: [u8; 16],
}

impl FernetKey {
    fn decode(key: &[u8]) -> Result<Self, EncryptionError> {
        let raw = base64::decode_config(trim_ascii(key), base64::URL_SAFE)
            .map_err(|e| EncryptionError::InvalidKey(format!("Fernet key is not base64url: {}", e)))?;

        if raw.len() != FERNET_KEY_LEN {
            return Err(EncryptionError::InvalidKeyLength {
                expected: FERNET_KEY_LEN,
                actual: raw.len(),
            });
        }

        let mut signing = [0u8; 16];
        let mut encryption = [0u8; 16];
        signing.copy_from_slice(&raw[..16]);
        encryption.copy_from_slice(&raw[16..]);
        Ok(Self { signing, encryption })
    }

    fn mac(&self) -> Result<HmacSha256, EncryptionError> {
        <HmacSha256 as Mac>::new_from_slice(&self.signing)
            .map_err(|_| EncryptionError::InvalidKeyLength { expected: 16, actual: self.signing.len() })
    }
}

fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(data.len());
    let end = data.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &data[start..end]
}

/// Generate a new Fernet key as base64url text
pub fn generate_fernet_key() -> String {
    let mut raw = [0u8; FERNET_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    base64::encode_config(raw, base64::URL_SAFE)
}

/// Encrypt into a Fernet token (base64url text as bytes)
pub fn fernet_encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    fernet_encrypt_at(plaintext, key, current_timestamp_secs(), &generate_iv())
}

fn fernet_encrypt_at(
    plaintext: &[u8],
    key: &[u8],
    timestamp: u64,
    iv: &[u8; IV_SIZE],
) -> Result<Vec<u8>, EncryptionError> {
    let key = FernetKey::decode(key)?;

    let encryptor = Aes128CbcEnc::new_from_slices(&key.encryption, iv)
        .map_err(|e| EncryptionError::EncryptionFailed(format!("Encryption setup failed: {}", e)))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len() + MAC_LEN);
    token.push(FERNET_VERSION);
    token.extend_from_slice(&timestamp.to_be_bytes());
    token.extend_from_slice(iv);
    token.extend_from_slice(&ciphertext);

    let mut mac = key.mac()?;
    mac.update(&token);
    token.extend_from_slice(&mac.finalize().into_bytes());

    Ok(base64::encode_config(token, base64::URL_SAFE).into_bytes())
}

/// Verify and decrypt a Fernet token.
///
/// Tokens do not expire.
pub fn fernet_decrypt(token: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let key = FernetKey::decode(key)?;

    let raw = base64::decode_config(trim_ascii(token), base64::URL_SAFE)
        .map_err(|e| EncryptionError::InvalidFormat(format!("Fernet token is not base64url: {}", e)))?;

    if raw.len() < HEADER_LEN + MAC_LEN + IV_SIZE {
        return Err(EncryptionError::InvalidFormat("Fernet token too short".into()));
    }
    if raw[0] != FERNET_VERSION {
        return Err(EncryptionError::InvalidFormat(format!(
            "Unknown Fernet version 0x{:02x}",
            raw[0]
        )));
    }

    let mac_offset = raw.len() - MAC_LEN;
    let mut mac = key.mac()?;
    mac.update(&raw[..mac_offset]);
    mac.verify_slice(&raw[mac_offset..])
        .map_err(|_| EncryptionError::AuthenticationFailed)?;

    let iv = &raw[9..HEADER_LEN];
    let ciphertext = &raw[HEADER_LEN..mac_offset];
    if ciphertext.len() % 16 != 0 {
        return Err(EncryptionError::InvalidFormat("Fernet ciphertext is not block aligned".into()));
    }

    let decryptor = Aes128CbcDec::new_from_slices(&key.encryption, iv)
        .map_err(|e| EncryptionError::DecryptionFailed(format!("Decryption setup failed: {}", e)))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| EncryptionError::DecryptionFailed(format!("Decryption failed: {}", e)))
}
