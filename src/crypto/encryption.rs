// src/crypto/encryption.rs
//! Symmetric encryption utilities.
//!
//! AES-256-CBC with the relay's own padding scheme. The same primitive
//! protects the transport envelope (under the session key) and the AES
//! chat payload (under a per-peer chat key).
//!
//! Padding: for a plaintext of length `L`, `p = 16 - (L % 16) - 1` filler
//! bytes of ASCII `'0'` are appended, followed by the lowercase hex digit
//! of `p`. The padded length is always a multiple of 16 and at least one
//! byte longer than the input.

use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use rand::RngCore;
use thiserror::Error;
use tracing::trace;

use crate::config::constants::{AES_BLOCK_SIZE, AES_KEY_SIZE, IV_SIZE};

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

const PAD_FILLER: u8 = b'0';
const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Error type for encryption operations
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Message too long: {actual} bytes exceeds the {max} byte limit")]
    MessageTooLong { max: usize, actual: usize },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
}

/// Generate a random 16-byte initialization vector
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Generate a random 32-byte AES key
pub fn generate_aes_key() -> Vec<u8> {
    let mut key = vec![0u8; AES_KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Apply the relay padding to a message
pub fn pad_message(data: &[u8]) -> Vec<u8> {
    let pad = AES_BLOCK_SIZE - (data.len() % AES_BLOCK_SIZE) - 1;

    let mut padded = Vec::with_capacity(data.len() + pad + 1);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad, PAD_FILLER);
    padded.push(HEX_DIGITS[pad]);
    padded
}

/// Strip the relay padding from a decrypted message
pub fn unpad_message(mut data: Vec<u8>) -> Result<Vec<u8>, EncryptionError> {
    let last = *data
        .last()
        .ok_or_else(|| EncryptionError::InvalidPadding("empty input".into()))?;

    let pad = (last as char)
        .to_digit(16)
        .ok_or_else(|| EncryptionError::InvalidPadding(format!("trailer byte 0x{:02x} is not a hex digit", last)))?
        as usize;

    if pad + 1 > data.len() {
        return Err(EncryptionError::InvalidPadding(format!(
            "padding of {} bytes exceeds message of {} bytes",
            pad + 1,
            data.len()
        )));
    }

    data.truncate(data.len() - pad - 1);
    Ok(data)
}

fn check_key_and_iv(key: &[u8], iv: &[u8]) -> Result<(), EncryptionError> {
    if key.len() != AES_KEY_SIZE {
        return Err(EncryptionError::InvalidKeyLength {
            expected: AES_KEY_SIZE,
            actual: key.len(),
        });
    }
    if iv.len() != IV_SIZE {
        return Err(EncryptionError::InvalidIvLength {
            expected: IV_SIZE,
            actual: iv.len(),
        });
    }
    Ok(())
}

/// Encrypt with AES-256-CBC under a fresh random IV.
///
/// Returns `(ciphertext, iv)`.
pub fn encrypt_aes_cbc(plaintext: &[u8], key: &[u8]) -> Result<(Vec<u8>, [u8; IV_SIZE]), EncryptionError> {
    let iv = generate_iv();
    let ciphertext = encrypt_aes_cbc_with_iv(plaintext, key, &iv)?;
    Ok((ciphertext, iv))
}

/// Encrypt with AES-256-CBC under a caller-provided IV
pub fn encrypt_aes_cbc_with_iv(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    check_key_and_iv(key, iv)?;

    let encryptor = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| EncryptionError::EncryptionFailed(format!("Encryption setup failed: {}", e)))?;

    let padded = pad_message(plaintext);
    let ciphertext = encryptor.encrypt_padded_vec_mut::<NoPadding>(&padded);

    trace!("AES-CBC encrypted {} bytes into {} bytes", plaintext.len(), ciphertext.len());
    Ok(ciphertext)
}

/// Decrypt AES-256-CBC ciphertext and strip the relay padding
pub fn decrypt_aes_cbc(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    check_key_and_iv(key, iv)?;

    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(EncryptionError::InvalidFormat(format!(
            "Ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            AES_BLOCK_SIZE
        )));
    }

    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| EncryptionError::DecryptionFailed(format!("Decryption setup failed: {}", e)))?;

    let padded = decryptor
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| EncryptionError::DecryptionFailed(format!("Decryption failed: {}", e)))?;

    unpad_message(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use test_case::test_case;

    #[test_case(0, 16 ; "empty input gets a full block")]
    #[test_case(1, 16 ; "single byte")]
    #[test_case(15, 16 ; "one short of a block")]
    #[test_case(16, 32 ; "exact block still grows")]
    #[test_case(33, 48 ; "spans three blocks")]
    fn test_padded_length(input_len: usize, padded_len: usize) {
        let padded = pad_message(&vec![b'x'; input_len]);
        assert_eq!(padded.len(), padded_len);
    }

    #[test]
    fn test_padding_layout() {
        let padded = pad_message(b"hello");
        // 16 - 5 - 1 = 10 filler bytes, trailer 'a'
        assert_eq!(&padded[..5], b"hello");
        assert_eq!(&padded[5..15], b"0000000000");
        assert_eq!(padded[15], b'a');

        let full = pad_message(&[7u8; 15]);
        assert_eq!(full[15], b'0');
    }

    #[test]
    fn test_encrypt_decrypt_aes_cbc() {
        let key = [3u8; 32];
        let data = b"The quick brown fox jumps over the lazy dog";

        let (ciphertext, iv) = encrypt_aes_cbc(data, &key).unwrap();
        assert_eq!(ciphertext.len() % 16, 0);
        assert_ne!(&ciphertext[..data.len().min(ciphertext.len())], &data[..]);

        let plaintext = decrypt_aes_cbc(&ciphertext, &key, &iv).unwrap();
        assert_eq!(plaintext, data.to_vec());
    }

    #[test]
    fn test_fixed_iv_is_deterministic() {
        let key = [5u8; 32];
        let iv = [9u8; 16];
        let a = encrypt_aes_cbc_with_iv(b"same", &key, &iv).unwrap();
        let b = encrypt_aes_cbc_with_iv(b"same", &key, &iv).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_key_and_iv_lengths() {
        let result = encrypt_aes_cbc(b"data", &[0u8; 16]);
        assert!(matches!(
            result,
            Err(EncryptionError::InvalidKeyLength { expected: 32, actual: 16 })
        ));

        let result = decrypt_aes_cbc(&[0u8; 16], &[0u8; 32], &[0u8; 8]);
        assert!(matches!(result, Err(EncryptionError::InvalidIvLength { .. })));
    }

    #[test]
    fn test_ciphertext_not_block_aligned() {
        let result = decrypt_aes_cbc(&[0u8; 17], &[1u8; 32], &[0u8; 16]);
        assert!(matches!(result, Err(EncryptionError::InvalidFormat(_))));

        let result = decrypt_aes_cbc(&[], &[1u8; 32], &[0u8; 16]);
        assert!(matches!(result, Err(EncryptionError::InvalidFormat(_))));
    }

    #[test]
    fn test_unpad_rejects_bad_trailer() {
        let result = unpad_message(b"abcdefghijklmnoz".to_vec());
        assert!(matches!(result, Err(EncryptionError::InvalidPadding(_))));

        // Trailer claims 16 bytes of padding in a 3-byte buffer
        let result = unpad_message(b"abf".to_vec());
        assert!(matches!(result, Err(EncryptionError::InvalidPadding(_))));
    }

    #[test]
    fn test_wrong_key_does_not_yield_plaintext() {
        let key = [1u8; 32];
        let (ciphertext, iv) = encrypt_aes_cbc(b"secret message", &key).unwrap();

        // CBC carries no authentication: a wrong key either fails the
        // padding check or produces garbage, never the original text
        match decrypt_aes_cbc(&ciphertext, &[2u8; 32], &iv) {
            Ok(plaintext) => assert_ne!(plaintext, b"secret message".to_vec()),
            Err(e) => assert!(matches!(e, EncryptionError::InvalidPadding(_))),
        }
    }

    quickcheck! {
        fn prop_padding_is_reversible(data: Vec<u8>) -> bool {
            let padded = pad_message(&data);
            padded.len() % 16 == 0
                && padded.len() > data.len()
                && unpad_message(padded).map(|d| d == data).unwrap_or(false)
        }

        fn prop_aes_cbc_round_trip(data: Vec<u8>) -> bool {
            let key = [0x42u8; 32];
            let (ciphertext, iv) = encrypt_aes_cbc(&data, &key).unwrap();
            decrypt_aes_cbc(&ciphertext, &key, &iv).map(|d| d == data).unwrap_or(false)
        }
    }
}
