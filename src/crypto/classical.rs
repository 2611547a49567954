// src/crypto/classical.rs
//! Classical letter ciphers: ROT13 and Vigenère.
//!
//! Both work on raw bytes and touch only ASCII letters, preserving case.
//! Everything else passes through unchanged.

use crate::crypto::encryption::EncryptionError;

fn shift_letter(byte: u8, shift: u8) -> u8 {
    match byte {
        b'a'..=b'z' => b'a' + (byte - b'a' + shift) % 26,
        b'A'..=b'Z' => b'A' + (byte - b'A' + shift) % 26,
        _ => byte,
    }
}

/// ROT13; applying it twice restores the input
pub fn rot13(data: &[u8]) -> Vec<u8> {
    data.iter().map(|&b| shift_letter(b, 13)).collect()
}

/// Parse a Vigenère key into per-position shifts
fn vigenere_shifts(key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if key.is_empty() {
        return Err(EncryptionError::InvalidKey("Vigenère key is empty".into()));
    }

    key.iter()
        .map(|&b| {
            if b.is_ascii_alphabetic() {
                Ok(b.to_ascii_lowercase() - b'a')
            } else {
                Err(EncryptionError::InvalidKey(format!(
                    "Vigenère key byte 0x{:02x} is not an ASCII letter",
                    b
                )))
            }
        })
        .collect()
}

/// Vigenère encryption.
///
/// The key position advances on every input byte, letter or not, so
/// punctuation consumes key material but is itself left intact.
pub fn vigenere_encrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let shifts = vigenere_shifts(key)?;
    Ok(data
        .iter()
        .zip(shifts.iter().cycle())
        .map(|(&b, &s)| shift_letter(b, s))
        .collect())
}

/// Vigenère decryption
pub fn vigenere_decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let shifts = vigenere_shifts(key)?;
    Ok(data
        .iter()
        .zip(shifts.iter().cycle())
        .map(|(&b, &s)| shift_letter(b, (26 - s) % 26))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn test_rot13_known_vector() {
        assert_eq!(rot13(b"Hello, World!"), b"Uryyb, Jbeyq!".to_vec());
        assert_eq!(rot13(b""), Vec::<u8>::new());
    }

    #[test]
    fn test_rot13_leaves_non_ascii_alone() {
        let data = [0xc3, 0xa9, b'1', b'\r', b'\n', 0xff];
        assert_eq!(rot13(&data), data.to_vec());
    }

    #[test]
    fn test_vigenere_known_vector() {
        let ciphertext = vigenere_encrypt(b"ATTACKATDAWN", b"LEMON").unwrap();
        assert_eq!(ciphertext, b"LXFOPVEFRNHR".to_vec());

        // Key case does not matter
        let lower_key = vigenere_encrypt(b"ATTACKATDAWN", b"lemon").unwrap();
        assert_eq!(lower_key, ciphertext);

        let plaintext = vigenere_decrypt(&ciphertext, b"LEMON").unwrap();
        assert_eq!(plaintext, b"ATTACKATDAWN".to_vec());
    }

    #[test]
    fn test_vigenere_non_letters_consume_key() {
        let ciphertext = vigenere_encrypt(b"attack at dawn", b"lemon").unwrap();
        assert_eq!(ciphertext, b"lxfopv mh oeib".to_vec());
    }

    #[test]
    fn test_vigenere_rejects_bad_key() {
        assert!(matches!(vigenere_encrypt(b"abc", b""), Err(EncryptionError::InvalidKey(_))));
        assert!(matches!(vigenere_encrypt(b"abc", b"k3y"), Err(EncryptionError::InvalidKey(_))));
        assert!(vigenere_decrypt(b"abc", b"key!").is_err());
    }

    quickcheck! {
        fn prop_rot13_is_an_involution(data: Vec<u8>) -> bool {
            rot13(&rot13(&data)) == data
        }

        fn prop_vigenere_round_trip(data: Vec<u8>) -> bool {
            let ciphertext = vigenere_encrypt(&data, b"Secret").unwrap();
            vigenere_decrypt(&ciphertext, b"Secret").unwrap() == data
        }
    }
}
