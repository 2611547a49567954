// src/protocol/serialization.rs
//! Record and envelope serialization.
//!
//! Inner records are byte fields joined with `\r\n`. Each field is escaped
//! first (`\` becomes `\\`, CR becomes `\r`) so a field never contains a raw
//! CR and splitting on `\r\n` recovers exactly the original fields.
//!
//! After the handshake every record travels inside the transport envelope:
//!
//! ```text
//! IV (16 bytes) | "\r\n" | AES-256-CBC(session key, IV, record)
//! ```

use tracing::trace;

use crate::config::constants::{FIELD_SEPARATOR, IV_SIZE};
use crate::crypto::session::SessionKey;
use crate::protocol::types::{MessageError, Record};
use crate::protocol::validation::validate_frame_size;

const ESCAPE: u8 = b'\\';
const CR: u8 = b'\r';

/// Escape a single field
pub fn escape_field(field: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(field.len());
    for &byte in field {
        match byte {
            ESCAPE => escaped.extend_from_slice(b"\\\\"),
            CR => escaped.extend_from_slice(b"\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Reverse [`escape_field`]
pub fn unescape_field(field: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut out = Vec::with_capacity(field.len());
    let mut bytes = field.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(&ESCAPE) => out.push(ESCAPE),
            Some(&b'r') => out.push(CR),
            Some(&other) => {
                return Err(MessageError::InvalidFormat(format!(
                    "Invalid escape sequence \\{}",
                    other as char
                )))
            }
            None => return Err(MessageError::InvalidFormat("Dangling escape at end of field".into())),
        }
    }
    Ok(out)
}

/// Serialize a record to its wire bytes
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, field) in record.fields().iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(FIELD_SEPARATOR);
        }
        out.extend_from_slice(&escape_field(field));
    }
    out
}

/// Parse wire bytes into a record.
///
/// Escaped fields contain no raw CR, so every CR LF pair is a separator.
pub fn decode_record(data: &[u8]) -> Result<Record, MessageError> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == FIELD_SEPARATOR[0] && data[i + 1] == FIELD_SEPARATOR[1] {
            fields.push(unescape_field(&data[start..i])?);
            i += 2;
            start = i;
        } else {
            i += 1;
        }
    }
    fields.push(unescape_field(&data[start..])?);
    Ok(Record::new(fields))
}

/// Encrypt a record into a transport envelope
pub fn seal_envelope(record: &Record, session_key: &SessionKey) -> Result<Vec<u8>, MessageError> {
    let plaintext = encode_record(record);
    let (ciphertext, iv) = session_key.encrypt(&plaintext)?;

    let mut envelope = Vec::with_capacity(IV_SIZE + FIELD_SEPARATOR.len() + ciphertext.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(FIELD_SEPARATOR);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Decrypt a transport envelope back into a record.
///
/// The IV is binary and may itself contain CR LF, so the envelope is split
/// at the fixed IV length rather than searched for the separator.
pub fn open_envelope(envelope: &[u8], session_key: &SessionKey) -> Result<Record, MessageError> {
    validate_frame_size(envelope)?;
    let header = IV_SIZE + FIELD_SEPARATOR.len();
    if envelope.len() <= header {
        return Err(MessageError::InvalidFormat(format!(
            "Envelope too short: {} bytes",
            envelope.len()
        )));
    }
    if &envelope[IV_SIZE..header] != FIELD_SEPARATOR {
        return Err(MessageError::InvalidFormat("Missing separator after envelope IV".into()));
    }

    let plaintext = session_key.decrypt(&envelope[header..], &envelope[..IV_SIZE])?;
    decode_record(&plaintext)
}

/// Log record information (non-sensitive parts only)
pub fn log_record_info(record: &Record, is_incoming: bool) {
    let direction = if is_incoming { "Received" } else { "Sending" };
    match record.code() {
        Some(code) => trace!("{} {} record, {} fields", direction, code.name(), record.len()),
        None => trace!("{} uncoded record, {} fields", direction, record.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::CommandCode;
    use quickcheck::quickcheck;

    #[test]
    fn test_text_fields_unchanged() {
        let record = Record::with_code(CommandCode::PublicKey)
            .push("bob")
            .push("10.0.0.2")
            .push("0")
            .push("0");
        assert_eq!(encode_record(&record), b"20\r\nbob\r\n10.0.0.2\r\n0\r\n0".to_vec());
    }

    #[test]
    fn test_binary_fields_with_separator() {
        let record = Record::new(vec![
            b"100".to_vec(),
            vec![0x0d, 0x0a, 0x5c, 0x72, 0x0d],
            b"\\r".to_vec(),
            Vec::new(),
        ]);

        let encoded = encode_record(&record);
        let decoded = decode_record(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_invalid_escape_rejected() {
        assert!(unescape_field(b"abc\\x").is_err());
        assert!(unescape_field(b"abc\\").is_err());
        assert_eq!(unescape_field(b"a\\\\b\\rc").unwrap(), b"a\\b\rc".to_vec());
    }

    #[test]
    fn test_envelope_round_trip() {
        let key = SessionKey::generate();
        let record = Record::with_code(CommandCode::Success);

        let envelope = seal_envelope(&record, &key).unwrap();
        assert_eq!(&envelope[16..18], b"\r\n");
        assert_eq!((envelope.len() - 18) % 16, 0);

        assert_eq!(open_envelope(&envelope, &key).unwrap(), record);
    }

    #[test]
    fn test_envelope_fresh_iv() {
        let key = SessionKey::generate();
        let record = Record::with_code(CommandCode::Success);
        let a = seal_envelope(&record, &key).unwrap();
        let b = seal_envelope(&record, &key).unwrap();
        assert_ne!(a[..16], b[..16]);
    }

    #[test]
    fn test_envelope_rejects_malformed() {
        let key = SessionKey::generate();
        assert!(open_envelope(b"short", &key).is_err());

        let mut envelope = seal_envelope(&Record::with_code(CommandCode::Failure), &key).unwrap();
        envelope[16] = b'x';
        assert!(matches!(open_envelope(&envelope, &key), Err(MessageError::InvalidFormat(_))));

        // Truncated ciphertext is no longer block aligned
        let envelope = seal_envelope(&Record::with_code(CommandCode::Failure), &key).unwrap();
        assert!(matches!(
            open_envelope(&envelope[..envelope.len() - 1], &key),
            Err(MessageError::Crypto(_))
        ));
    }

    #[test]
    fn test_envelope_wrong_key() {
        let record = Record::with_code(CommandCode::Success)
            .push("some longer content so a wrong key scrambles several blocks");
        let envelope = seal_envelope(&record, &SessionKey::generate()).unwrap();

        match open_envelope(&envelope, &SessionKey::generate()) {
            Ok(decoded) => assert_ne!(decoded, record),
            Err(_) => {}
        }
    }

    quickcheck! {
        fn prop_record_round_trip(fields: Vec<Vec<u8>>) -> bool {
            // An empty record has no wire form distinct from one empty field
            if fields.is_empty() {
                return true;
            }
            let record = Record::new(fields);
            decode_record(&encode_record(&record)).map(|r| r == record).unwrap_or(false)
        }
    }
}
