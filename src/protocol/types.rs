// src/protocol/types.rs
//! Protocol record types for client-server communication.
//!
//! Every record is a list of byte fields. The first field usually carries
//! a decimal command code; relayed chat messages are the exception and are
//! recognised by their six-field shape. This module gives each record kind
//! a typed form and the conversions to and from [`Record`].

use thiserror::Error;

use crate::config::constants::SENTINEL;
use crate::crypto::encryption::EncryptionError;
use crate::crypto::payload::{CipherType, SealedPayload};

/// Error type for protocol message handling
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Wrong field count for {kind}: expected {expected}, got {actual}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown command code: {0}")]
    UnknownCommand(String),

    #[error("Invalid field value: {0}")]
    InvalidValue(String),

    #[error("Message too large")]
    MessageTooLarge,

    #[error("Envelope error: {0}")]
    Crypto(#[from] EncryptionError),
}

/// Command codes carried in the first record field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Disconnect,
    CreateAccount,
    PublicKey,
    Success,
    Failure,
    Handshake,
    ChatMessage,
}

impl CommandCode {
    /// ASCII decimal wire form
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Disconnect => b"0",
            Self::CreateAccount => b"10",
            Self::PublicKey => b"20",
            Self::Success => b"50",
            Self::Failure => b"55",
            Self::Handshake => b"100",
            Self::ChatMessage => b"200",
        }
    }

    pub fn from_field(field: &[u8]) -> Option<Self> {
        match field {
            b"0" => Some(Self::Disconnect),
            b"10" => Some(Self::CreateAccount),
            b"20" => Some(Self::PublicKey),
            b"50" => Some(Self::Success),
            b"55" => Some(Self::Failure),
            b"100" => Some(Self::Handshake),
            b"200" => Some(Self::ChatMessage),
            _ => None,
        }
    }

    /// Get the name of a command for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnect => "Disconnect",
            Self::CreateAccount => "CreateAccount",
            Self::PublicKey => "PublicKey",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Handshake => "Handshake",
            Self::ChatMessage => "ChatMessage",
        }
    }
}

/// An inner record: an ordered list of byte fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<Vec<u8>>,
}

impl Record {
    pub fn new(fields: Vec<Vec<u8>>) -> Self {
        Self { fields }
    }

    /// Start a record with a command code
    pub fn with_code(code: CommandCode) -> Self {
        Self::new(vec![code.as_bytes().to_vec()])
    }

    /// Append a field
    pub fn push(mut self, field: impl Into<Vec<u8>>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn fields(&self) -> &[Vec<u8>] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<Vec<u8>> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&[u8]> {
        self.fields.get(index).map(Vec::as_slice)
    }

    /// Command code in the first field, if it names one
    pub fn code(&self) -> Option<CommandCode> {
        self.field(0).and_then(CommandCode::from_field)
    }

    fn expect_len(&self, kind: &'static str, expected: usize) -> Result<(), MessageError> {
        if self.len() != expected {
            return Err(MessageError::FieldCount {
                kind,
                expected,
                actual: self.len(),
            });
        }
        Ok(())
    }
}

fn sentinel() -> Vec<u8> {
    SENTINEL.to_vec()
}

fn text_field(field: &[u8], name: &str) -> Result<String, MessageError> {
    String::from_utf8(field.to_vec())
        .map_err(|_| MessageError::InvalidValue(format!("{} is not valid UTF-8", name)))
}

fn cipher_field(field: &[u8]) -> Result<CipherType, MessageError> {
    CipherType::from_field(field).ok_or_else(|| {
        MessageError::InvalidValue(format!(
            "Unknown cipher type: {}",
            String::from_utf8_lossy(field)
        ))
    })
}

/// Build the five-field disconnect notice
pub fn create_disconnect_record() -> Record {
    Record::new(vec![sentinel(); 5])
}

/// A chat message as sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub destination_ip: String,
    pub sender_name: String,
    pub cipher: CipherType,
    pub payload: SealedPayload,
}

/// A chat message as delivered by the relay to its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    pub sender_name: String,
    pub sender_ip: String,
    pub cipher: CipherType,
    pub payload: SealedPayload,
}

impl RelayedMessage {
    pub const FIELD_COUNT: usize = 6;

    pub fn to_record(&self) -> Record {
        Record::new(vec![
            self.sender_name.as_bytes().to_vec(),
            self.sender_ip.as_bytes().to_vec(),
            self.cipher.to_field(),
            self.payload.iv.clone(),
            self.payload.wrapped_key.clone(),
            self.payload.ciphertext.clone(),
        ])
    }

    pub fn from_record(record: Record) -> Result<Self, MessageError> {
        record.expect_len("relayed message", Self::FIELD_COUNT)?;
        let mut fields = record.into_fields().into_iter();
        let mut next = || fields.next().unwrap_or_default();

        let sender_name = text_field(&next(), "sender name")?;
        let sender_ip = text_field(&next(), "sender IP")?;
        let cipher = cipher_field(&next())?;
        let payload = SealedPayload {
            iv: next(),
            wrapped_key: next(),
            ciphertext: next(),
        };

        Ok(Self {
            sender_name,
            sender_ip,
            cipher,
            payload,
        })
    }
}

/// Client to server requests after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Disconnect,
    CreateAccount {
        username: String,
        password_hash: String,
        sequence: u32,
    },
    PublicKeyRequest {
        name: String,
        ip: String,
    },
    ChatMessage(ChatMessage),
}

impl Request {
    pub fn to_record(&self) -> Record {
        match self {
            Self::Disconnect => create_disconnect_record(),
            Self::CreateAccount {
                username,
                password_hash,
                sequence,
            } => Record::with_code(CommandCode::CreateAccount)
                .push(username.as_bytes())
                .push(password_hash.as_bytes())
                .push(sequence.to_string())
                .push(sentinel()),
            Self::PublicKeyRequest { name, ip } => Record::with_code(CommandCode::PublicKey)
                .push(name.as_bytes())
                .push(ip.as_bytes())
                .push(sentinel())
                .push(sentinel()),
            Self::ChatMessage(msg) => Record::with_code(CommandCode::ChatMessage)
                .push(msg.destination_ip.as_bytes())
                .push(msg.sender_name.as_bytes())
                .push(msg.cipher.to_field())
                .push(msg.payload.iv.clone())
                .push(msg.payload.wrapped_key.clone())
                .push(msg.payload.ciphertext.clone()),
        }
    }

    pub fn from_record(record: Record) -> Result<Self, MessageError> {
        let code = record.code().ok_or_else(|| {
            MessageError::UnknownCommand(String::from_utf8_lossy(record.field(0).unwrap_or_default()).into_owned())
        })?;

        match code {
            CommandCode::Disconnect => {
                record.expect_len("disconnect", 5)?;
                Ok(Self::Disconnect)
            }
            CommandCode::CreateAccount => {
                record.expect_len("create account", 5)?;
                let fields = record.fields();
                let sequence = text_field(&fields[3], "sequence")?
                    .parse::<u32>()
                    .map_err(|_| MessageError::InvalidValue("sequence is not a 32-bit number".into()))?;
                Ok(Self::CreateAccount {
                    username: text_field(&fields[1], "username")?,
                    password_hash: text_field(&fields[2], "password hash")?,
                    sequence,
                })
            }
            CommandCode::PublicKey => {
                record.expect_len("key request", 5)?;
                let fields = record.fields();
                Ok(Self::PublicKeyRequest {
                    name: text_field(&fields[1], "name")?,
                    ip: text_field(&fields[2], "IP")?,
                })
            }
            CommandCode::ChatMessage => {
                record.expect_len("chat message", 7)?;
                let mut fields = record.into_fields().into_iter().skip(1);
                let mut next = || fields.next().unwrap_or_default();

                let destination_ip = text_field(&next(), "destination IP")?;
                let sender_name = text_field(&next(), "sender name")?;
                let cipher = cipher_field(&next())?;
                Ok(Self::ChatMessage(ChatMessage {
                    destination_ip,
                    sender_name,
                    cipher,
                    payload: SealedPayload {
                        iv: next(),
                        wrapped_key: next(),
                        ciphertext: next(),
                    },
                }))
            }
            other => Err(MessageError::UnknownCommand(format!(
                "{} is not a client request",
                other.name()
            ))),
        }
    }
}

/// Server to client events.
///
/// Forward and account confirmations share the wire code `50`; they are
/// distinct here so callers say which event they are acknowledging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    MessageForwarded,
    AccountCreated,
    AccountRejected,
    PublicKey(Vec<u8>),
    Relayed(RelayedMessage),
    Disconnect,
}

impl ServerReply {
    pub fn to_record(&self) -> Record {
        match self {
            Self::MessageForwarded | Self::AccountCreated => Record::with_code(CommandCode::Success),
            Self::AccountRejected => Record::with_code(CommandCode::Failure),
            Self::PublicKey(key) => Record::with_code(CommandCode::PublicKey)
                .push(key.clone())
                .push(sentinel()),
            Self::Relayed(message) => message.to_record(),
            Self::Disconnect => create_disconnect_record(),
        }
    }

    /// Name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageForwarded => "MessageForwarded",
            Self::AccountCreated => "AccountCreated",
            Self::AccountRejected => "AccountRejected",
            Self::PublicKey(_) => "PublicKey",
            Self::Relayed(_) => "Relayed",
            Self::Disconnect => "Disconnect",
        }
    }
}

/// A server record as seen by the client.
///
/// The wire does not say which request a `50` answers; the client pairs it
/// with whatever request is pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success,
    Failure,
    PublicKey(Vec<u8>),
    Relayed(RelayedMessage),
    Disconnect,
}

impl Reply {
    pub fn from_record(record: Record) -> Result<Self, MessageError> {
        if record.len() == RelayedMessage::FIELD_COUNT {
            return RelayedMessage::from_record(record).map(Self::Relayed);
        }

        match record.code() {
            Some(CommandCode::Success) => {
                record.expect_len("success", 1)?;
                Ok(Self::Success)
            }
            Some(CommandCode::Failure) => {
                record.expect_len("failure", 1)?;
                Ok(Self::Failure)
            }
            Some(CommandCode::PublicKey) => {
                record.expect_len("key reply", 3)?;
                Ok(Self::PublicKey(record.into_fields().swap_remove(1)))
            }
            Some(CommandCode::Disconnect) => {
                record.expect_len("disconnect", 5)?;
                Ok(Self::Disconnect)
            }
            _ => Err(MessageError::UnknownCommand(
                String::from_utf8_lossy(record.field(0).unwrap_or_default()).into_owned(),
            )),
        }
    }
}
