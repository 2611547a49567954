// src/protocol/mod.rs
//! Protocol module for the relay.
//!
//! This module defines the wire records, their serialization, the
//! transport envelope and the TCP framing used between clients and the
//! relay server.

pub mod framing;
pub mod serialization;
pub mod types;
pub mod validation;

// Re-export commonly used items
pub use serialization::{decode_record, encode_record, open_envelope, seal_envelope};
pub use types::{CommandCode, MessageError, Record, Reply, Request, ServerReply};
