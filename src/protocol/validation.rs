// src/protocol/validation.rs
//! Protocol field validation.
//!
//! Checks applied to values taken off the wire before they are trusted.

use std::net::Ipv4Addr;

use crate::config::constants::{MAX_FRAME_SIZE, MAX_USERNAME_LEN};
use crate::protocol::types::MessageError;
use crate::utils::security::StringValidator;

/// Whether a string is a dotted-quad IPv4 address
pub fn is_valid_ipv4(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>().is_ok()
}

/// Validate an IP field claimed by a peer
pub fn validate_ip(ip: &str) -> Result<(), MessageError> {
    if is_valid_ipv4(ip) {
        Ok(())
    } else {
        Err(MessageError::InvalidValue(format!(
            "Invalid IPv4 address: {}",
            StringValidator::sanitize_log(ip)
        )))
    }
}

/// Validate a username submitted for account creation
pub fn validate_username(username: &str) -> Result<(), MessageError> {
    if username.is_empty() {
        return Err(MessageError::InvalidValue("Username is empty".into()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(MessageError::InvalidValue(format!(
            "Username longer than {} bytes",
            MAX_USERNAME_LEN
        )));
    }
    if !StringValidator::is_printable(username) {
        return Err(MessageError::InvalidValue("Username contains control characters".into()));
    }
    Ok(())
}

/// Validate the size of a raw frame before decoding
pub fn validate_frame_size(frame: &[u8]) -> Result<(), MessageError> {
    if frame.is_empty() {
        return Err(MessageError::InvalidFormat("Empty frame".into()));
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(MessageError::MessageTooLarge);
    }
    Ok(())
}
