// src/config/constants.rs
//! Protocol constants and fixed settings.
//!
//! Sizes, separators and timing values shared by the relay server and the
//! client agent. Anything an operator may want to change lives in
//! [`crate::config::settings`] instead.

use std::time::Duration;

/// Cryptographic constants
pub const SESSION_KEY_SIZE: usize = 32;
pub const AES_KEY_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;
pub const RSA_KEY_BITS: usize = 2048;
pub const FERNET_VERSION: u8 = 0x80;

/// Rounds of SHA-256 applied to a password before it is sent to the server
pub const PASSWORD_HASH_ROUNDS: usize = 10_000;

/// Wire format
pub const FIELD_SEPARATOR: &[u8] = b"\r\n";
pub const SENTINEL: &[u8] = b"0";
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
pub const MAX_USERNAME_LEN: usize = 64;

/// Timing
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(500);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Envelopes a session may have waiting for its writer
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;
