// src/crypto/mod.rs
//! Cryptography module for the relay.
//!
//! This module provides RSA identities, the per-connection session key,
//! and the chat payload cipher suite.

pub mod classical;
pub mod encryption;
pub mod fernet;
pub mod keys;
pub mod payload;
pub mod session;

// Re-export commonly used items
pub use encryption::EncryptionError;
pub use keys::{Identity, KeyError};
pub use payload::{open_payload, seal_payload, CipherType, SealedPayload};
pub use session::SessionKey;
