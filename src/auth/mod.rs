// src/auth/mod.rs
//! Authentication module for the relay.
//!
//! This module provides the RSA handshake that authenticates both ends of a
//! connection, and the account store consulted for user registration and
//! public key lookup.

pub mod accounts;
pub mod handshake;

// Re-export commonly used items
pub use accounts::{hash_password, AccountStore, MemoryAccountStore, NewAccount};
pub use handshake::{client_handshake, server_handshake, ClientHandshakeState, HandshakeError};
