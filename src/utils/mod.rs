// src/utils/mod.rs
//! Utility functions and helpers.
//!
//! This module contains general-purpose utilities used across
//! the application.

pub mod logging;
pub mod security;

use rand::{thread_rng, Rng};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current timestamp in seconds
pub fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// Random 32-bit sequence number for account requests
pub fn random_sequence() -> u32 {
    thread_rng().gen()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        // 2023-01-01T00:00:00Z
        assert!(current_timestamp_secs() > 1_672_531_200);
    }
}
