// src/auth/accounts.rs
//! Account storage.
//!
//! The relay only needs two things from an account backend: create an
//! account and look up a user's public key. [`AccountStore`] is that seam;
//! [`MemoryAccountStore`] is the in-process implementation the server
//! binary uses.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::SystemTime;
use tracing::{debug, info};

use crate::config::constants::PASSWORD_HASH_ROUNDS;
use crate::utils::security::StringValidator;

/// Account creation request as received by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub username: String,
    /// Claimed IP of the connection that created the account
    pub ip: String,
    pub public_key_der: Vec<u8>,
    pub password_hash: String,
}

/// Backend for user accounts
pub trait AccountStore: Send + Sync {
    /// DER public key registered for `username`
    fn lookup_public_key(&self, username: &str) -> Option<Vec<u8>>;

    /// Store a new account; `false` if it could not be created
    fn store_account(&self, account: NewAccount) -> bool;
}

#[derive(Debug, Clone)]
struct StoredAccount {
    ip: String,
    public_key_der: Vec<u8>,
    password_hash: String,
    created_at: SystemTime,
}

/// In-memory account store; usernames are unique
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, StoredAccount>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored accounts
    pub fn account_count(&self) -> usize {
        self.accounts.lock().len()
    }

    /// Claimed IP recorded at creation time
    pub fn account_ip(&self, username: &str) -> Option<String> {
        self.accounts.lock().get(username).map(|a| a.ip.clone())
    }

    /// Whether `password_hash` matches the stored hash for `username`
    pub fn check_password_hash(&self, username: &str, password_hash: &str) -> bool {
        self.accounts
            .lock()
            .get(username)
            .map_or(false, |a| a.password_hash == password_hash)
    }

    /// When the account was created
    pub fn created_at(&self, username: &str) -> Option<SystemTime> {
        self.accounts.lock().get(username).map(|a| a.created_at)
    }
}

impl AccountStore for MemoryAccountStore {
    fn lookup_public_key(&self, username: &str) -> Option<Vec<u8>> {
        self.accounts.lock().get(username).map(|a| a.public_key_der.clone())
    }

    fn store_account(&self, account: NewAccount) -> bool {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(&account.username) {
            debug!(
                "Rejected duplicate account {}",
                StringValidator::sanitize_log(&account.username)
            );
            return false;
        }

        info!(
            "Created account {} for {}",
            StringValidator::sanitize_log(&account.username),
            account.ip
        );
        accounts.insert(
            account.username,
            StoredAccount {
                ip: account.ip,
                public_key_der: account.public_key_der,
                password_hash: account.password_hash,
                created_at: SystemTime::now(),
            },
        );
        true
    }
}

/// Hash a password for transport: SHA-256 applied repeatedly, hex encoded.
///
/// Unsalted, so equal passwords hash equally across users. Kept for wire
/// compatibility with existing account backends.
pub fn hash_password(password: &str) -> String {
    let mut digest = Sha256::digest(password.as_bytes());
    for _ in 1..PASSWORD_HASH_ROUNDS {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}
