// Export all modules for public use
pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod server;
pub mod utils;

// Re-export the most commonly used items for convenience
pub use crate::auth::{AccountStore, MemoryAccountStore};
pub use crate::client::{Ack, ChatKeyStore, ClientAgent, ClientError, InboundMessage, MessageHandler};
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::crypto::{CipherType, Identity};
pub use crate::server::{RelayServer, ServerError, ServerState};
