// src/server/mod.rs
//! Server module for the message relay.
//!
//! This module provides the relay server, per-connection handling, the
//! session registry and chat message routing.

pub mod client;
pub mod core;
pub mod routing;
pub mod session;

// Re-export commonly used items
pub use client::handle_client;
pub use core::{RelayServer, ServerError, ServerState};
pub use routing::{PacketRouter, RouteOutcome};
pub use session::{ClientSession, OutboundLimits, SessionError, SessionManager};
