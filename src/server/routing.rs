// src/server/routing.rs
//! Chat message routing between sessions.
//!
//! The relay never opens chat payloads. A message from one session is
//! rewritten into the six-field relayed form, stamped with the sender's
//! claimed IP, and enveloped under the destination's own session key.
//! A destination that cannot take the envelope is evicted.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use crate::protocol::types::{ChatMessage, RelayedMessage, ServerReply};
use crate::server::session::{ClientSession, SessionManager};
use crate::utils::security::StringValidator;

/// Result of routing one chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the destination session
    Forwarded,
    /// No other session claims the destination IP
    NoDestination,
    /// The destination was found but could not take the envelope; it has
    /// been evicted
    DeliveryFailed,
}

/// Routing counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoutingStats {
    pub forwarded: u64,
    pub unroutable: u64,
    pub failed: u64,
}

/// Forwards chat messages between registered sessions
#[derive(Debug, Default)]
pub struct PacketRouter {
    forwarded: AtomicU64,
    unroutable: AtomicU64,
    failed: AtomicU64,
}

impl PacketRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `message` from `sender` to the session claiming its destination IP.
    ///
    /// The sender's own session is never a candidate, even when it claims
    /// the destination IP itself.
    pub async fn route_chat_message(
        &self,
        sender: &ClientSession,
        message: ChatMessage,
        sessions: &SessionManager,
    ) -> RouteOutcome {
        let destination = match sessions.find_by_ip(&message.destination_ip, sender.id).await {
            Some(session) => session,
            None => {
                debug!(
                    "No session for destination {} (from {})",
                    StringValidator::sanitize_log(&message.destination_ip),
                    sender.ip_address
                );
                self.unroutable.fetch_add(1, Ordering::Relaxed);
                return RouteOutcome::NoDestination;
            }
        };

        let relayed = RelayedMessage {
            sender_name: message.sender_name,
            sender_ip: sender.ip_address.clone(),
            cipher: message.cipher,
            payload: message.payload,
        };

        match destination.send_reply(&ServerReply::Relayed(relayed)) {
            Ok(()) => {
                trace!(
                    "Forwarded {} message from session {} to session {}",
                    message.cipher,
                    sender.id,
                    destination.id
                );
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Forwarded
            }
            Err(e) => {
                warn!("Failed to forward to session {}: {}", destination.id, e);
                self.failed.fetch_add(1, Ordering::Relaxed);
                sessions.evict(&destination).await;
                RouteOutcome::DeliveryFailed
            }
        }
    }

    /// Snapshot of the routing counters
    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
