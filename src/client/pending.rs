// src/client/pending.rs
//! Pending request table.
//!
//! The relay answers account creation and chat forwarding with the same
//! bare `50`, and a key reply carries nothing tying it to the request. A
//! reply is therefore matched to the one outstanding request by kind, and
//! the agent allows a single outstanding request at a time.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::protocol::types::Reply;

/// What kind of answer a request expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Forward acknowledgement for a chat message
    Forward,
    /// Account creation verdict
    Account,
    /// Public key lookup result
    PublicKey,
}

impl ReplyKind {
    /// Whether `reply` can answer a request of this kind
    pub fn accepts(&self, reply: &Reply) -> bool {
        match self {
            Self::Forward | Self::Account => matches!(reply, Reply::Success | Reply::Failure),
            Self::PublicKey => matches!(reply, Reply::PublicKey(_)),
        }
    }
}

struct Pending {
    id: u64,
    kind: ReplyKind,
    sender: oneshot::Sender<Reply>,
}

/// Slot for the outstanding request
#[derive(Default)]
pub struct PendingReplies {
    slot: Mutex<Option<Pending>>,
    next_id: AtomicU64,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, replacing any stale one
    pub fn register(&self, kind: ReplyKind) -> (u64, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = oneshot::channel();
        let previous = self.slot.lock().replace(Pending { id, kind, sender });
        if let Some(previous) = previous {
            debug!("Request {} ({:?}) superseded by {}", previous.id, previous.kind, id);
        }
        (id, receiver)
    }

    /// Hand `reply` to the outstanding request if it expects one like it
    pub fn resolve(&self, reply: Reply) -> bool {
        let pending = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(pending) if pending.kind.accepts(&reply) => slot.take(),
                _ => None,
            }
        };

        match pending {
            Some(pending) => {
                trace!("Resolved request {} ({:?})", pending.id, pending.kind);
                pending.sender.send(reply).is_ok()
            }
            None => false,
        }
    }

    /// Drop request `id` if it is still outstanding
    pub fn cancel(&self, id: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map_or(false, |p| p.id == id) {
            slot.take();
        }
    }

    /// Drop whatever is outstanding
    pub fn cancel_all(&self) {
        self.slot.lock().take();
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait up to `window` for request `id` to be answered
    pub async fn wait(&self, id: u64, receiver: oneshot::Receiver<Reply>, window: Duration) -> Option<Reply> {
        match tokio::time::timeout(window, receiver).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                self.cancel(id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_matching_kind() {
        let pending = PendingReplies::new();
        let (id, rx) = pending.register(ReplyKind::PublicKey);

        // A bare acknowledgement does not answer a key request
        assert!(!pending.resolve(Reply::Success));
        assert!(pending.is_pending());

        assert!(pending.resolve(Reply::PublicKey(vec![1, 2])));
        assert!(!pending.is_pending());
        assert_eq!(
            pending.wait(id, rx, Duration::from_secs(1)).await,
            Some(Reply::PublicKey(vec![1, 2]))
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_and_clears() {
        let pending = PendingReplies::new();
        let (id, rx) = pending.register(ReplyKind::Forward);

        assert_eq!(pending.wait(id, rx, Duration::from_millis(20)).await, None);
        assert!(!pending.is_pending());

        // A late reply finds nobody waiting
        assert!(!pending.resolve(Reply::Success));
    }

    #[tokio::test]
    async fn test_cancel_only_matching_id() {
        let pending = PendingReplies::new();
        let (first, _rx1) = pending.register(ReplyKind::Account);
        let (second, rx2) = pending.register(ReplyKind::Account);
        assert_ne!(first, second);

        pending.cancel(first);
        assert!(pending.is_pending());

        assert!(pending.resolve(Reply::Failure));
        assert_eq!(pending.wait(second, rx2, Duration::from_secs(1)).await, Some(Reply::Failure));
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_waiter() {
        let pending = PendingReplies::new();
        let (id, rx) = pending.register(ReplyKind::Forward);
        pending.cancel_all();
        assert_eq!(pending.wait(id, rx, Duration::from_secs(5)).await, None);
    }

    #[test]
    fn test_reply_kind_accepts() {
        assert!(ReplyKind::Forward.accepts(&Reply::Success));
        assert!(ReplyKind::Account.accepts(&Reply::Failure));
        assert!(!ReplyKind::Forward.accepts(&Reply::PublicKey(vec![])));
        assert!(!ReplyKind::PublicKey.accepts(&Reply::Disconnect));
    }
}
