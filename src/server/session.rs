// src/server/session.rs
//! Client sessions and the session registry.
//!
//! A session exists only for a connection that completed the handshake.
//! Outgoing envelopes go through a bounded queue drained by the session's
//! own writer task, so forwarding to a client that stopped reading never
//! blocks the connection that is forwarding.

use futures::SinkExt;
use parking_lot::Mutex as SyncMutex;
use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::config::constants::{OUTBOUND_QUEUE_DEPTH, WRITE_TIMEOUT};
use crate::crypto::session::SessionKey;
use crate::protocol::framing::{send_frame, FrameSink};
use crate::protocol::serialization::{log_record_info, open_envelope, seal_envelope};
use crate::protocol::types::{MessageError, Record, ServerReply};
use crate::protocol::validation::validate_frame_size;

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Message(#[from] MessageError),

    #[error("Session {0} is not reading; outbound queue full")]
    Stalled(u64),

    #[error("Session {0} is closed")]
    Closed(u64),
}

/// Bounds on a session's outbound path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundLimits {
    /// Envelopes that may wait for the writer
    pub queue_depth: usize,
    /// Longest a single frame write may take
    pub write_timeout: Duration,
}

impl Default for OutboundLimits {
    fn default() -> Self {
        Self {
            queue_depth: OUTBOUND_QUEUE_DEPTH,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// An authenticated client connection
pub struct ClientSession {
    /// Registry-unique id, increasing with registration order
    pub id: u64,
    /// Transport peer address
    pub address: SocketAddr,
    /// IP the client claimed during the handshake
    pub ip_address: String,
    pub public_key: RsaPublicKey,
    pub public_key_der: Vec<u8>,
    session_key: SessionKey,
    outbound: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
    writer: SyncMutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Create a session and spawn the writer that owns `sink`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        address: SocketAddr,
        ip_address: String,
        public_key: RsaPublicKey,
        public_key_der: Vec<u8>,
        session_key: SessionKey,
        sink: FrameSink,
        limits: OutboundLimits,
    ) -> Self {
        let (outbound, queue) = mpsc::channel(limits.queue_depth.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(write_outbound(id, sink, queue, limits.write_timeout, closed.clone()));

        Self {
            id,
            address,
            ip_address,
            public_key,
            public_key_der,
            session_key,
            outbound,
            closed,
            writer: SyncMutex::new(Some(writer)),
        }
    }

    /// Envelope a record under this session's key and queue it.
    ///
    /// Fails at once with [`SessionError::Stalled`] when the client has
    /// left too many envelopes unread.
    pub fn send_record(&self, record: &Record) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id));
        }
        log_record_info(record, false);
        let envelope = seal_envelope(record, &self.session_key)?;
        validate_frame_size(&envelope)?;

        self.outbound.try_send(Outbound::Frame(envelope)).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::Stalled(self.id),
            TrySendError::Closed(_) => SessionError::Closed(self.id),
        })
    }

    /// Send a server event to this client
    pub fn send_reply(&self, reply: &ServerReply) -> Result<(), SessionError> {
        debug!("Sending {} to session {}", reply.name(), self.id);
        self.send_record(&reply.to_record())
    }

    /// Decrypt an envelope received from this client
    pub fn open(&self, envelope: &[u8]) -> Result<Record, SessionError> {
        let record = open_envelope(envelope, &self.session_key)?;
        log_record_info(&record, true);
        Ok(record)
    }

    /// Whether the session was closed or its writer gave up
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting envelopes; already queued ones are still written.
    ///
    /// When the queue is full the writer is aborted instead.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.outbound.try_send(Outbound::Close).is_err() {
            if let Some(writer) = self.writer.lock().take() {
                writer.abort();
            }
        }
    }
}

/// Drain `queue` into `sink` until closed, a write fails or a write stalls
async fn write_outbound(
    id: u64,
    mut sink: FrameSink,
    mut queue: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    closed: Arc<AtomicBool>,
) {
    let mut healthy = true;
    while let Some(item) = queue.recv().await {
        let frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Close => break,
        };
        match time::timeout(write_timeout, send_frame(&mut sink, frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write to session {} failed: {}", id, e);
                healthy = false;
                break;
            }
            Err(_) => {
                warn!("Write to session {} stalled for {:?}", id, write_timeout);
                healthy = false;
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    queue.close();
    if healthy {
        let _ = time::timeout(write_timeout, sink.close()).await;
    }
    trace!("Writer for session {} finished", id);
}

/// Registry of authenticated sessions
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<u64, Arc<ClientSession>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the id for a session about to be registered
    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a new session
    pub async fn add_session(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.lock().await;
        info!(
            "Registered session {} for {} (claimed IP {})",
            session.id, session.address, session.ip_address
        );
        sessions.insert(session.id, session);
    }

    /// Remove a session by id
    pub async fn remove_session(&self, id: u64) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.lock().await.remove(&id);
        if removed.is_some() {
            debug!("Removed session {}", id);
        }
        removed
    }

    /// Deregister and close a session that can no longer take envelopes
    pub async fn evict(&self, session: &ClientSession) {
        if self.remove_session(session.id).await.is_some() {
            warn!("Evicted session {} ({})", session.id, session.ip_address);
        }
        session.close();
    }

    /// Find the session for a claimed IP, skipping `exclude_id`.
    ///
    /// Claimed IPs are not unique; the most recently registered match wins.
    pub async fn find_by_ip(&self, ip: &str, exclude_id: u64) -> Option<Arc<ClientSession>> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|s| s.id != exclude_id && s.ip_address == ip)
            .max_by_key(|s| s.id)
            .cloned()
    }

    /// Count active sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Notify every client, close its connection and clear the registry
    pub async fn close_all_sessions(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();

        for session in &sessions {
            if let Err(e) = session.send_reply(&ServerReply::Disconnect) {
                warn!("Failed to send disconnect to session {}: {}", session.id, e);
            }
            session.close();
        }

        info!("Closed {} active sessions", sessions.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::fixtures;
    use crate::protocol::framing::{frame_connection, next_frame, FrameRead, FrameSource, FramedConnection};
    use crate::protocol::types::CommandCode;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (FramedConnection, FramedConnection, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_stream, peer_addr) = accepted.unwrap();
        (frame_connection(server_stream), frame_connection(client.unwrap()), peer_addr)
    }

    fn session_over(
        id: u64,
        ip: &str,
        conn: FramedConnection,
        peer: SocketAddr,
        limits: OutboundLimits,
    ) -> (Arc<ClientSession>, SessionKey) {
        let (sink, _server_source) = conn.split::<Bytes>();
        let identity = fixtures::identity(0);
        let key = SessionKey::generate();
        let session = Arc::new(ClientSession::new(
            id,
            peer,
            ip.to_string(),
            identity.public_key().clone(),
            identity.public_key_der().to_vec(),
            key.clone(),
            sink,
            limits,
        ));
        (session, key)
    }

    /// A registered-looking session plus the peer's read half and key
    async fn session_pair(id: u64, ip: &str) -> (Arc<ClientSession>, FrameSource, SessionKey) {
        let (server_conn, client_conn, peer) = connected_pair().await;
        let (_client_sink, client_source) = client_conn.split::<Bytes>();
        let (session, key) = session_over(id, ip, server_conn, peer, OutboundLimits::default());
        (session, client_source, key)
    }

    #[tokio::test]
    async fn test_find_by_ip_excludes_sender_and_prefers_latest() {
        let manager = SessionManager::new();
        let (a, _ra, _) = session_pair(manager.next_session_id(), "10.0.0.1").await;
        let (b, _rb, _) = session_pair(manager.next_session_id(), "10.0.0.2").await;
        let (c, _rc, _) = session_pair(manager.next_session_id(), "10.0.0.2").await;

        manager.add_session(a.clone()).await;
        manager.add_session(b.clone()).await;
        manager.add_session(c.clone()).await;
        assert_eq!(manager.session_count().await, 3);

        assert_eq!(manager.find_by_ip("10.0.0.2", a.id).await.map(|s| s.id), Some(c.id));
        assert_eq!(manager.find_by_ip("10.0.0.2", c.id).await.map(|s| s.id), Some(b.id));
        assert!(manager.find_by_ip("10.0.0.1", a.id).await.is_none());
        assert!(manager.find_by_ip("10.0.0.9", a.id).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_and_evict() {
        let manager = SessionManager::new();
        let (a, _ra, _) = session_pair(manager.next_session_id(), "10.0.0.1").await;
        let (b, _rb, _) = session_pair(manager.next_session_id(), "10.0.0.2").await;
        manager.add_session(a.clone()).await;
        manager.add_session(b.clone()).await;

        assert!(manager.remove_session(a.id).await.is_some());
        assert!(manager.remove_session(a.id).await.is_none());

        manager.evict(&b).await;
        assert_eq!(manager.session_count().await, 0);
        assert!(b.is_closed());
        assert!(matches!(
            b.send_reply(&ServerReply::MessageForwarded),
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_reply_is_enveloped() {
        let (session, mut source, key) = session_pair(1, "10.0.0.1").await;
        session.send_reply(&ServerReply::MessageForwarded).unwrap();

        match next_frame(&mut source, Duration::from_secs(2)).await.unwrap() {
            FrameRead::Frame(frame) => {
                let record = open_envelope(&frame, &key).unwrap();
                assert_eq!(record.code(), Some(CommandCode::Success));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_all_sessions_notifies() {
        let manager = SessionManager::new();
        let (a, mut source, key) = session_pair(manager.next_session_id(), "10.0.0.1").await;
        manager.add_session(a).await;

        manager.close_all_sessions().await;
        assert_eq!(manager.session_count().await, 0);

        match next_frame(&mut source, Duration::from_secs(2)).await.unwrap() {
            FrameRead::Frame(frame) => {
                let record = open_envelope(&frame, &key).unwrap();
                assert_eq!(record.len(), 5);
                assert_eq!(record.code(), Some(CommandCode::Disconnect));
            }
            other => panic!("unexpected {:?}", other),
        }
        // Writer closed the connection after the disconnect record
        assert!(matches!(
            next_frame(&mut source, Duration::from_secs(2)).await.unwrap(),
            FrameRead::Closed
        ));
    }

    #[tokio::test]
    async fn test_unread_session_stalls_without_blocking() {
        let (server_conn, _client_conn, peer) = connected_pair().await;
        let limits = OutboundLimits {
            queue_depth: 2,
            write_timeout: Duration::from_millis(200),
        };
        let (session, _) = session_over(1, "10.0.0.2", server_conn, peer, limits);

        // The peer never reads: every send returns immediately and the
        // session eventually refuses further envelopes.
        let record = Record::new(vec![b"11".to_vec(), vec![b'a'; 48_000]]);
        let refused = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                match session.send_record(&record) {
                    Ok(()) => tokio::task::yield_now().await,
                    Err(e) => break e,
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(refused, SessionError::Stalled(_) | SessionError::Closed(_)));
    }
}
