// src/client/mod.rs
//! Client session agent.
//!
//! Connects to the relay, runs the client side of the handshake and keeps
//! a receive task that delivers relayed chat messages to a
//! [`MessageHandler`] and hands control replies to whichever request is
//! waiting for one.

pub mod pending;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex as SyncMutex, RwLock};
use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::accounts::hash_password;
use crate::auth::handshake::{client_handshake, HandshakeError};
use crate::config::settings::{ClientConfig, ConfigError};
use crate::crypto::encryption::EncryptionError;
use crate::crypto::keys::{public_key_from_der, Identity, KeyError};
use crate::crypto::payload::{open_payload, seal_payload, CipherType};
use crate::crypto::session::SessionKey;
use crate::protocol::framing::{frame_connection, next_frame, send_frame, FrameRead, FrameSink, FrameSource};
use crate::protocol::serialization::{log_record_info, open_envelope, seal_envelope};
use crate::protocol::types::{create_disconnect_record, ChatMessage, MessageError, Record, RelayedMessage, Reply, Request};
use crate::protocol::validation::{validate_ip, validate_username};
use crate::utils::random_sequence;
use crate::utils::security::StringValidator;

use self::pending::{PendingReplies, ReplyKind};

/// Error type for client agent operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Protocol error: {0}")]
    Message(#[from] MessageError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Not connected")]
    NotConnected,

    #[error("No {cipher} key for peer {peer}")]
    MissingChatKey { peer: String, cipher: CipherType },
}

/// Outcome of a request that expects a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The relay answered `50`
    Confirmed,
    /// The relay answered `55`
    Refused,
    /// Nothing arrived within the wait window
    NoResponse,
}

impl Ack {
    fn from_reply(reply: Option<Reply>) -> Self {
        match reply {
            Some(Reply::Success) => Self::Confirmed,
            Some(Reply::Failure) => Self::Refused,
            _ => Self::NoResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A decrypted chat message delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender_ip: String,
    pub sender_name: String,
    /// Plaintext exactly as the sender passed it to `send`
    pub payload: Vec<u8>,
    pub cipher: CipherType,
}

impl InboundMessage {
    /// The payload as text, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Receives what the agent's receive task produces
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: InboundMessage);

    fn on_connection_status(&self, connected: bool);
}

/// Source of per-peer chat keys
pub trait ChatKeyStore: Send + Sync {
    /// Shared symmetric key agreed with `peer` for `cipher`
    fn lookup_chat_key(&self, peer: &str, cipher: CipherType) -> Option<Vec<u8>>;

    /// DER public key of `peer`
    fn lookup_peer_public_key(&self, peer: &str) -> Option<Vec<u8>>;
}

/// In-memory [`ChatKeyStore`] keyed by peer IP
#[derive(Debug, Default)]
pub struct MemoryChatKeys {
    chat_keys: SyncMutex<HashMap<(String, CipherType), Vec<u8>>>,
    public_keys: SyncMutex<HashMap<String, Vec<u8>>>,
}

impl MemoryChatKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_chat_key(&self, peer: impl Into<String>, cipher: CipherType, key: Vec<u8>) {
        self.chat_keys.lock().insert((peer.into(), cipher), key);
    }

    pub fn set_peer_public_key(&self, peer: impl Into<String>, der: Vec<u8>) {
        self.public_keys.lock().insert(peer.into(), der);
    }
}

impl ChatKeyStore for MemoryChatKeys {
    fn lookup_chat_key(&self, peer: &str, cipher: CipherType) -> Option<Vec<u8>> {
        self.chat_keys.lock().get(&(peer.to_string(), cipher)).cloned()
    }

    fn lookup_peer_public_key(&self, peer: &str) -> Option<Vec<u8>> {
        self.public_keys.lock().get(peer).cloned()
    }
}

type SharedState = Arc<SyncMutex<ConnectionState>>;

/// Move to `Disconnected`, telling the handler if we were connected
fn mark_disconnected(state: &SharedState, handler: &dyn MessageHandler) {
    let previous = std::mem::replace(&mut *state.lock(), ConnectionState::Disconnected);
    if previous == ConnectionState::Connected {
        handler.on_connection_status(false);
    }
}

/// A connected relay client
pub struct ClientAgent {
    config: ClientConfig,
    identity: Arc<Identity>,
    session_key: SessionKey,
    server_public_key: RsaPublicKey,
    claimed_ip: String,
    username: RwLock<String>,
    sender: Mutex<FrameSink>,
    /// Serializes requests; the relay's replies carry no request id
    request_gate: Mutex<()>,
    pending: Arc<PendingReplies>,
    handler: Arc<dyn MessageHandler>,
    connection_state: SharedState,
    cancel_flag: Arc<AtomicBool>,
    receive_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl ClientAgent {
    /// Load or create the identity at `config.key_file`, then [`connect`](Self::connect)
    pub async fn connect_with_key_file(
        config: ClientConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ClientError> {
        let key_file = config.key_file.clone();
        let identity = tokio::task::spawn_blocking(move || Identity::load_or_generate(&key_file))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                handler.on_connection_status(false);
                return Err(e.into());
            }
        };
        debug!("Client identity {} from {:?}", identity.fingerprint(), config.key_file);
        Self::connect(config, Arc::new(identity), handler).await
    }

    /// Connect, authenticate and start the receive task.
    ///
    /// The handler hears `on_connection_status(true)` on success and
    /// `false` if any step fails.
    pub async fn connect(
        config: ClientConfig,
        identity: Arc<Identity>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ClientError> {
        match Self::establish(config, identity, handler.clone()).await {
            Ok(agent) => {
                handler.on_connection_status(true);
                Ok(agent)
            }
            Err(e) => {
                warn!("Connection to relay failed: {}", e);
                handler.on_connection_status(false);
                Err(e)
            }
        }
    }

    async fn establish(
        config: ClientConfig,
        identity: Arc<Identity>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        info!("Connecting to relay at {}", config.server_addr);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.server_addr))
            .await
            .map_err(|_| ClientError::Timeout("connecting"))??;

        let claimed_ip = match &config.claimed_ip {
            Some(ip) => ip.clone(),
            None => local_ipv4(&stream)?,
        };

        let mut conn = frame_connection(stream);
        let established = client_handshake(&mut conn, identity.clone(), &claimed_ip, config.handshake_timeout).await?;
        info!("Connected to relay as {}", claimed_ip);

        let (sink, source) = conn.split::<Bytes>();
        let pending = Arc::new(PendingReplies::new());
        let connection_state = Arc::new(SyncMutex::new(ConnectionState::Connected));
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let receiver = ReceiveLoop {
            identity: identity.clone(),
            session_key: established.session_key.clone(),
            pending: pending.clone(),
            handler: handler.clone(),
            connection_state: connection_state.clone(),
            cancel_flag: cancel_flag.clone(),
            poll_interval: config.receive_poll_interval,
        };
        let receive_task = tokio::spawn(receiver.run(source));

        Ok(Self {
            username: RwLock::new(config.username.clone()),
            config,
            identity,
            session_key: established.session_key,
            server_public_key: established.server_public_key,
            claimed_ip,
            sender: Mutex::new(sink),
            request_gate: Mutex::new(()),
            pending,
            handler,
            connection_state,
            cancel_flag,
            receive_task: SyncMutex::new(Some(receive_task)),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connection_state.lock() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock()
    }

    /// Name placed in outgoing chat messages
    pub fn username(&self) -> String {
        self.username.read().clone()
    }

    /// IP announced during the handshake
    pub fn claimed_ip(&self) -> &str {
        &self.claimed_ip
    }

    pub fn server_public_key(&self) -> &RsaPublicKey {
        &self.server_public_key
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Send one record, bounded by the write timeout.
    ///
    /// A write that times out leaves a partial frame behind, so the
    /// connection is treated as lost.
    async fn send_record(&self, record: &Record) -> Result<(), ClientError> {
        log_record_info(record, false);
        let envelope = seal_envelope(record, &self.session_key)?;
        let mut sender = self.sender.lock().await;
        match tokio::time::timeout(self.config.write_timeout, send_frame(&mut *sender, envelope)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("Write to relay stalled for {:?}", self.config.write_timeout);
                self.cancel_flag.store(true, Ordering::SeqCst);
                self.pending.cancel_all();
                mark_disconnected(&self.connection_state, self.handler.as_ref());
                Err(ClientError::Timeout("sending to the relay"))
            }
        }
    }

    /// Send a request and wait up to `window` for a reply of `kind`
    async fn request(&self, request: &Request, kind: ReplyKind, window: Duration) -> Result<Option<Reply>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let _gate = self.request_gate.lock().await;
        let (id, receiver) = self.pending.register(kind);
        if let Err(e) = self.send_record(&request.to_record()).await {
            self.pending.cancel(id);
            return Err(e);
        }
        Ok(self.pending.wait(id, receiver, window).await)
    }

    /// Encrypt `message` with `cipher` and send it to the client claiming `destination_ip`.
    ///
    /// `key` is the shared chat key for the keyed ciphers; `peer_public_key`
    /// is required for RSA and for every cipher whose key travels wrapped.
    pub async fn send(
        &self,
        message: &[u8],
        destination_ip: &str,
        cipher: CipherType,
        key: &[u8],
        peer_public_key: Option<&RsaPublicKey>,
    ) -> Result<Ack, ClientError> {
        validate_ip(destination_ip)?;
        let payload = seal_payload(cipher, message, key, peer_public_key)?;

        let request = Request::ChatMessage(ChatMessage {
            destination_ip: destination_ip.to_string(),
            sender_name: self.username(),
            cipher,
            payload,
        });

        let reply = self.request(&request, ReplyKind::Forward, self.config.ack_window).await?;
        let ack = Ack::from_reply(reply);
        debug!("{} message to {}: {:?}", cipher, destination_ip, ack);
        Ok(ack)
    }

    /// Like [`send`](Self::send), resolving keys for `destination_ip` through `keys`
    pub async fn send_to_peer(
        &self,
        message: &[u8],
        destination_ip: &str,
        cipher: CipherType,
        keys: &dyn ChatKeyStore,
    ) -> Result<Ack, ClientError> {
        let missing = || ClientError::MissingChatKey {
            peer: destination_ip.to_string(),
            cipher,
        };

        let key = if cipher.transports_key() {
            keys.lookup_chat_key(destination_ip, cipher).ok_or_else(missing)?
        } else {
            Vec::new()
        };

        let peer_key = if cipher.needs_peer_key() {
            let der = keys.lookup_peer_public_key(destination_ip).ok_or_else(missing)?;
            Some(public_key_from_der(&der)?)
        } else {
            None
        };

        self.send(message, destination_ip, cipher, &key, peer_key.as_ref()).await
    }

    /// Ask the relay for `name`'s public key; `None` when nothing arrives in the key window
    pub async fn get_public_key(&self, name: &str, ip: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let request = Request::PublicKeyRequest {
            name: name.to_string(),
            ip: ip.to_string(),
        };

        match self.request(&request, ReplyKind::PublicKey, self.config.key_window).await? {
            Some(Reply::PublicKey(key)) => Ok(Some(key)),
            _ => {
                debug!("No public key for {}", StringValidator::sanitize_log(name));
                Ok(None)
            }
        }
    }

    /// Register `username` with this identity; on confirmation it becomes the sender name
    pub async fn create_account(&self, username: &str, password: &str) -> Result<Ack, ClientError> {
        validate_username(username)?;

        let request = Request::CreateAccount {
            username: username.to_string(),
            password_hash: hash_password(password),
            sequence: random_sequence(),
        };

        let ack = Ack::from_reply(
            self.request(&request, ReplyKind::Account, self.config.account_window)
                .await?,
        );
        if ack == Ack::Confirmed {
            info!("Account {} created", StringValidator::sanitize_log(username));
            *self.username.write() = username.to_string();
        }
        Ok(ack)
    }

    /// Tell the relay we are leaving, stop the receive task and close the socket.
    ///
    /// Also releases the socket and the receive task after the relay ended
    /// the session on its own.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            info!("Disconnecting from relay");
            if let Err(e) = self.send_record(&create_disconnect_record()).await {
                debug!("Could not send disconnect record: {}", e);
            }
        } else {
            debug!("Session already ended, releasing connection");
        }

        self.cancel_flag.store(true, Ordering::SeqCst);
        self.pending.cancel_all();
        mark_disconnected(&self.connection_state, self.handler.as_ref());

        {
            let mut sender = self.sender.lock().await;
            let _ = tokio::time::timeout(self.config.write_timeout, sender.close()).await;
        }

        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        info!("Disconnected from relay");
        Ok(())
    }
}

impl Drop for ClientAgent {
    fn drop(&mut self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }
}

/// Local IPv4 address of a connected socket
fn local_ipv4(stream: &TcpStream) -> Result<String, ClientError> {
    match stream.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip.to_string()),
        IpAddr::V6(ip) => ip.to_ipv4_mapped().map(|v4| v4.to_string()).ok_or_else(|| {
            ClientError::Config(ConfigError::Invalid(format!(
                "Local address {} is not IPv4; set claimed_ip",
                ip
            )))
        }),
    }
}

/// State owned by the receive task
struct ReceiveLoop {
    identity: Arc<Identity>,
    session_key: SessionKey,
    pending: Arc<PendingReplies>,
    handler: Arc<dyn MessageHandler>,
    connection_state: SharedState,
    cancel_flag: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl ReceiveLoop {
    async fn run(self, mut source: FrameSource) {
        while !self.cancel_flag.load(Ordering::SeqCst) {
            let frame = match next_frame(&mut source, self.poll_interval).await {
                Ok(FrameRead::Frame(frame)) => frame,
                Ok(FrameRead::TimedOut) => continue,
                Ok(FrameRead::Closed) => {
                    info!("Relay closed the connection");
                    break;
                }
                Err(e) => {
                    debug!("Connection to relay lost: {}", e);
                    break;
                }
            };

            if !self.handle_frame(&frame) {
                break;
            }
        }

        self.pending.cancel_all();
        mark_disconnected(&self.connection_state, self.handler.as_ref());
        trace!("Receive task finished");
    }

    /// Process one envelope; `false` ends the loop
    fn handle_frame(&self, frame: &[u8]) -> bool {
        let record = match open_envelope(frame, &self.session_key) {
            Ok(record) => record,
            Err(e) => {
                warn!("Discarding undecryptable envelope: {}", e);
                return true;
            }
        };
        log_record_info(&record, true);

        let reply = match Reply::from_record(record) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Discarding malformed reply: {}", e);
                return true;
            }
        };

        match reply {
            Reply::Relayed(message) => {
                self.deliver(message);
                true
            }
            Reply::Disconnect => {
                info!("Relay is shutting down");
                false
            }
            other => {
                if !self.pending.resolve(other) {
                    debug!("Unsolicited reply ignored");
                }
                true
            }
        }
    }

    fn deliver(&self, message: RelayedMessage) {
        match open_payload(message.cipher, &message.payload, &self.identity) {
            Ok(plaintext) => self.handler.on_message(InboundMessage {
                sender_ip: message.sender_ip,
                sender_name: message.sender_name,
                payload: plaintext,
                cipher: message.cipher,
            }),
            Err(e) => warn!(
                "Could not decrypt {} message from {}: {}",
                message.cipher,
                StringValidator::sanitize_log(&message.sender_ip),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::fixtures;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingHandler {
        statuses: SyncMutex<Vec<bool>>,
    }

    impl MessageHandler for RecordingHandler {
        fn on_message(&self, _message: InboundMessage) {}

        fn on_connection_status(&self, connected: bool) {
            self.statuses.lock().push(connected);
        }
    }

    #[test]
    fn test_ack_from_reply() {
        assert_eq!(Ack::from_reply(Some(Reply::Success)), Ack::Confirmed);
        assert_eq!(Ack::from_reply(Some(Reply::Failure)), Ack::Refused);
        assert_eq!(Ack::from_reply(None), Ack::NoResponse);
    }

    #[test]
    fn test_memory_chat_keys() {
        let keys = MemoryChatKeys::new();
        keys.set_chat_key("10.0.0.2", CipherType::Aes, vec![7; 32]);
        keys.set_peer_public_key("10.0.0.2", vec![0x30]);

        assert_eq!(keys.lookup_chat_key("10.0.0.2", CipherType::Aes), Some(vec![7; 32]));
        assert_eq!(keys.lookup_chat_key("10.0.0.2", CipherType::Fernet), None);
        assert_eq!(keys.lookup_peer_public_key("10.0.0.2"), Some(vec![0x30]));
        assert_eq!(keys.lookup_peer_public_key("10.0.0.3"), None);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_status() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let handler = Arc::new(RecordingHandler::default());
        let mut config = ClientConfig::new(addr.to_string());
        config.claimed_ip = Some("10.0.0.1".to_string());

        let result = ClientAgent::connect(config, fixtures::identity(0), handler.clone()).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
        assert_eq!(*handler.statuses.lock(), vec![false]);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let handler = Arc::new(RecordingHandler::default());
        let mut config = ClientConfig::new(addr.to_string());
        config.claimed_ip = Some("10.0.0.1".to_string());
        config.handshake_timeout = Duration::from_millis(100);

        let result = ClientAgent::connect(config, fixtures::identity(0), handler.clone()).await;
        assert!(matches!(result, Err(ClientError::Handshake(HandshakeError::Timeout))));
        assert_eq!(*handler.statuses.lock(), vec![false]);
    }

    #[test]
    fn test_inbound_text_accessor() {
        let mut message = InboundMessage {
            sender_ip: "10.0.0.1".to_string(),
            sender_name: "alice".to_string(),
            payload: "héllo".as_bytes().to_vec(),
            cipher: CipherType::Plaintext,
        };
        assert_eq!(message.text(), Some("héllo"));

        message.payload = vec![0xff, 0xfe, b'a'];
        assert_eq!(message.text(), None);
    }

    #[tokio::test]
    async fn test_invalid_claimed_ip_rejected() {
        let handler = Arc::new(RecordingHandler::default());
        let mut config = ClientConfig::new("127.0.0.1:1");
        config.claimed_ip = Some("not-an-ip".to_string());

        let result = ClientAgent::connect(config, fixtures::identity(0), handler).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
