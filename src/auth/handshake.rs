// src/auth/handshake.rs
//! Mutual RSA handshake and session key transfer.
//!
//! ```text
//! client -> server   {100, claimedIP, clientDER, 0, sig}
//! server -> client   {100, serverDER, 0, sig}
//! client -> server   {OAEP(serverKey, {100, 0, sessionKey}), sig}
//! ```
//!
//! Each signature is RSA-PSS over the encoded record that precedes it
//! (for the last message, over the raw ciphertext). The server stays
//! silent on any failure; the caller just drops the connection.
//!
//! The message building and checking is kept free of I/O so both sides
//! can be exercised without sockets; [`client_handshake`] and
//! [`server_handshake`] drive it over a framed connection.

use bytes::BytesMut;
use rsa::RsaPublicKey;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::crypto::keys::{encrypt_for, public_key_from_der, verify_signature, Identity, KeyError};
use crate::crypto::session::SessionKey;
use crate::protocol::framing::{next_frame, send_frame, FrameRead, FramedConnection};
use crate::protocol::serialization::{decode_record, encode_record};
use crate::protocol::types::{CommandCode, MessageError, Record};
use crate::protocol::validation::is_valid_ipv4;
use crate::utils::security::StringValidator;

/// Error type for handshake failures
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake step timed out")]
    Timeout,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Malformed handshake message: {0}")]
    Malformed(String),

    #[error("Invalid claimed IP: {0}")]
    InvalidIp(String),

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Protocol error: {0}")]
    Message(#[from] MessageError),

    #[error("Handshake step out of order in state {0:?}")]
    OutOfOrder(ClientHandshakeState),
}

/// Client side progress through the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHandshakeState {
    Idle,
    SentIdentity,
    VerifiedServer,
    SessionSent,
    Established,
    Failed,
}

/// What the client ends up with
#[derive(Debug)]
pub struct EstablishedSession {
    pub session_key: SessionKey,
    pub server_public_key: RsaPublicKey,
}

/// The identity a client presented in its first message
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub claimed_ip: String,
    pub public_key: RsaPublicKey,
    pub public_key_der: Vec<u8>,
}

/// What the server ends up with
#[derive(Debug)]
pub struct PeerHandshake {
    pub hello: ClientHello,
    pub session_key: SessionKey,
}

/// Append a signature over the encoded record as its last field
fn sign_record(record: Record, identity: &Identity) -> Result<Vec<u8>, HandshakeError> {
    let signature = identity.sign(&encode_record(&record))?;
    Ok(encode_record(&record.push(signature)))
}

/// Split off the trailing signature and check it against `key`.
///
/// Re-encoding the remaining fields reproduces the signed bytes because
/// field escaping is deterministic.
fn check_signed_record(record: Record, key: &RsaPublicKey) -> Result<Record, HandshakeError> {
    let mut fields = record.into_fields();
    let signature = fields
        .pop()
        .ok_or_else(|| HandshakeError::Malformed("missing signature".into()))?;
    let signed = Record::new(fields);

    if !verify_signature(key, &encode_record(&signed), &signature) {
        return Err(HandshakeError::BadSignature);
    }
    Ok(signed)
}

fn expect_handshake_code(record: &Record) -> Result<(), HandshakeError> {
    if record.code() != Some(CommandCode::Handshake) {
        return Err(HandshakeError::Malformed("first field is not 100".into()));
    }
    Ok(())
}

/// Check the client's identity message (server side, step 2)
pub fn verify_client_identity(message: &[u8]) -> Result<ClientHello, HandshakeError> {
    let record = decode_record(message)?;
    if record.len() != 5 {
        return Err(HandshakeError::Malformed(format!(
            "identity message has {} fields, expected 5",
            record.len()
        )));
    }
    expect_handshake_code(&record)?;

    let ip_field = record.field(1).unwrap_or_default();
    let claimed_ip = std::str::from_utf8(ip_field)
        .ok()
        .filter(|ip| is_valid_ipv4(ip))
        .map(str::to_string)
        .ok_or_else(|| HandshakeError::InvalidIp(StringValidator::sanitize_bytes(ip_field)))?;

    let public_key_der = record.field(2).unwrap_or_default().to_vec();
    let public_key = public_key_from_der(&public_key_der)?;

    check_signed_record(record, &public_key)?;

    Ok(ClientHello {
        claimed_ip,
        public_key,
        public_key_der,
    })
}

/// Build the server's signed reply (server side, step 3)
pub fn build_server_hello(identity: &Identity) -> Result<Vec<u8>, HandshakeError> {
    let record = Record::with_code(CommandCode::Handshake)
        .push(identity.public_key_der())
        .push(&b"0"[..]);
    sign_record(record, identity)
}

/// Check the server's reply (client side, step 4)
pub fn verify_server_hello(message: &[u8]) -> Result<RsaPublicKey, HandshakeError> {
    let record = decode_record(message)?;
    if record.len() != 4 {
        return Err(HandshakeError::Malformed(format!(
            "server hello has {} fields, expected 4",
            record.len()
        )));
    }
    expect_handshake_code(&record)?;

    let server_key = public_key_from_der(record.field(1).unwrap_or_default())?;
    check_signed_record(record, &server_key)?;
    Ok(server_key)
}

/// Unwrap the session key transfer (server side, step 5)
pub fn open_session_transfer(
    message: &[u8],
    identity: &Identity,
    client_key: &RsaPublicKey,
) -> Result<SessionKey, HandshakeError> {
    let record = decode_record(message)?;
    if record.len() != 2 {
        return Err(HandshakeError::Malformed(format!(
            "session transfer has {} fields, expected 2",
            record.len()
        )));
    }

    let mut fields = record.into_fields();
    let signature = fields.pop().unwrap_or_default();
    let ciphertext = fields.pop().unwrap_or_default();
    if !verify_signature(client_key, &ciphertext, &signature) {
        return Err(HandshakeError::BadSignature);
    }

    let inner = decode_record(&identity.decrypt(&ciphertext)?)?;
    if inner.len() != 3 || inner.code() != Some(CommandCode::Handshake) || inner.field(1) != Some(&b"0"[..]) {
        return Err(HandshakeError::Malformed("session key record has the wrong shape".into()));
    }

    SessionKey::from_slice(inner.field(2).unwrap_or_default())
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}

/// Client handshake state machine
pub struct ClientHandshake {
    identity: Arc<Identity>,
    claimed_ip: String,
    state: ClientHandshakeState,
    server_key: Option<RsaPublicKey>,
    session_key: Option<SessionKey>,
}

impl ClientHandshake {
    pub fn new(identity: Arc<Identity>, claimed_ip: impl Into<String>) -> Result<Self, HandshakeError> {
        let claimed_ip = claimed_ip.into();
        if !is_valid_ipv4(&claimed_ip) {
            return Err(HandshakeError::InvalidIp(claimed_ip));
        }
        Ok(Self {
            identity,
            claimed_ip,
            state: ClientHandshakeState::Idle,
            server_key: None,
            session_key: None,
        })
    }

    pub fn state(&self) -> ClientHandshakeState {
        self.state
    }

    fn expect_state(&mut self, expected: ClientHandshakeState) -> Result<(), HandshakeError> {
        if self.state != expected {
            let actual = self.state;
            self.state = ClientHandshakeState::Failed;
            return Err(HandshakeError::OutOfOrder(actual));
        }
        Ok(())
    }

    fn advance<T>(
        &mut self,
        next: ClientHandshakeState,
        result: Result<T, HandshakeError>,
    ) -> Result<T, HandshakeError> {
        self.state = if result.is_ok() { next } else { ClientHandshakeState::Failed };
        trace!("Client handshake now {:?}", self.state);
        result
    }

    /// Step 1: the signed identity message
    pub fn identity_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.expect_state(ClientHandshakeState::Idle)?;
        let record = Record::with_code(CommandCode::Handshake)
            .push(self.claimed_ip.as_bytes())
            .push(self.identity.public_key_der())
            .push(&b"0"[..]);
        let result = sign_record(record, &self.identity);
        self.advance(ClientHandshakeState::SentIdentity, result)
    }

    /// Step 4a: verify the server's reply
    pub fn receive_server_hello(&mut self, message: &[u8]) -> Result<(), HandshakeError> {
        self.expect_state(ClientHandshakeState::SentIdentity)?;
        let result = verify_server_hello(message).map(|key| {
            self.server_key = Some(key);
        });
        self.advance(ClientHandshakeState::VerifiedServer, result)
    }

    /// Step 4b: generate the session key and wrap it for the server
    pub fn session_key_message(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.expect_state(ClientHandshakeState::VerifiedServer)?;
        let result = self.build_session_transfer();
        self.advance(ClientHandshakeState::SessionSent, result)
    }

    fn build_session_transfer(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let server_key = self
            .server_key
            .as_ref()
            .ok_or(HandshakeError::OutOfOrder(self.state))?;

        let session_key = SessionKey::generate();
        let inner = Record::with_code(CommandCode::Handshake)
            .push(&b"0"[..])
            .push(session_key.as_bytes());
        let ciphertext = encrypt_for(server_key, &encode_record(&inner))?;
        let signature = self.identity.sign(&ciphertext)?;

        self.session_key = Some(session_key);
        Ok(encode_record(&Record::new(vec![ciphertext, signature])))
    }

    /// Step 5: hand over the established session
    pub fn finish(&mut self) -> Result<EstablishedSession, HandshakeError> {
        self.expect_state(ClientHandshakeState::SessionSent)?;
        let result = match (self.session_key.take(), self.server_key.take()) {
            (Some(session_key), Some(server_public_key)) => Ok(EstablishedSession {
                session_key,
                server_public_key,
            }),
            _ => Err(HandshakeError::OutOfOrder(self.state)),
        };
        self.advance(ClientHandshakeState::Established, result)
    }
}

async fn recv_step(conn: &mut FramedConnection, step_timeout: Duration) -> Result<BytesMut, HandshakeError> {
    match next_frame(conn, step_timeout).await? {
        FrameRead::Frame(frame) => Ok(frame),
        FrameRead::TimedOut => Err(HandshakeError::Timeout),
        FrameRead::Closed => Err(HandshakeError::Closed),
    }
}

async fn send_step(conn: &mut FramedConnection, message: Vec<u8>, step_timeout: Duration) -> Result<(), HandshakeError> {
    tokio::time::timeout(step_timeout, send_frame(conn, message))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    Ok(())
}

/// Run the client side of the handshake over a fresh connection
pub async fn client_handshake(
    conn: &mut FramedConnection,
    identity: Arc<Identity>,
    claimed_ip: &str,
    step_timeout: Duration,
) -> Result<EstablishedSession, HandshakeError> {
    let mut handshake = ClientHandshake::new(identity, claimed_ip)?;

    send_step(conn, handshake.identity_message()?, step_timeout).await?;

    let server_hello = recv_step(conn, step_timeout).await?;
    handshake.receive_server_hello(&server_hello)?;
    debug!("Server identity verified");

    send_step(conn, handshake.session_key_message()?, step_timeout).await?;

    handshake.finish()
}

/// Run the server side of the handshake over a freshly accepted connection
pub async fn server_handshake(
    conn: &mut FramedConnection,
    identity: &Identity,
    step_timeout: Duration,
) -> Result<PeerHandshake, HandshakeError> {
    let message = recv_step(conn, step_timeout).await?;
    let hello = verify_client_identity(&message)?;
    debug!("Client identity verified for claimed IP {}", hello.claimed_ip);

    send_step(conn, build_server_hello(identity)?, step_timeout).await?;

    let transfer = recv_step(conn, step_timeout).await?;
    let session_key = open_session_transfer(&transfer, identity, &hello.public_key)?;

    Ok(PeerHandshake { hello, session_key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::fixtures;
    use crate::protocol::framing::frame_connection;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_sans_io_handshake() {
        let client_identity = fixtures::identity(0);
        let server_identity = fixtures::identity(1);

        let mut client = ClientHandshake::new(client_identity.clone(), "10.0.0.1").unwrap();
        assert_eq!(client.state(), ClientHandshakeState::Idle);

        let hello = client.identity_message().unwrap();
        assert_eq!(client.state(), ClientHandshakeState::SentIdentity);

        let verified = verify_client_identity(&hello).unwrap();
        assert_eq!(verified.claimed_ip, "10.0.0.1");
        assert_eq!(verified.public_key_der, client_identity.public_key_der());

        client.receive_server_hello(&build_server_hello(&server_identity).unwrap()).unwrap();
        assert_eq!(client.state(), ClientHandshakeState::VerifiedServer);

        let transfer = client.session_key_message().unwrap();
        let server_side = open_session_transfer(&transfer, &server_identity, &verified.public_key).unwrap();

        let established = client.finish().unwrap();
        assert_eq!(client.state(), ClientHandshakeState::Established);
        assert_eq!(established.session_key, server_side);
        assert_eq!(&established.server_public_key, server_identity.public_key());
    }

    #[test]
    fn test_identity_with_foreign_key_rejected() {
        let signer = fixtures::identity(0);
        let impostor = fixtures::identity(1);

        // Signed by one key while advertising another
        let record = Record::with_code(CommandCode::Handshake)
            .push(&b"10.0.0.1"[..])
            .push(impostor.public_key_der())
            .push(&b"0"[..]);
        let message = sign_record(record, &signer).unwrap();

        assert!(matches!(verify_client_identity(&message), Err(HandshakeError::BadSignature)));
    }

    #[test]
    fn test_identity_with_bad_ip_rejected() {
        let identity = fixtures::identity(0);
        let record = Record::with_code(CommandCode::Handshake)
            .push(&b"10.0.0.256"[..])
            .push(identity.public_key_der())
            .push(&b"0"[..]);
        let message = sign_record(record, &identity).unwrap();

        assert!(matches!(verify_client_identity(&message), Err(HandshakeError::InvalidIp(_))));
        assert!(ClientHandshake::new(identity, "localhost").is_err());
    }

    #[test]
    fn test_identity_wrong_shape_rejected() {
        assert!(matches!(verify_client_identity(b"100\r\n10.0.0.1"), Err(HandshakeError::Malformed(_))));
        assert!(verify_client_identity(b"").is_err());
    }

    #[test]
    fn test_tampered_server_hello_fails_client() {
        let client_identity = fixtures::identity(0);
        let server_identity = fixtures::identity(1);

        let mut client = ClientHandshake::new(client_identity, "10.0.0.1").unwrap();
        client.identity_message().unwrap();

        let mut reply = build_server_hello(&server_identity).unwrap();
        // Flip a byte inside the DER key
        reply[40] ^= 0x01;

        assert!(client.receive_server_hello(&reply).is_err());
        assert_eq!(client.state(), ClientHandshakeState::Failed);
        assert!(matches!(client.session_key_message(), Err(HandshakeError::OutOfOrder(_))));
    }

    #[test]
    fn test_steps_out_of_order() {
        let mut client = ClientHandshake::new(fixtures::identity(0), "10.0.0.1").unwrap();
        assert!(matches!(client.finish(), Err(HandshakeError::OutOfOrder(ClientHandshakeState::Idle))));
        assert_eq!(client.state(), ClientHandshakeState::Failed);
    }

    #[test]
    fn test_session_transfer_signed_by_wrong_key() {
        let client_identity = fixtures::identity(0);
        let server_identity = fixtures::identity(1);
        let other = fixtures::identity(2);

        let mut client = ClientHandshake::new(client_identity, "10.0.0.1").unwrap();
        client.identity_message().unwrap();
        client.receive_server_hello(&build_server_hello(&server_identity).unwrap()).unwrap();
        let transfer = client.session_key_message().unwrap();

        assert!(matches!(
            open_session_transfer(&transfer, &server_identity, other.public_key()),
            Err(HandshakeError::BadSignature)
        ));
    }

    #[test]
    fn test_short_session_key_rejected() {
        let client_identity = fixtures::identity(0);
        let server_identity = fixtures::identity(1);

        let inner = Record::with_code(CommandCode::Handshake)
            .push(&b"0"[..])
            .push(vec![7u8; 31]);
        let ciphertext = encrypt_for(server_identity.public_key(), &encode_record(&inner)).unwrap();
        let signature = client_identity.sign(&ciphertext).unwrap();
        let transfer = encode_record(&Record::new(vec![ciphertext, signature]));

        assert!(matches!(
            open_session_transfer(&transfer, &server_identity, client_identity.public_key()),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_over_tcp() {
        let client_identity = fixtures::identity(0);
        let server_identity = fixtures::identity(1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = frame_connection(stream);
            server_handshake(&mut conn, &server_identity, Duration::from_secs(5)).await
        });

        let mut conn = frame_connection(TcpStream::connect(addr).await.unwrap());
        let established = client_handshake(&mut conn, client_identity, "10.9.8.7", Duration::from_secs(5))
            .await
            .unwrap();

        let peer = server.await.unwrap().unwrap();
        assert_eq!(peer.hello.claimed_ip, "10.9.8.7");
        assert_eq!(peer.session_key, established.session_key);
    }

    #[tokio::test]
    async fn test_server_step_timeout() {
        let server_identity = fixtures::identity(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Connect and stay silent
        let _silent = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = frame_connection(stream);

        let result = server_handshake(&mut conn, &server_identity, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(HandshakeError::Timeout)));
    }
}
