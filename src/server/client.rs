// src/server/client.rs
//! Client connection handling.
//!
//! This module handles individual client connections: the handshake,
//! session registration and the request loop.

use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::auth::accounts::{AccountStore, NewAccount};
use crate::auth::handshake::server_handshake;
use crate::crypto::keys::Identity;
use crate::protocol::framing::{frame_connection, next_frame, FrameRead, FrameSource};
use crate::protocol::types::{Request, ServerReply};
use crate::protocol::validation::validate_username;
use crate::server::core::{ServerError, ServerState};
use crate::server::routing::{PacketRouter, RouteOutcome};
use crate::server::session::{ClientSession, OutboundLimits, SessionManager};
use crate::utils::logging::log_security_event;
use crate::utils::security::StringValidator;

/// Shared server state handed to every connection task
#[derive(Clone)]
pub struct ClientContext {
    pub identity: Arc<Identity>,
    pub session_manager: Arc<SessionManager>,
    pub packet_router: Arc<PacketRouter>,
    pub accounts: Arc<dyn AccountStore>,
    pub server_state: Arc<RwLock<ServerState>>,
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
    pub outbound: OutboundLimits,
}

/// Handle a client connection from accept to close.
///
/// Runs inside the connection's own task, so a slow handshake only holds
/// up its own client.
pub async fn handle_client(stream: TcpStream, addr: SocketAddr, ctx: ClientContext) -> Result<(), ServerError> {
    let mut conn = frame_connection(stream);

    let peer = match server_handshake(&mut conn, &ctx.identity, ctx.handshake_timeout).await {
        Ok(peer) => peer,
        Err(e) => {
            log_security_event("HANDSHAKE_REJECTED", &format!("{}: {}", addr, e));
            return Err(e.into());
        }
    };

    if *ctx.server_state.read().await != ServerState::Running {
        debug!("Dropping {} after handshake: server not running", addr);
        return Ok(());
    }

    let (sink, source) = conn.split::<Bytes>();
    let session = Arc::new(ClientSession::new(
        ctx.session_manager.next_session_id(),
        addr,
        peer.hello.claimed_ip,
        peer.hello.public_key,
        peer.hello.public_key_der,
        peer.session_key,
        sink,
        ctx.outbound,
    ));
    ctx.session_manager.add_session(session.clone()).await;

    let result = process_client_session(&session, source, &ctx).await;

    ctx.session_manager.remove_session(session.id).await;
    session.close();
    info!("Session {} for {} ended", session.id, addr);

    result
}

/// Receive loop for an authenticated session
async fn process_client_session(
    session: &Arc<ClientSession>,
    mut source: FrameSource,
    ctx: &ClientContext,
) -> Result<(), ServerError> {
    loop {
        if *ctx.server_state.read().await != ServerState::Running {
            debug!("Server stopping, leaving loop for session {}", session.id);
            return Ok(());
        }
        if session.is_closed() {
            debug!("Session {} closed, leaving loop", session.id);
            return Ok(());
        }

        let frame = match next_frame(&mut source, ctx.poll_interval).await {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::TimedOut) => continue,
            Ok(FrameRead::Closed) => {
                info!("Client {} closed the connection", session.address);
                return Ok(());
            }
            Err(e) => {
                debug!("Connection error for session {}: {}", session.id, e);
                return Ok(());
            }
        };
        let record = match session.open(&frame) {
            Ok(record) => record,
            Err(e) => {
                warn!("Discarding undecryptable envelope from session {}: {}", session.id, e);
                continue;
            }
        };

        let request = match Request::from_record(record) {
            Ok(request) => request,
            Err(e) => {
                warn!("Discarding malformed request from session {}: {}", session.id, e);
                continue;
            }
        };

        match request {
            Request::Disconnect => {
                info!("Session {} requested disconnect", session.id);
                return Ok(());
            }
            Request::CreateAccount {
                username,
                password_hash,
                sequence,
            } => {
                trace!("Account request {} from session {}", sequence, session.id);
                let created = validate_username(&username).is_ok()
                    && ctx.accounts.store_account(NewAccount {
                        username,
                        ip: session.ip_address.clone(),
                        public_key_der: session.public_key_der.clone(),
                        password_hash,
                    });
                let reply = if created {
                    ServerReply::AccountCreated
                } else {
                    ServerReply::AccountRejected
                };
                session.send_reply(&reply)?;
            }
            Request::PublicKeyRequest { name, ip } => match ctx.accounts.lookup_public_key(&name) {
                Some(key) => session.send_reply(&ServerReply::PublicKey(key))?,
                None => debug!(
                    "No key for {} ({}), not replying",
                    StringValidator::sanitize_log(&name),
                    StringValidator::sanitize_log(&ip)
                ),
            },
            Request::ChatMessage(message) => {
                let outcome = ctx
                    .packet_router
                    .route_chat_message(session, message, &ctx.session_manager)
                    .await;
                if outcome == RouteOutcome::Forwarded {
                    session.send_reply(&ServerReply::MessageForwarded)?;
                }
            }
        }
    }
}
