// src/server/core.rs
//! Core relay server implementation.
//!
//! This module contains the relay server that accepts connections, hands
//! each to its own task and coordinates graceful shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::auth::accounts::AccountStore;
use crate::auth::handshake::HandshakeError;
use crate::config::constants::{ACCEPT_POLL_INTERVAL, DISCONNECT_GRACE};
use crate::config::settings::ServerConfig;
use crate::crypto::keys::{Identity, KeyError};
use crate::protocol::types::MessageError;
use crate::server::client::{handle_client, ClientContext};
use crate::server::routing::PacketRouter;
use crate::server::session::{OutboundLimits, SessionError, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] MessageError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Initial state
    Created,
    /// Server is starting up
    Starting,
    /// Server is running
    Running,
    /// Server is shutting down
    ShuttingDown,
    /// Server has stopped
    Stopped,
}

/// The message relay
pub struct RelayServer {
    /// Server configuration
    pub config: ServerConfig,
    /// Server signing identity
    identity: Arc<Identity>,
    /// Account backend
    accounts: Arc<dyn AccountStore>,
    /// Registered client sessions
    session_manager: Arc<SessionManager>,
    /// Chat message router
    packet_router: Arc<PacketRouter>,
    /// Server state
    state: Arc<RwLock<ServerState>>,
    /// Address actually bound, once started
    local_addr: Mutex<Option<SocketAddr>>,
    /// Accept loop handle
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, identity: Arc<Identity>, accounts: Arc<dyn AccountStore>) -> Self {
        info!("Initializing relay server (identity {})", identity.fingerprint());
        Self {
            config,
            identity,
            accounts,
            session_manager: Arc::new(SessionManager::new()),
            packet_router: Arc::new(PacketRouter::new()),
            state: Arc::new(RwLock::new(ServerState::Created)),
            local_addr: Mutex::new(None),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when listening on port 0.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Created && *state != ServerState::Stopped {
                return Err(ServerError::Internal(format!("Cannot start server in state {:?}", *state)));
            }
            *state = ServerState::Starting;
        }

        info!("Starting relay server on {}", self.config.listen_addr);

        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind to {}: {}", self.config.listen_addr, e);
                *self.state.write().await = ServerState::Stopped;
                return Err(e.into());
            }
        };
        let bound = listener.local_addr()?;
        *self.local_addr.lock().await = Some(bound);

        {
            let mut state = self.state.write().await;
            if *state != ServerState::Starting {
                return Err(ServerError::Internal("Server state changed during bind".into()));
            }
            *state = ServerState::Running;
        }
        info!("Server listening on {}", bound);

        let ctx = ClientContext {
            identity: self.identity.clone(),
            session_manager: self.session_manager.clone(),
            packet_router: self.packet_router.clone(),
            accounts: self.accounts.clone(),
            server_state: self.state.clone(),
            handshake_timeout: self.config.handshake_timeout,
            poll_interval: self.config.receive_poll_interval,
            outbound: OutboundLimits {
                queue_depth: self.config.outbound_queue_depth,
                write_timeout: self.config.write_timeout,
            },
        };
        let handle = tokio::spawn(accept_loop(listener, ctx));
        self.task_handles.lock().await.push(handle);

        Ok(bound)
    }

    /// Disconnect every client and stop accepting connections
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.write().await;
            if *state == ServerState::ShuttingDown || *state == ServerState::Stopped {
                info!("Server already shutting down or stopped.");
                return Ok(());
            }
            if *state != ServerState::Running {
                warn!("Shutting down server in state {:?}", *state);
            }
            info!("Shutting down relay server");
            *state = ServerState::ShuttingDown;
        }

        info!("Closing active client sessions...");
        self.session_manager.close_all_sessions().await;
        time::sleep(DISCONNECT_GRACE).await;

        {
            let mut handles = self.task_handles.lock().await;
            for handle in handles.drain(..) {
                handle.abort();
            }
        }

        let stats = self.packet_router.stats();
        info!(
            "Routing totals: {} forwarded, {} unroutable, {} failed",
            stats.forwarded, stats.unroutable, stats.failed
        );

        *self.state.write().await = ServerState::Stopped;
        info!("Server shutdown complete.");
        Ok(())
    }

    pub async fn get_state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Bound listen address, if started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.session_manager.clone()
    }
}

async fn accept_loop(listener: TcpListener, ctx: ClientContext) {
    loop {
        let current_state = *ctx.server_state.read().await;
        if current_state != ServerState::Running {
            info!("Server state is {:?}, stopping accept loop.", current_state);
            break;
        }

        let accepted = match time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(accepted) => accepted,
            Err(_) => continue,
        };

        match accepted {
            Ok((stream, addr)) => {
                trace!("Accepted connection from {}", addr);
                let client_ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, addr, client_ctx).await {
                        match e {
                            ServerError::Handshake(_) => {
                                debug!("Client {} failed the handshake: {}", addr, e);
                            }
                            ServerError::Session(_) | ServerError::Io(_) => {
                                debug!("Client {} dropped: {}", addr, e);
                            }
                            _ => {
                                error!("Error handling client {}: {}", addr, e);
                            }
                        }
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::accounts::MemoryAccountStore;
    use crate::crypto::keys::fixtures;

    fn test_server() -> RelayServer {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        RelayServer::new(config, fixtures::identity(1), Arc::new(MemoryAccountStore::new()))
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let server = test_server();
        assert_eq!(server.get_state().await, ServerState::Created);
        assert!(server.local_addr().await.is_none());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.get_state().await, ServerState::Running);
        assert_eq!(server.local_addr().await, Some(addr));

        // Starting twice is refused
        assert!(matches!(server.start().await, Err(ServerError::Internal(_))));

        server.shutdown().await.unwrap();
        assert_eq!(server.get_state().await, ServerState::Stopped);

        // Shutdown is idempotent
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_stops_server() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            listen_addr: occupied.local_addr().unwrap(),
            ..ServerConfig::default()
        };
        let server = RelayServer::new(config, fixtures::identity(1), Arc::new(MemoryAccountStore::new()));

        assert!(matches!(server.start().await, Err(ServerError::Io(_))));
        assert_eq!(server.get_state().await, ServerState::Stopped);
    }
}
