// src/config/settings.rs
//! Relay server and client agent configuration.
//!
//! This module contains the configuration structures and the code for
//! loading, parsing, and validating user-provided settings.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::constants::{
    CONNECT_TIMEOUT, MAX_USERNAME_LEN, OUTBOUND_QUEUE_DEPTH, RECEIVE_POLL_INTERVAL, WRITE_TIMEOUT,
};
use crate::config::defaults;
use crate::protocol::validation::is_valid_ipv4;

/// Error type for configuration-related operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid socket address: {0}")]
    InvalidSocketAddr(#[from] std::net::AddrParseError),
}

/// Command line arguments for the relay server
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "relaychat-server",
    about = "Rendezvous relay for RSA-authenticated peer messaging",
    version,
    author
)]
pub struct ServerArgs {
    /// Address to listen on
    #[clap(long, default_value = defaults::DEFAULT_LISTEN_ADDRESS)]
    pub listen: String,

    /// Log level
    #[clap(long, default_value = defaults::DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Write logs to this file (daily rotation) instead of stdout
    #[clap(long)]
    pub log_file: Option<String>,

    /// Server identity file (PKCS#8 PEM), generated on first start
    #[clap(long, default_value = defaults::DEFAULT_SERVER_KEY_FILE)]
    pub server_key_file: String,

    /// Per-step handshake timeout in seconds
    #[clap(long, default_value_t = defaults::DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
    pub handshake_timeout: u64,

    /// Configuration file path
    #[clap(long)]
    pub config_file: Option<String>,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server listen address
    pub listen_addr: SocketAddr,

    /// Server identity file
    pub server_key_file: PathBuf,

    /// Bound on each handshake step
    pub handshake_timeout: Duration,

    /// How often receive loops wake up to check for shutdown
    pub receive_poll_interval: Duration,

    /// Log level
    pub log_level: String,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Envelopes a client may leave unread before it is evicted
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    /// Bound on writing one frame to a client
    #[serde(default = "default_write_timeout")]
    pub write_timeout: Duration,
}

fn default_outbound_queue_depth() -> usize {
    OUTBOUND_QUEUE_DEPTH
}

fn default_write_timeout() -> Duration {
    WRITE_TIMEOUT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], defaults::DEFAULT_PORT)),
            server_key_file: PathBuf::from(defaults::DEFAULT_SERVER_KEY_FILE),
            handshake_timeout: Duration::from_secs(defaults::DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            receive_poll_interval: RECEIVE_POLL_INTERVAL,
            log_level: defaults::DEFAULT_LOG_LEVEL.to_string(),
            log_file: None,
            outbound_queue_depth: OUTBOUND_QUEUE_DEPTH,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration from command line arguments
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        // A configuration file wins, with explicit flags layered on top
        if let Some(config_path) = &args.config_file {
            let mut config = Self::load_from_file(config_path)?;

            if args.listen != defaults::DEFAULT_LISTEN_ADDRESS {
                config.listen_addr = args.listen.parse()?;
            }
            if args.server_key_file != defaults::DEFAULT_SERVER_KEY_FILE {
                config.server_key_file = PathBuf::from(&args.server_key_file);
            }
            if args.log_file.is_some() {
                config.log_file = args.log_file.map(PathBuf::from);
            }
            if args.log_level != defaults::DEFAULT_LOG_LEVEL {
                config.log_level = args.log_level;
            }
            if args.handshake_timeout != defaults::DEFAULT_HANDSHAKE_TIMEOUT_SECS {
                config.handshake_timeout = Duration::from_secs(args.handshake_timeout);
            }

            config.validate()?;
            return Ok(config);
        }

        let config = Self {
            listen_addr: args.listen.parse()?,
            server_key_file: PathBuf::from(args.server_key_file),
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            receive_poll_interval: RECEIVE_POLL_INTERVAL,
            log_level: args.log_level,
            log_file: args.log_file.map(PathBuf::from),
            ..Self::default()
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "Handshake timeout must be greater than zero".to_string(),
            ));
        }

        if self.receive_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Receive poll interval must be greater than zero".to_string(),
            ));
        }

        if self.write_timeout.is_zero() || self.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "Write timeout and outbound queue depth must be greater than zero".to_string(),
            ));
        }

        if self.server_key_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "Server key file path must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        info!("Server configuration saved to {:?}", path.as_ref());
        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Client agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay server address (`host:port`)
    pub server_addr: String,

    /// IP address announced during the handshake; detected from the
    /// connected socket when unset
    #[serde(default)]
    pub claimed_ip: Option<String>,

    /// Name placed in outgoing chat and key-request records
    #[serde(default)]
    pub username: String,

    /// Client identity file
    pub key_file: PathBuf,

    /// Bound on establishing the TCP connection
    pub connect_timeout: Duration,

    /// Bound on each handshake step
    pub handshake_timeout: Duration,

    /// Wait for the forward acknowledgement
    pub ack_window: Duration,

    /// Wait for a public key reply
    pub key_window: Duration,

    /// Wait for the account creation verdict
    pub account_window: Duration,

    /// How often the receive loop wakes up to check for cancellation
    pub receive_poll_interval: Duration,

    /// Bound on writing one frame to the relay
    #[serde(default = "default_write_timeout")]
    pub write_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: defaults::DEFAULT_SERVER_ADDRESS.to_string(),
            claimed_ip: None,
            username: String::new(),
            key_file: PathBuf::from(defaults::DEFAULT_CLIENT_KEY_FILE),
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: Duration::from_secs(defaults::DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            ack_window: Duration::from_millis(defaults::DEFAULT_ACK_WINDOW_MS),
            key_window: Duration::from_millis(defaults::DEFAULT_KEY_WINDOW_MS),
            account_window: Duration::from_millis(defaults::DEFAULT_ACCOUNT_WINDOW_MS),
            receive_poll_interval: RECEIVE_POLL_INTERVAL,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Configuration pointing at the given relay with defaults elsewhere
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("Client key file path must not be empty".to_string()));
        }

        if self.server_addr.is_empty() {
            return Err(ConfigError::Invalid("Server address must not be empty".to_string()));
        }

        if let Some(ip) = &self.claimed_ip {
            if !is_valid_ipv4(ip) {
                return Err(ConfigError::Invalid(format!("Claimed IP is not dotted IPv4: {}", ip)));
            }
        }

        if self.username.len() > MAX_USERNAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "Username longer than {} bytes",
                MAX_USERNAME_LEN
            )));
        }

        let windows = [
            ("connect timeout", self.connect_timeout),
            ("handshake timeout", self.handshake_timeout),
            ("ack window", self.ack_window),
            ("key window", self.key_window),
            ("account window", self.account_window),
            ("receive poll interval", self.receive_poll_interval),
            ("write timeout", self.write_timeout),
        ];
        for (name, value) in windows {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(listen: &str) -> ServerArgs {
        ServerArgs {
            listen: listen.to_string(),
            log_level: "debug".to_string(),
            log_file: None,
            server_key_file: defaults::DEFAULT_SERVER_KEY_FILE.to_string(),
            handshake_timeout: 5,
            config_file: None,
        }
    }

    #[test]
    fn test_from_args() {
        let config = ServerConfig::from_args(args("127.0.0.1:12000")).unwrap();
        assert_eq!(config.listen_addr.port(), 12000);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_from_args_rejects_bad_address() {
        assert!(matches!(
            ServerConfig::from_args(args("not-an-address")),
            Err(ConfigError::InvalidSocketAddr(_))
        ));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.handshake_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_with_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.json");

        let mut stored = ServerConfig::default();
        stored.handshake_timeout = Duration::from_secs(7);
        stored.save_to_file(&path).unwrap();

        let mut cli = args("127.0.0.1:13000");
        cli.handshake_timeout = defaults::DEFAULT_HANDSHAKE_TIMEOUT_SECS;
        cli.config_file = Some(path.to_string_lossy().into_owned());

        let config = ServerConfig::from_args(cli).unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_secs(7));
        assert_eq!(config.listen_addr, "127.0.0.1:13000".parse().unwrap());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.json");

        let mut stored = ServerConfig::default();
        stored.handshake_timeout = Duration::from_secs(7);
        stored.log_level = "warn".to_string();
        stored.save_to_file(&path).unwrap();

        let mut cli = args(defaults::DEFAULT_LISTEN_ADDRESS);
        cli.handshake_timeout = 9;
        cli.log_level = "trace".to_string();
        cli.config_file = Some(path.to_string_lossy().into_owned());

        let config = ServerConfig::from_args(cli).unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_secs(9));
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.write_timeout, WRITE_TIMEOUT);
    }

    #[test]
    fn test_client_config_validation() {
        let mut config = ClientConfig::new("127.0.0.1:12000");
        assert!(config.validate().is_ok());

        config.claimed_ip = Some("10.0.0.300".to_string());
        assert!(config.validate().is_err());

        config.claimed_ip = Some("10.0.0.3".to_string());
        config.ack_window = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.json");

        let mut config = ClientConfig::new("relay.example:12000");
        config.username = "alice".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = ClientConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.server_addr, "relay.example:12000");
        assert_eq!(loaded.ack_window, config.ack_window);
    }
}
