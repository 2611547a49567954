// src/config/defaults.rs
//! Default configuration values used when nothing else is specified.

/// Default relay service port
pub const DEFAULT_PORT: u16 = 12000;

/// Default server listening address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:12000";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default server identity file
pub const DEFAULT_SERVER_KEY_FILE: &str = "data/server_private_key.pem";

/// Default client identity file
pub const DEFAULT_CLIENT_KEY_FILE: &str = "data/RSAPRIVATEKEY.pem";

/// Default relay address a client connects to
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:12000";

/// How long `send` waits for the forward acknowledgement
pub const DEFAULT_ACK_WINDOW_MS: u64 = 1000;

/// How long `get_public_key` waits for a key reply
pub const DEFAULT_KEY_WINDOW_MS: u64 = 1000;

/// How long `create_account` waits for the server verdict
pub const DEFAULT_ACCOUNT_WINDOW_MS: u64 = 2000;

/// Per-step handshake timeout in seconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 3;
