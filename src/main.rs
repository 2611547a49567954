use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use relaychat::auth::MemoryAccountStore;
use relaychat::config::{ServerArgs, ServerConfig};
use relaychat::crypto::Identity;
use relaychat::server::RelayServer;
use relaychat::utils::logging::{init_file_logging, init_logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = ServerArgs::parse();
    let config = ServerConfig::from_args(args).context("Invalid server configuration")?;

    // Keep the file writer guard alive until exit
    let _log_guard = match &config.log_file {
        Some(path) => Some(init_file_logging(&config.log_level, path)?),
        None => {
            init_logging(&config.log_level)?;
            None
        }
    };

    info!("Starting relaychat server {}", env!("CARGO_PKG_VERSION"));

    let key_file = config.server_key_file.clone();
    let identity = tokio::task::spawn_blocking(move || Identity::load_or_generate(&key_file))
        .await
        .context("Identity task panicked")?
        .with_context(|| format!("Failed to load server identity from {:?}", config.server_key_file))?;
    info!("Server identity fingerprint: {}", identity.fingerprint());

    let server = RelayServer::new(config, Arc::new(identity), Arc::new(MemoryAccountStore::new()));
    let addr = server.start().await?;
    info!("Relay ready on {}", addr);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutdown signal received");
    server.shutdown().await?;

    Ok(())
}
