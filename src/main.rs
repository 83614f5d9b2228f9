//! line-relay: A line-delimited TCP broadcast relay
//!
//! Clients connect over TCP and send newline-terminated messages; every
//! message is delivered to all other connected clients.
//!
//! Features:
//! - Buffered framing that survives split and coalesced reads
//! - Bounded message bus with producer backpressure
//! - Per-write deadlines so a stalled peer is dropped, never waited on
//! - Graceful shutdown with a notice to every client
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod relay;

use config::Config;
use relay::Server;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.address(),
        bus_capacity = config.bus_capacity,
        max_connections = config.max_connections,
        write_timeout_ms = config.write_timeout.as_millis() as u64,
        shutdown_grace_ms = config.shutdown_grace.as_millis() as u64,
        "Starting line-relay"
    );

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.enable_all().build()?;

    runtime.block_on(serve(config))?;

    info!("Server terminated.");
    Ok(())
}

/// Run the relay until Ctrl-C, then stop it gracefully.
async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(Server::bind(config).await?);

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Interrupt received, shutting down");
        if let Err(e) = stopper.stop().await {
            error!(error = %e, "Shutdown failed");
        }
    });

    server.run().await?;
    Ok(())
}
