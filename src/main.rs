//! Closing Bridge
//!
//! WebSocket server that coordinates the close handshake of every connection:
//! bounded waits for the peer's close acknowledgment, forced closure on
//! timeout, and exactly-once eviction from the connection registry.

mod close;
mod config;
mod registry;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use close::ClosingTimeout;
use config::{BridgeConfig, CONFIG_FILE};
use server::{ServerConfig, WebSocketServer};

/// Closing Bridge
///
/// WebSocket server with close-handshake coordination
#[derive(Parser, Debug)]
#[command(name = "closing-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Seconds to wait for the peer to finish closing; negative waits forever, 0 closes at once
    #[arg(long, allow_negative_numbers = true)]
    closing_timeout: Option<i64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Closing Bridge v{}", env!("CARGO_PKG_VERSION"));

    let bridge_config = BridgeConfig::load(&args.config)?;
    let config = server_config(&bridge_config, &args);

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Merge command line overrides into the file configuration
fn server_config(bridge_config: &BridgeConfig, args: &Args) -> ServerConfig {
    let mut config = ServerConfig::from(bridge_config);
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(secs) = args.closing_timeout {
        config.closing_timeout = ClosingTimeout::from_secs(secs);
    }
    config
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["closing-bridge"]);
        assert_eq!(args.config, PathBuf::from(CONFIG_FILE));
        assert!(args.closing_timeout.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn test_negative_closing_timeout_override() {
        let args = Args::parse_from(["closing-bridge", "--closing-timeout", "-1", "--port", "8081"]);
        let config = server_config(&BridgeConfig::default(), &args);
        assert_eq!(config.closing_timeout, ClosingTimeout::Disabled);
        assert_eq!(config.port, 8081);
        assert_eq!(config.bind, "127.0.0.1");
    }
}
