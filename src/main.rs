//! Line-based TCP Chat Server - Entry Point
//!
//! Loads configuration, binds the TCP listener and runs the accept loop.

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use line_chat::{serve, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    // Initialize logging with environment filter
    // Use RUST_LOG env var to override, e.g. RUST_LOG=line_chat=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("line_chat={}", config.log_level))),
        )
        .init();

    // Bind failure is the one fatal runtime error
    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!(
        addr = %config.bind_addr(),
        idle_timeout = ?config.idle_timeout,
        "Chat server listening"
    );

    serve(listener, config).await;
    Ok(())
}
