//! Line-based TCP Chat Server Library
//!
//! A multi-user chat server speaking newline-terminated UTF-8 text over
//! raw TCP, using the Actor pattern for state management.
//!
//! # Commands
//! - `list`: show every online user
//! - `rename <name>`: change your display name
//! - `msg <name> <content>`: private message
//! - anything else: broadcast to everyone online
//!
//! # Architecture
//! - `ChatServer` is the central actor owning the online-user registry
//! - `BroadcastPump` fans queued deliveries out to user mailboxes
//! - Each connection runs a `Session`: a supervisor reading lines against
//!   an idle timeout, plus a delivery task writing its mailbox to the socket
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use line_chat::{serve, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let listener = TcpListener::bind(config.bind_addr()).await.unwrap();
//!     serve(listener, config).await;
//! }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;
pub mod user;

use tokio::net::TcpListener;
use tracing::{error, info};

// Re-export main types for convenience
pub use config::{CliArgs, Config, ConfigError};
pub use error::{AppError, SendError};
pub use message::{ClientCommand, ServerMessage};
pub use pump::{BroadcastPump, Delivery};
pub use registry::Registry;
pub use server::{ChatServer, ServerCommand, ServerHandle};
pub use session::{handle_connection, Session, SessionState};
pub use types::{ClientId, LeaveReason};
pub use user::{Mailbox, User};

/// Start the server actors and accept connections forever
///
/// Accept errors are logged and the loop carries on.
pub async fn serve(listener: TcpListener, config: Config) {
    let server = ServerHandle::spawn(&config);
    info!("ChatServer actor started");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let server = server.clone();
                let config = config.clone();

                // Spawn a session task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, server, config).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
