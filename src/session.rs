//! TCP connection session
//!
//! Handles one client connection: registers it with the ChatServer,
//! runs the delivery task that writes mailbox messages to the socket, and
//! supervises inbound lines against the idle timeout.
//!
//! Every way a session can end (peer close, read error, write failure,
//! idle timeout) goes through the same teardown: leave the server, wait
//! for the delivery task, close the socket.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::message::ServerMessage;
use crate::server::ServerHandle;
use crate::types::{ClientId, LeaveReason};
use crate::user::Mailbox;

/// Stand-in deadline for idle timeouts too large to add to `Instant::now()`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not yet registered
    Connecting,
    /// Registered and within the idle budget
    Active,
    /// Terminal
    Closed(LeaveReason),
}

/// Handle a new TCP connection
///
/// Returns once the connection is fully torn down.
pub async fn handle_connection(
    stream: TcpStream,
    server: ServerHandle,
    config: Config,
) -> Result<LeaveReason, AppError> {
    let peer_addr = stream.peer_addr()?;
    let session = Session::open(stream, peer_addr, server, &config).await?;
    Ok(session.run().await)
}

/// One connected client
pub struct Session {
    client_id: ClientId,
    peer_addr: SocketAddr,
    state: SessionState,
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    delivery: JoinHandle<()>,
    delivery_done: bool,
    server: ServerHandle,
    idle_timeout: Duration,
    drain_timeout: Duration,
}

impl Session {
    /// Split the socket, start the delivery task and register with the server
    pub async fn open(
        stream: TcpStream,
        peer_addr: SocketAddr,
        server: ServerHandle,
        config: &Config,
    ) -> Result<Self, AppError> {
        let client_id = ClientId::new();
        debug!("New TCP connection from {} ({})", peer_addr, client_id);

        let (reader, writer) = stream.into_split();
        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(config.max_line_length));
        let sink = FramedWrite::new(writer, LinesCodec::new());

        let (mailbox, inbox) = Mailbox::channel(client_id, config.mailbox_capacity);
        let delivery = tokio::spawn(deliver(client_id, inbox, sink));

        let mut session = Self {
            client_id,
            peer_addr,
            state: SessionState::Connecting,
            lines,
            delivery,
            delivery_done: false,
            server,
            idle_timeout: config.idle_timeout,
            drain_timeout: config.drain_timeout(),
        };

        // The registry owns the only long-lived mailbox sender from here on
        if let Err(e) = session.server.join(client_id, peer_addr, mailbox).await {
            session.delivery.abort();
            return Err(e);
        }
        session.state = SessionState::Active;

        info!("Client {} connected from {}", client_id, peer_addr);
        Ok(session)
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Supervise the connection until it ends, then tear it down
    pub async fn run(mut self) -> LeaveReason {
        let reason = self.supervise().await;
        self.state = SessionState::Closed(reason);
        self.teardown(reason).await;
        reason
    }

    /// Read lines until the peer leaves, the socket fails or the idle
    /// deadline passes. Each line re-arms the deadline.
    async fn supervise(&mut self) -> LeaveReason {
        let mut deadline = self.idle_deadline();

        loop {
            tokio::select! {
                frame = self.lines.next() => match frame {
                    Some(Ok(line)) => {
                        if !line.is_empty() {
                            debug!("Line from {}: {:?}", self.client_id, line);
                            if let Err(e) = self.server.dispatch(self.client_id, &line).await {
                                warn!("Dispatch failed for {}: {}", self.client_id, e);
                                return LeaveReason::Errored;
                            }
                        }
                        deadline = self.idle_deadline();
                    }
                    Some(Err(e)) => {
                        warn!("Read error for {}: {}", self.client_id, AppError::from(e));
                        return LeaveReason::Errored;
                    }
                    None => {
                        debug!("Client {} closed the connection", self.client_id);
                        return LeaveReason::Disconnected;
                    }
                },
                _ = time::sleep_until(deadline) => {
                    info!("Client {} idle for {:?}, kicking", self.client_id, self.idle_timeout);
                    return LeaveReason::TimedOut;
                }
                _ = &mut self.delivery => {
                    self.delivery_done = true;
                    debug!("Delivery task ended early for {}", self.client_id);
                    return LeaveReason::Errored;
                }
            }
        }
    }

    fn idle_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.idle_timeout).unwrap_or_else(|| now + FAR_FUTURE)
    }

    /// Runs once per session, whatever ended it
    async fn teardown(mut self, reason: LeaveReason) {
        if let Err(e) = self.server.leave(self.client_id, reason).await {
            warn!("Leave failed for {}: {}", self.client_id, e);
        }

        if !self.delivery_done
            && time::timeout(self.drain_timeout, &mut self.delivery)
                .await
                .is_err()
        {
            warn!("Delivery task for {} did not drain, aborting", self.client_id);
            self.delivery.abort();
        }

        info!(
            "Client {} ({}) disconnected: {}",
            self.client_id, self.peer_addr, reason
        );
        // Dropping the read half here closes the socket
    }
}

/// Delivery task: drain the mailbox into the socket
///
/// Ends when the mailbox closes (all senders dropped) or a write fails,
/// then closes the write half.
async fn deliver<W>(
    client_id: ClientId,
    mut inbox: mpsc::Receiver<ServerMessage>,
    mut sink: FramedWrite<W, LinesCodec>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = inbox.recv().await {
        if let Err(e) = sink.send(msg.to_string()).await {
            debug!("Write failed for {}: {}", client_id, e);
            break;
        }
    }
    debug!("Delivery task ended for {}", client_id);

    let _ = SinkExt::<String>::close(&mut sink).await;
}
