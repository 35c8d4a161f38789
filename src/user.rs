//! User struct definition
//!
//! Represents an online user: display name, remote address and the
//! mailbox feeding the user's delivery task.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::ClientId;

/// Sending side of a user's outbound queue
///
/// Cheap to clone. The mailbox closes once every clone is dropped.
#[derive(Debug, Clone)]
pub struct Mailbox {
    owner: ClientId,
    sender: mpsc::Sender<ServerMessage>,
}

impl Mailbox {
    pub fn new(owner: ClientId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { owner, sender }
    }

    /// Create a mailbox and the receiver its delivery task drains
    pub fn channel(owner: ClientId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(owner, tx), rx)
    }

    pub fn owner(&self) -> ClientId {
        self.owner
    }

    /// Send a message, waiting for space in the mailbox
    ///
    /// Returns an error if the channel is closed (user disconnected).
    pub async fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Send a message, giving up once `timeout` has elapsed
    pub async fn send_timeout(
        &self,
        msg: ServerMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        self.sender.send_timeout(msg, timeout).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => SendError::TimedOut,
            mpsc::error::SendTimeoutError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Send without waiting; fails with `SendError::Full` if there is no room
    pub fn try_send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Nothing queued: the delivery task has caught up
    pub fn is_drained(&self) -> bool {
        self.sender.capacity() == self.sender.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Online user information
#[derive(Debug, Clone)]
pub struct User {
    /// Session identifier, stable across renames
    pub id: ClientId,
    /// Display name, the registry key
    pub name: String,
    /// Remote socket address
    pub addr: SocketAddr,
    /// Server → User message channel
    pub mailbox: Mailbox,
}

impl User {
    /// Create a user named after its remote address
    pub fn new(id: ClientId, addr: SocketAddr, mailbox: Mailbox) -> Self {
        Self {
            id,
            name: addr.to_string(),
            addr,
            mailbox,
        }
    }

    /// Wrap `text` as a public line from this user
    pub fn public(&self, text: impl Into<String>) -> ServerMessage {
        ServerMessage::Public {
            addr: self.addr,
            name: self.name.clone(),
            text: text.into(),
        }
    }

    /// This user's `list` entry
    pub fn presence(&self) -> ServerMessage {
        ServerMessage::Presence {
            addr: self.addr,
            name: self.name.clone(),
        }
    }

    /// Set the user's display name
    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }
}
