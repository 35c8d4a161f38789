//! Error types for the chat server
//!
//! Defines application-level errors and mailbox send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// protocol errors (reported back to the sender as a text line).
#[derive(Debug, Error)]
pub enum AppError {
    /// Line framing error: bad UTF-8, overlong line or I/O (fatal)
    #[error("Line codec error: {0}")]
    Lines(#[from] LinesCodecError),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - server actor is gone)
    #[error("Channel send error")]
    ChannelSend,

    /// Rename target is empty
    #[error("Empty name")]
    EmptyName,

    /// Rename target already belongs to an online user
    #[error("Name in use: {0}")]
    NameInUse(String),

    /// `msg` with fewer than three space separated tokens
    #[error("Malformed private message")]
    MalformedWhisper,

    /// `msg` with an empty target name
    #[error("Private message without target")]
    EmptyTarget,

    /// `msg` with empty content
    #[error("Private message without content")]
    EmptyContent,

    /// No online user with the given name
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Session id is not registered
    #[error("Not online")]
    NotOnline,
}

/// Mailbox send errors
///
/// Occurs when the pump cannot hand a message to a user's delivery task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the mailbox has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The mailbox stayed full past the delivery deadline
    #[error("Delivery timed out")]
    TimedOut,

    /// The mailbox is full right now
    #[error("Mailbox full")]
    Full,
}
