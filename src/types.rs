//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based unique session identifier
//! - `LeaveReason`: why a session ended

use uuid::Uuid;

/// Unique session identifier (newtype pattern)
///
/// Wraps a UUID v4. Display names change on rename, the id never does,
/// so the server tracks sessions by id and users by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex digits, used to disambiguate display names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Peer closed the connection
    Disconnected,
    /// No inbound line within the idle timeout
    TimedOut,
    /// Read or write failure
    Errored,
}

impl LeaveReason {
    /// Whether other users are told about this departure
    pub fn announces(&self) -> bool {
        !matches!(self, LeaveReason::Errored)
    }
}

impl std::fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::TimedOut => "timed out",
            LeaveReason::Errored => "errored",
        };
        f.write_str(s)
    }
}
