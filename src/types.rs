//! Core identifiers, errors and configuration for the multiplexing layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a server-side spark (one remote channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SparkId(pub Uuid);

impl SparkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SparkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SparkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is open and dispatching
    Open,
    /// Channel is tearing down; no new frames are accepted
    Closing,
    /// Channel is closed
    Closed,
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Errors surfaced by the multiplexing core
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Pending acknowledgement abandoned")]
    AckAbandoned,

    #[error("Pending acknowledgement limit exceeded")]
    AckLimitExceeded,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Result type for multiplexer operations
pub type MuxResult<T> = Result<T, MuxError>;

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Expire pending acknowledgements after this duration; `None` keeps
    /// them alive until the owning channel closes
    pub ack_timeout: Option<Duration>,
    /// Upper bound on outstanding acknowledgements per channel
    pub max_pending_acks: Option<usize>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            ack_timeout: None,
            max_pending_acks: Some(1024),
        }
    }
}
