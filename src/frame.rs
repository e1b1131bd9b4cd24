//! Wire frame model shared by both sides of a connection
//!
//! Every frame carries the name of the channel it belongs to so the
//! receiving side can demultiplex. The body is an internally tagged enum,
//! which keeps the model usable with any serde codec the transport picks.

use crate::types::{MuxError, MuxResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single multiplexed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel tag used for demultiplexing
    pub channel: String,
    #[serde(flatten)]
    pub body: FrameBody,
}

/// Frame payload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    /// Channel subscribe; sent by the side that opens the channel
    Open,
    /// Channel end; the sender will route no further frames for this channel
    Close,
    /// Raw data write without event semantics
    Data { payload: Value },
    /// Named event, optionally requesting an acknowledgement
    Event {
        name: String,
        payload: Value,
        ack: Option<u64>,
    },
    /// Correlated reply to a previously sent `Event`
    Ack { id: u64, payload: Value },
}

impl Frame {
    pub fn new(channel: impl Into<String>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    /// Encode the frame as JSON text
    pub fn to_json(&self) -> MuxResult<String> {
        serde_json::to_string(self).map_err(|e| MuxError::MalformedFrame(e.to_string()))
    }

    /// Decode a frame from JSON text
    pub fn from_json(raw: &str) -> MuxResult<Self> {
        serde_json::from_str(raw).map_err(|e| MuxError::MalformedFrame(e.to_string()))
    }
}
