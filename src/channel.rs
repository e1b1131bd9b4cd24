//! Logical channel multiplexed over one physical connection
//!
//! A channel owns its emitter and its acknowledgement correlator and mirrors
//! the connection lifecycle: once closed it never dispatches again, and any
//! pending acknowledgement is abandoned before close completes.

use crate::ack::{AckCorrelator, AckHandle};
use crate::emitter::{AckReply, Emitter, CLOSE_EVENT, DATA_EVENT};
use crate::frame::{Frame, FrameBody};
use crate::types::{ChannelState, ConnectionId, MuxConfig, MuxError, MuxResult};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// A named logical sub-connection with independent dispatch and lifecycle
pub struct Channel {
    name: String,
    connection_id: ConnectionId,
    state: RwLock<ChannelState>,
    /// Sync view of the lifecycle, shared with outstanding reply handles
    open: Arc<AtomicBool>,
    emitter: Emitter,
    acks: Arc<AckCorrelator>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Channel {
    pub(crate) fn new(
        name: impl Into<String>,
        connection_id: ConnectionId,
        outbound: mpsc::UnboundedSender<Frame>,
        config: &MuxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            connection_id,
            state: RwLock::new(ChannelState::Open),
            open: Arc::new(AtomicBool::new(true)),
            emitter: Emitter::new(),
            acks: Arc::new(AckCorrelator::new(config)),
            outbound,
        })
    }

    /// Channel name, also its demultiplexing tag on the wire
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the physical connection this channel rides on
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ChannelState {
        self.state.read().await.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.state.read().await.is_open()
    }

    /// Register a handler for a named event
    ///
    /// Handlers for raw writes go under [`DATA_EVENT`]; local close
    /// notification dispatches under [`CLOSE_EVENT`].
    pub async fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Value, Option<AckReply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.emitter.on(event, handler).await;
    }

    /// Emit a named event without requesting an acknowledgement
    pub async fn emit(&self, event: &str, payload: Value) -> MuxResult<()> {
        self.ensure_open().await?;
        self.send_frame(FrameBody::Event {
            name: event.to_string(),
            payload,
            ack: None,
        })
    }

    /// Emit a named event and return a one-shot handle for the peer's reply
    pub async fn emit_with_ack(&self, event: &str, payload: Value) -> MuxResult<AckHandle> {
        self.ensure_open().await?;
        let (id, handle) = self.acks.register().await?;

        let result = self.send_frame(FrameBody::Event {
            name: event.to_string(),
            payload,
            ack: Some(id),
        });

        if let Err(e) = result {
            self.acks.abandon(id).await;
            return Err(e);
        }

        Ok(handle)
    }

    /// Send a raw data frame without event semantics
    pub async fn write(&self, payload: Value) -> MuxResult<()> {
        self.ensure_open().await?;
        self.send_frame(FrameBody::Data { payload })
    }

    /// Close the channel locally, notifying the peer
    pub async fn close(&self) {
        self.shutdown(true).await;
    }

    /// Dispatch one inbound frame body for this channel
    pub(crate) async fn handle_frame(&self, body: FrameBody) {
        if !self.is_open().await {
            debug!(
                "Dropping frame for closed channel '{}' on connection {}",
                self.name, self.connection_id
            );
            return;
        }

        match body {
            FrameBody::Data { payload } => {
                self.emitter.dispatch(DATA_EVENT, payload, None).await;
            }
            FrameBody::Event { name, payload, ack } => {
                let reply = ack.map(|id| {
                    AckReply::new(
                        self.name.clone(),
                        id,
                        self.outbound.clone(),
                        Arc::clone(&self.open),
                    )
                });
                self.emitter.dispatch(&name, payload, reply).await;
            }
            FrameBody::Ack { id, payload } => {
                self.acks.resolve(id, payload).await;
            }
            // Open and Close are consumed by the connection loops
            FrameBody::Open | FrameBody::Close => {
                debug!(
                    "Control frame reached dispatch for channel '{}'; ignoring",
                    self.name
                );
            }
        }
    }

    /// Tear the channel down; abandons pending acks, then dispatches the
    /// local close event, then marks the channel closed
    pub(crate) async fn shutdown(&self, notify_peer: bool) {
        {
            let mut state = self.state.write().await;
            if !state.is_open() {
                return;
            }
            *state = ChannelState::Closing;
        }
        self.open.store(false, Ordering::SeqCst);

        if notify_peer {
            let _ = self
                .outbound
                .send(Frame::new(self.name.clone(), FrameBody::Close));
        }

        self.acks.abandon_all().await;
        self.emitter.dispatch(CLOSE_EVENT, Value::Null, None).await;

        {
            let mut state = self.state.write().await;
            *state = ChannelState::Closed;
        }

        info!(
            "Channel '{}' closed on connection {}",
            self.name, self.connection_id
        );
    }

    async fn ensure_open(&self) -> MuxResult<()> {
        if self.is_open().await {
            Ok(())
        } else {
            Err(MuxError::ChannelClosed)
        }
    }

    fn send_frame(&self, body: FrameBody) -> MuxResult<()> {
        self.outbound
            .send(Frame::new(self.name.clone(), body))
            .map_err(|_| MuxError::ConnectionClosed)
    }
}
