//! Server-side handle to one remote channel

use crate::ack::AckHandle;
use crate::channel::Channel;
use crate::emitter::AckReply;
use crate::registry::SparkRegistry;
use crate::rooms::{Broadcast, RoomManager};
use crate::types::{MuxError, MuxResult, SparkId};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// One remote channel as seen by the server, with room membership
pub struct Spark {
    id: SparkId,
    channel: Arc<Channel>,
    rooms: Arc<RoomManager>,
    registry: Weak<SparkRegistry>,
    connected_at: Instant,
}

impl Spark {
    pub(crate) fn new(
        channel: Arc<Channel>,
        rooms: Arc<RoomManager>,
        registry: &Arc<SparkRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SparkId::new(),
            channel,
            rooms,
            registry: Arc::downgrade(registry),
            connected_at: Instant::now(),
        })
    }

    pub fn id(&self) -> SparkId {
        self.id
    }

    /// The underlying channel this spark mirrors
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Register an event handler on the spark's channel
    pub async fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Value, Option<AckReply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.channel.on(event, handler).await;
    }

    /// Emit a named event to the remote peer
    pub async fn emit(&self, event: &str, payload: Value) -> MuxResult<()> {
        self.channel.emit(event, payload).await
    }

    /// Emit a named event and return a handle for the peer's reply
    pub async fn emit_with_ack(&self, event: &str, payload: Value) -> MuxResult<AckHandle> {
        self.channel.emit_with_ack(event, payload).await
    }

    /// Send a raw data frame to the remote peer
    pub async fn write(&self, payload: Value) -> MuxResult<()> {
        self.channel.write(payload).await
    }

    /// Add this spark to a room; idempotent
    ///
    /// The membership is visible to every later room operation once the
    /// returned future resolves.
    pub async fn join(&self, room: &str) -> MuxResult<()> {
        if !self.channel.is_open().await {
            return Err(MuxError::ChannelClosed);
        }
        self.rooms.join(self.id, room).await;
        Ok(())
    }

    /// Remove this spark from a room; a no-op if it was not a member
    pub async fn leave(&self, room: &str) -> MuxResult<()> {
        self.rooms.leave(self.id, room).await;
        Ok(())
    }

    /// Remove this spark from every room it belongs to
    pub async fn leave_all(&self) {
        self.rooms.leave_all(self.id).await;
    }

    /// Rooms this spark currently belongs to
    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.rooms_of(self.id).await
    }

    /// Build a broadcast target from a whitespace-separated room list
    pub fn room(&self, spec: &str) -> Broadcast {
        Broadcast::new(spec, Arc::clone(&self.rooms), self.registry.clone())
    }

    /// Tear the spark down: clear room membership first, then close the
    /// channel so no broadcast can address a dead spark
    pub(crate) async fn teardown(&self, notify_peer: bool) {
        self.rooms.leave_all(self.id).await;
        self.channel.shutdown(notify_peer).await;
    }
}
