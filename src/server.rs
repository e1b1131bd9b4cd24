//! Server object: accepts framed connections and owns the room/spark state

use crate::channel::Channel;
use crate::frame::{Frame, FrameBody};
use crate::registry::{ChannelGroup, SparkRegistry};
use crate::rooms::{Broadcast, RoomManager};
use crate::spark::Spark;
use crate::transport::FrameTransport;
use crate::types::{ConnectionId, MuxConfig, MuxError, MuxResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// Multiplexing server
///
/// Owns the spark registry and the room manager; each accepted connection
/// runs its own loop, so frames for one connection are processed strictly
/// in arrival order while connections proceed independently.
pub struct Server {
    config: MuxConfig,
    rooms: Arc<RoomManager>,
    registry: Arc<SparkRegistry>,
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
}

struct ConnectionHandle {
    task: tokio::task::JoinHandle<()>,
}

/// Everything a connection loop needs, cloned per accepted connection
struct ConnectionContext {
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<Frame>,
    registry: Arc<SparkRegistry>,
    rooms: Arc<RoomManager>,
    config: MuxConfig,
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    pub fn with_config(config: MuxConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RoomManager::new()),
            registry: SparkRegistry::new(),
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get or create the named channel group
    pub async fn channel(&self, name: &str) -> Arc<ChannelGroup> {
        self.registry.group(name).await
    }

    /// Build a broadcast target from a whitespace-separated room list
    pub fn room(&self, spec: &str) -> Broadcast {
        Broadcast::new(
            spec,
            Arc::clone(&self.rooms),
            Arc::downgrade(&self.registry),
        )
    }

    /// All live room names
    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.rooms().await
    }

    /// The spark registry owned by this server
    pub fn registry(&self) -> &Arc<SparkRegistry> {
        &self.registry
    }

    /// The room manager owned by this server
    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Accept an established transport connection and start its loop
    pub async fn accept<T: FrameTransport + 'static>(&self, transport: T) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let ctx = ConnectionContext {
            connection_id,
            outbound: outbound_tx,
            registry: Arc::clone(&self.registry),
            rooms: Arc::clone(&self.rooms),
            config: self.config.clone(),
            connections: Arc::clone(&self.connections),
        };

        // The loop starts only after the handle is registered, so its
        // teardown can never observe a half-registered connection
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = ready_rx.await;
            run_connection(transport, ctx, outbound_rx).await;
        });

        self.connections
            .write()
            .await
            .insert(connection_id, ConnectionHandle { task });
        let _ = ready_tx.send(());

        info!("Accepted connection {}", connection_id);
        connection_id
    }

    /// Close one connection and tear down all of its sparks
    pub async fn close_connection(&self, id: ConnectionId) -> MuxResult<()> {
        let handle = self
            .connections
            .write()
            .await
            .remove(&id)
            .ok_or(MuxError::ConnectionNotFound(id))?;
        handle.task.abort();

        for spark in self.registry.remove_connection(id).await {
            spark.teardown(false).await;
        }

        info!("Closed connection {}", id);
        Ok(())
    }

    /// Close every live connection
    pub async fn close_all_connections(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        let mut closed = 0;
        for id in ids {
            if self.close_connection(id).await.is_ok() {
                closed += 1;
            }
        }
        closed
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Server statistics
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.connection_count().await,
            sparks: self.registry.spark_count().await,
            rooms: self.rooms.stats().await.total_rooms,
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections: usize,
    pub sparks: usize,
    pub rooms: usize,
}

/// Per-connection loop: pumps queued outbound frames to the transport and
/// routes inbound frames, one at a time, in arrival order
async fn run_connection<T: FrameTransport>(
    mut transport: T,
    ctx: ConnectionContext,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    debug!("Starting connection loop for {}", ctx.connection_id);

    loop {
        tokio::select! {
            inbound = transport.recv() => match inbound {
                Some(frame) => route_frame(&ctx, frame).await,
                None => {
                    info!("Connection {} stream ended", ctx.connection_id);
                    break;
                }
            },
            queued = outbound_rx.recv() => match queued {
                Some(frame) => {
                    if let Err(e) = transport.send(frame).await {
                        warn!("Send failed on connection {}: {}", ctx.connection_id, e);
                        break;
                    }
                }
                // Unreachable while the context holds a sender
                None => break,
            },
        }
    }

    ctx.connections.write().await.remove(&ctx.connection_id);
    for spark in ctx.registry.remove_connection(ctx.connection_id).await {
        spark.teardown(false).await;
    }
}

async fn route_frame(ctx: &ConnectionContext, frame: Frame) {
    match frame.body {
        FrameBody::Open => {
            ensure_spark(ctx, &frame.channel).await;
        }
        FrameBody::Close => {
            if let Some(spark) = ctx.registry.remove(ctx.connection_id, &frame.channel).await {
                spark.teardown(false).await;
            }
        }
        // A reply can only correlate to a channel this server emitted on,
        // so an ack for an unknown channel is stale and never subscribes
        body @ FrameBody::Ack { .. } => {
            match ctx.registry.lookup(ctx.connection_id, &frame.channel).await {
                Some(spark) => spark.channel().handle_frame(body).await,
                None => debug!(
                    "Dropping stale ack for unknown channel '{}' on connection {}",
                    frame.channel, ctx.connection_id
                ),
            }
        }
        body => {
            // A channel is accepted lazily on its first data or event frame
            let spark = ensure_spark(ctx, &frame.channel).await;
            spark.channel().handle_frame(body).await;
        }
    }
}

/// Get the spark for a channel name, creating it (and firing the channel
/// group's connection handlers exactly once) on first contact
async fn ensure_spark(ctx: &ConnectionContext, name: &str) -> Arc<Spark> {
    if let Some(spark) = ctx.registry.lookup(ctx.connection_id, name).await {
        return spark;
    }

    let channel = Channel::new(name, ctx.connection_id, ctx.outbound.clone(), &ctx.config);
    let spark = Spark::new(channel, Arc::clone(&ctx.rooms), &ctx.registry);
    ctx.registry
        .insert(ctx.connection_id, name, Arc::clone(&spark))
        .await;

    info!(
        "Spark {} opened channel '{}' on connection {}",
        spark.id(),
        name,
        ctx.connection_id
    );

    let group = ctx.registry.group(name).await;
    group.fire(Arc::clone(&spark)).await;
    spark
}
