//! Client-side multiplexer: many named channels over one connection

use crate::channel::Channel;
use crate::frame::{Frame, FrameBody};
use crate::transport::FrameTransport;
use crate::types::{ConnectionId, MuxConfig, MuxError, MuxResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Client endpoint of a multiplexed connection
///
/// Channels are created idempotently per name; rooms are a server-side
/// concern and have no client API.
pub struct Client {
    connection_id: ConnectionId,
    config: MuxConfig,
    outbound: mpsc::UnboundedSender<Frame>,
    channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    closed: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Attach to an established transport connection
    pub fn connect<T: FrameTransport + 'static>(transport: T) -> Self {
        Self::with_config(transport, MuxConfig::default())
    }

    pub fn with_config<T: FrameTransport + 'static>(transport: T, config: MuxConfig) -> Self {
        let connection_id = ConnectionId::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let channels: Arc<RwLock<HashMap<String, Arc<Channel>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_client(
            transport,
            connection_id,
            Arc::clone(&channels),
            Arc::clone(&closed),
            outbound_rx,
        ));

        info!("Client connection {} established", connection_id);
        Self {
            connection_id,
            config,
            outbound: outbound_tx,
            channels,
            closed,
            task,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Get or create the channel for a name; creation subscribes the
    /// channel with the server
    pub async fn channel(&self, name: &str) -> MuxResult<Arc<Channel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::ConnectionClosed);
        }

        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(name) {
            if channel.is_open().await {
                return Ok(Arc::clone(channel));
            }
            // An explicitly closed channel is gone; a later request for the
            // same name opens a fresh one
        }

        let channel = Channel::new(name, self.connection_id, self.outbound.clone(), &self.config);
        self.outbound
            .send(Frame::new(name, FrameBody::Open))
            .map_err(|_| MuxError::ConnectionClosed)?;
        channels.insert(name.to_string(), Arc::clone(&channel));

        debug!(
            "Opened channel '{}' on client connection {}",
            name, self.connection_id
        );
        Ok(channel)
    }

    /// Close the connection and every channel on it
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<Arc<Channel>> = {
            let mut channels = self.channels.write().await;
            channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in drained {
            channel.shutdown(false).await;
        }

        // Dropping the transport with the loop signals close to the peer
        self.task.abort();
        info!("Client connection {} closed", self.connection_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.task.abort();
        debug!("Dropping client connection {}", self.connection_id);
    }
}

/// Client connection loop: mirror of the server side, minus spark handling
async fn run_client<T: FrameTransport>(
    mut transport: T,
    connection_id: ConnectionId,
    channels: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
    closed: Arc<AtomicBool>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    debug!("Starting client loop for connection {}", connection_id);

    loop {
        tokio::select! {
            inbound = transport.recv() => match inbound {
                Some(frame) => dispatch_frame(&channels, frame).await,
                None => {
                    info!("Connection {} stream ended", connection_id);
                    break;
                }
            },
            queued = outbound_rx.recv() => match queued {
                Some(frame) => {
                    if let Err(e) = transport.send(frame).await {
                        warn!("Send failed on connection {}: {}", connection_id, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Connection close cascades to every channel
    closed.store(true, Ordering::SeqCst);
    let drained: Vec<Arc<Channel>> = {
        let mut channels = channels.write().await;
        channels.drain().map(|(_, channel)| channel).collect()
    };
    for channel in drained {
        channel.shutdown(false).await;
    }
}

async fn dispatch_frame(channels: &RwLock<HashMap<String, Arc<Channel>>>, frame: Frame) {
    match frame.body {
        FrameBody::Close => {
            let removed = channels.write().await.remove(&frame.channel);
            if let Some(channel) = removed {
                channel.shutdown(false).await;
            }
        }
        // The server never opens channels towards the client
        FrameBody::Open => {
            debug!("Ignoring open frame for channel '{}'", frame.channel);
        }
        body => {
            let channel = channels.read().await.get(&frame.channel).cloned();
            match channel {
                Some(channel) => channel.handle_frame(body).await,
                None => warn!(
                    "Dropping unroutable frame for unknown channel '{}'",
                    frame.channel
                ),
            }
        }
    }
}
