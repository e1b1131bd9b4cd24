//! Event handler registry and dispatch
//!
//! Handlers are registered per event name and invoked in registration
//! order. Dispatch awaits each handler before the next one runs, so a
//! channel's inbound processing keeps run-to-completion semantics.

use crate::frame::{Frame, FrameBody};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Reserved event name for raw data writes
pub const DATA_EVENT: &str = "data";
/// Reserved event name dispatched locally when a channel closes
pub const CLOSE_EVENT: &str = "close";

type EventHandler = Arc<dyn Fn(Value, Option<AckReply>) -> BoxFuture<'static, ()> + Send + Sync>;

/// One-shot reply handle passed to handlers of events that request an
/// acknowledgement
///
/// Cloning shares the one-shot guard: across all clones the correlated
/// reply is sent at most once, further sends are logged no-ops. A reply
/// stashed past channel close is also a logged no-op; a closed channel
/// never puts frames on the wire.
#[derive(Clone)]
pub struct AckReply {
    channel: String,
    id: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
    used: Arc<AtomicBool>,
}

impl AckReply {
    pub(crate) fn new(
        channel: String,
        id: u64,
        outbound: mpsc::UnboundedSender<Frame>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channel,
            id,
            outbound,
            open,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send the correlated reply back to the peer
    pub fn send(&self, payload: Value) {
        if !self.open.load(Ordering::SeqCst) {
            debug!(
                "Dropping ack reply for id {} on closed channel {}",
                self.id, self.channel
            );
            return;
        }
        if self.used.swap(true, Ordering::SeqCst) {
            debug!(
                "Ignoring duplicate ack reply for id {} on channel {}",
                self.id, self.channel
            );
            return;
        }

        let frame = Frame::new(
            self.channel.clone(),
            FrameBody::Ack {
                id: self.id,
                payload,
            },
        );
        let _ = self.outbound.send(frame);
    }
}

/// Per-channel event emitter
pub struct Emitter {
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for an event; multiple handlers per event are kept
    /// in registration order
    pub(crate) async fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Value, Option<AckReply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: EventHandler =
            Arc::new(move |payload, reply| -> BoxFuture<'static, ()> {
                Box::pin(handler(payload, reply))
            });

        let mut handlers = self.handlers.write().await;
        handlers.entry(event.to_string()).or_default().push(wrapped);
    }

    /// Invoke every handler registered for `event`, in order
    pub(crate) async fn dispatch(&self, event: &str, payload: Value, reply: Option<AckReply>) {
        let matched: Vec<EventHandler> = {
            let handlers = self.handlers.read().await;
            match handlers.get(event) {
                Some(list) => list.clone(),
                None => {
                    debug!("No handler registered for event '{}'", event);
                    return;
                }
            }
        };

        for handler in matched {
            handler(payload.clone(), reply.clone()).await;
        }
    }
}
