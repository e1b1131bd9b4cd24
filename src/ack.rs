//! Acknowledgement correlation for emitted events
//!
//! Each pending acknowledgement moves through `Sent -> Resolved` or
//! `Sent -> Abandoned` exactly once; removal from the pending table is the
//! transition, so duplicates and late replies find nothing to resolve and
//! are dropped.

use crate::types::{MuxConfig, MuxError, MuxResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// One-shot future resolving to the reply of an acknowledged emit
///
/// Resolves `Err(MuxError::AckAbandoned)` when the owning channel closes
/// (or the ack times out) before a reply arrives.
#[derive(Debug)]
pub struct AckHandle {
    rx: oneshot::Receiver<MuxResult<Value>>,
}

impl Future for AckHandle {
    type Output = MuxResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(inner) => inner,
            Err(_) => Err(MuxError::AckAbandoned),
        })
    }
}

/// Per-channel table of pending acknowledgements
pub(crate) struct AckCorrelator {
    /// Monotonic correlation id source; ids are never reused while pending
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<MuxResult<Value>>>>,
    ack_timeout: Option<Duration>,
    max_pending: Option<usize>,
}

impl AckCorrelator {
    pub(crate) fn new(config: &MuxConfig) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            ack_timeout: config.ack_timeout,
            max_pending: config.max_pending_acks,
        }
    }

    /// Allocate a correlation id and register its pending reply slot
    pub(crate) async fn register(self: &Arc<Self>) -> MuxResult<(u64, AckHandle)> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut pending = self.pending.lock().await;
            if let Some(limit) = self.max_pending {
                if pending.len() >= limit {
                    return Err(MuxError::AckLimitExceeded);
                }
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            pending.insert(id, tx);
            id
        };

        if let Some(timeout) = self.ack_timeout {
            let correlator = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if correlator.abandon(id).await {
                    debug!("Acknowledgement {} timed out", id);
                }
            });
        }

        Ok((id, AckHandle { rx }))
    }

    /// Resolve a pending acknowledgement with its reply payload
    pub(crate) async fn resolve(&self, id: u64, payload: Value) {
        let sender = {
            let mut pending = self.pending.lock().await;
            pending.remove(&id)
        };

        match sender {
            Some(tx) => {
                let _ = tx.send(Ok(payload));
            }
            None => debug!("Dropping late or duplicate ack reply for id {}", id),
        }
    }

    /// Abandon a single pending acknowledgement; returns whether it was still pending
    pub(crate) async fn abandon(&self, id: u64) -> bool {
        let sender = {
            let mut pending = self.pending.lock().await;
            pending.remove(&id)
        };

        match sender {
            Some(tx) => {
                let _ = tx.send(Err(MuxError::AckAbandoned));
                true
            }
            None => false,
        }
    }

    /// Abandon everything still pending; called on channel close
    pub(crate) async fn abandon_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(MuxError::AckAbandoned));
        }

        if count > 0 {
            debug!("Abandoned {} pending acknowledgements", count);
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
