//! Broadcast target resolved from one or more rooms

use super::manager::RoomManager;
use super::split_rooms;
use crate::registry::SparkRegistry;
use crate::spark::Spark;
use crate::types::SparkId;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::debug;

/// A fan-out target addressing the union of sparks in the named rooms
///
/// A spark that is a member of more than one of the rooms receives each
/// broadcast exactly once. Fan-out is not atomic: a target whose channel
/// closed mid-broadcast is skipped and the broadcast itself never errors.
pub struct Broadcast {
    rooms: Vec<String>,
    manager: Arc<RoomManager>,
    registry: Weak<SparkRegistry>,
    except: Option<SparkId>,
}

impl Broadcast {
    pub(crate) fn new(
        spec: &str,
        manager: Arc<RoomManager>,
        registry: Weak<SparkRegistry>,
    ) -> Self {
        Self {
            rooms: split_rooms(spec),
            manager,
            registry,
            except: None,
        }
    }

    /// Exclude one spark from the fan-out, typically the sender
    pub fn except(mut self, spark: SparkId) -> Self {
        self.except = Some(spark);
        self
    }

    /// Spark ids the broadcast currently resolves to
    pub async fn clients(&self) -> Vec<SparkId> {
        let mut ids = self.manager.resolve(&self.rooms).await;
        if let Some(excluded) = self.except {
            ids.remove(&excluded);
        }
        ids.into_iter().collect()
    }

    /// Send a raw data frame to every live member
    pub async fn write(&self, payload: Value) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        for spark in self.targets().await {
            match spark.channel().write(payload.clone()).await {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    debug!("Skipping spark {} during broadcast: {}", spark.id(), e);
                    result.skipped += 1;
                }
            }
        }
        result
    }

    /// Emit a named event to every live member
    ///
    /// Broadcast emits carry no acknowledgement: acks are a point-to-point
    /// feature of `emit_with_ack` on a single spark or channel.
    pub async fn emit(&self, event: &str, payload: Value) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        for spark in self.targets().await {
            match spark.channel().emit(event, payload.clone()).await {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    debug!("Skipping spark {} during broadcast: {}", spark.id(), e);
                    result.skipped += 1;
                }
            }
        }
        result
    }

    async fn targets(&self) -> Vec<Arc<Spark>> {
        let registry = match self.registry.upgrade() {
            Some(registry) => registry,
            None => return Vec::new(),
        };

        let ids = self.manager.resolve(&self.rooms).await;
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            if Some(id) == self.except {
                continue;
            }
            if let Some(spark) = registry.get(id).await {
                targets.push(spark);
            }
        }
        targets
    }
}

/// Outcome of one broadcast fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Targets the frame was handed to
    pub delivered: usize,
    /// Targets skipped because their channel was no longer open
    pub skipped: usize,
}

impl BroadcastResult {
    pub fn total(&self) -> usize {
        self.delivered + self.skipped
    }
}
