//! Room membership bookkeeping

use crate::types::SparkId;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Maps room names to member spark ids, with a reverse map for fast teardown
///
/// Both tables are mutated under a single write lock, which keeps the
/// bidirectional membership consistent at every observation point.
pub struct RoomManager {
    inner: RwLock<RoomTables>,
}

#[derive(Default)]
struct RoomTables {
    /// Room name -> member spark ids
    rooms: HashMap<String, HashSet<SparkId>>,
    /// Spark id -> rooms it belongs to
    memberships: HashMap<SparkId, HashSet<String>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RoomTables::default()),
        }
    }

    /// Add a spark to a room, creating the room on first join
    ///
    /// Idempotent: joining a room twice has no additional effect. The
    /// membership is visible to every subsequent room operation once this
    /// call returns.
    pub(crate) async fn join(&self, spark: SparkId, room: &str) -> bool {
        let mut tables = self.inner.write().await;
        let added = tables.rooms.entry(room.to_string()).or_default().insert(spark);

        if added {
            tables
                .memberships
                .entry(spark)
                .or_default()
                .insert(room.to_string());
            info!("Spark {} joined room '{}'", spark, room);
        } else {
            debug!("Spark {} already in room '{}'", spark, room);
        }

        added
    }

    /// Remove a spark from a room; a no-op if it was not a member
    ///
    /// The room itself is removed once its last member leaves.
    pub(crate) async fn leave(&self, spark: SparkId, room: &str) -> bool {
        let mut tables = self.inner.write().await;
        let removed = match tables.rooms.get_mut(room) {
            Some(members) => members.remove(&spark),
            None => false,
        };

        if removed {
            if tables.rooms.get(room).is_some_and(HashSet::is_empty) {
                tables.rooms.remove(room);
            }
            if let Some(memberships) = tables.memberships.get_mut(&spark) {
                memberships.remove(room);
                if memberships.is_empty() {
                    tables.memberships.remove(&spark);
                }
            }
            info!("Spark {} left room '{}'", spark, room);
        } else {
            debug!("Spark {} not in room '{}'; leave is a no-op", spark, room);
        }

        removed
    }

    /// Remove a spark from every room it belongs to; returns the rooms left
    pub(crate) async fn leave_all(&self, spark: SparkId) -> Vec<String> {
        let mut tables = self.inner.write().await;
        let rooms: Vec<String> = tables
            .memberships
            .remove(&spark)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for room in &rooms {
            if let Some(members) = tables.rooms.get_mut(room) {
                members.remove(&spark);
                if members.is_empty() {
                    tables.rooms.remove(room);
                }
            }
        }

        if !rooms.is_empty() {
            info!("Spark {} left {} rooms", spark, rooms.len());
        }

        rooms
    }

    /// Rooms a spark currently belongs to
    pub async fn rooms_of(&self, spark: SparkId) -> Vec<String> {
        let tables = self.inner.read().await;
        tables
            .memberships
            .get(&spark)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All live room names
    pub async fn rooms(&self) -> Vec<String> {
        let tables = self.inner.read().await;
        tables.rooms.keys().cloned().collect()
    }

    /// Member spark ids of one room; empty if the room does not exist
    pub async fn members(&self, room: &str) -> Vec<SparkId> {
        let tables = self.inner.read().await;
        tables
            .rooms
            .get(room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Union of members across the given rooms, deduplicated
    pub(crate) async fn resolve(&self, rooms: &[String]) -> HashSet<SparkId> {
        let tables = self.inner.read().await;
        let mut union = HashSet::new();
        for room in rooms {
            if let Some(members) = tables.rooms.get(room) {
                union.extend(members.iter().copied());
            }
        }
        union
    }

    /// Manager statistics
    pub async fn stats(&self) -> RoomManagerStats {
        let tables = self.inner.read().await;
        RoomManagerStats {
            total_rooms: tables.rooms.len(),
            total_members: tables.memberships.len(),
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Room manager statistics
#[derive(Debug, Clone, Default)]
pub struct RoomManagerStats {
    pub total_rooms: usize,
    pub total_members: usize,
}
