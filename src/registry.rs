//! Spark registry and named channel groups
//!
//! The registry is owned by one server instance and passed by reference to
//! everything that needs it; there is no process-wide singleton, so several
//! independent servers coexist safely.

use crate::spark::Spark;
use crate::types::{ConnectionId, SparkId};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

type ConnectionHandler = Arc<dyn Fn(Arc<Spark>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Server-side view of one channel name across all connections
///
/// Fires its `connection` handlers exactly once per new spark, at the
/// moment the remote side first addresses the channel.
pub struct ChannelGroup {
    name: String,
    handlers: RwLock<Vec<ConnectionHandler>>,
}

impl ChannelGroup {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            handlers: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler invoked for every spark that opens this channel
    pub async fn on_connection<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Spark>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: ConnectionHandler =
            Arc::new(move |spark| -> BoxFuture<'static, ()> { Box::pin(handler(spark)) });
        self.handlers.write().await.push(wrapped);
    }

    /// Invoke every connection handler, in registration order
    pub(crate) async fn fire(&self, spark: Arc<Spark>) {
        let handlers: Vec<ConnectionHandler> = self.handlers.read().await.clone();
        for handler in handlers {
            handler(Arc::clone(&spark)).await;
        }
    }
}

/// Table of live sparks, one per (connection, channel name) pair
pub struct SparkRegistry {
    inner: RwLock<RegistryTables>,
    groups: RwLock<HashMap<String, Arc<ChannelGroup>>>,
}

#[derive(Default)]
struct RegistryTables {
    by_channel: HashMap<(ConnectionId, String), Arc<Spark>>,
    by_id: HashMap<SparkId, Arc<Spark>>,
}

impl SparkRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(RegistryTables::default()),
            groups: RwLock::new(HashMap::new()),
        })
    }

    /// Get or create the channel group for a name
    pub(crate) async fn group(&self, name: &str) -> Arc<ChannelGroup> {
        let mut groups = self.groups.write().await;
        Arc::clone(
            groups
                .entry(name.to_string())
                .or_insert_with(|| ChannelGroup::new(name.to_string())),
        )
    }

    /// Look up the spark for a (connection, channel name) pair
    pub(crate) async fn lookup(&self, connection: ConnectionId, channel: &str) -> Option<Arc<Spark>> {
        let tables = self.inner.read().await;
        tables
            .by_channel
            .get(&(connection, channel.to_string()))
            .cloned()
    }

    /// Look up a spark by id
    pub async fn get(&self, id: SparkId) -> Option<Arc<Spark>> {
        let tables = self.inner.read().await;
        tables.by_id.get(&id).cloned()
    }

    pub(crate) async fn insert(&self, connection: ConnectionId, channel: &str, spark: Arc<Spark>) {
        let mut tables = self.inner.write().await;
        tables
            .by_channel
            .insert((connection, channel.to_string()), Arc::clone(&spark));
        tables.by_id.insert(spark.id(), spark);
    }

    /// Remove the spark for one channel of one connection
    pub(crate) async fn remove(
        &self,
        connection: ConnectionId,
        channel: &str,
    ) -> Option<Arc<Spark>> {
        let mut tables = self.inner.write().await;
        let spark = tables.by_channel.remove(&(connection, channel.to_string()));
        if let Some(spark) = &spark {
            tables.by_id.remove(&spark.id());
        }
        spark
    }

    /// Remove every spark belonging to a connection
    pub(crate) async fn remove_connection(&self, connection: ConnectionId) -> Vec<Arc<Spark>> {
        let mut tables = self.inner.write().await;
        let keys: Vec<_> = tables
            .by_channel
            .keys()
            .filter(|(conn, _)| *conn == connection)
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(spark) = tables.by_channel.remove(&key) {
                tables.by_id.remove(&spark.id());
                removed.push(spark);
            }
        }

        if !removed.is_empty() {
            info!(
                "Removed {} sparks for connection {}",
                removed.len(),
                connection
            );
        }

        removed
    }

    /// Number of live sparks
    pub async fn spark_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }
}
