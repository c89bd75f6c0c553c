//! Driver abstraction consumed by the connection pool

use async_trait::async_trait;
use shardrelay_config::ConnectionParams;
use shardrelay_core::{QueryResult, Result, ShardName, ShardRelayError, Statement};
use std::collections::HashMap;
use std::sync::Arc;

/// A physical connection to one shard
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement
    async fn execute(&self, statement: &Statement) -> Result<QueryResult>;

    /// Check that the connection is still usable
    async fn ping(&self) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Opens physical connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to the given shard
    async fn open(&self, shard: &ShardName, params: &ConnectionParams) -> Result<Box<dyn Connection>>;
}

/// Connector dispatching on the `adapter` connection parameter
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    adapters: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector for an adapter name
    pub fn register<S: Into<String>>(mut self, adapter: S, connector: Arc<dyn Connector>) -> Self {
        self.adapters.insert(adapter.into(), connector);
        self
    }

    pub fn adapters(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl Connector for ConnectorRegistry {
    async fn open(&self, shard: &ShardName, params: &ConnectionParams) -> Result<Box<dyn Connection>> {
        match self.adapters.get(&params.adapter) {
            Some(connector) => connector.open(shard, params).await,
            None => Err(ShardRelayError::config(format!(
                "No connector registered for adapter {} (shard {})",
                params.adapter, shard
            ))),
        }
    }
}
