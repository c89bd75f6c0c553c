//! Common test utilities and helpers

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use shardrelay::{ModelBinding, Record, Routable, RoutingProxy, ShardTracker};
use shardrelay_config::{ConnectionParams, EnvironmentSection, ShardDefinition, ShardRelayConfig};
use shardrelay_core::{Result, ShardName, ShardRelayError};
use shardrelay_driver::MemoryConnector;
use tempfile::TempDir;

/// Shards of the default test topology, in configuration order
pub const SHARDS: [&str; 3] = ["alpha", "beta", "gamma"];

pub fn shard(name: &str) -> ShardName {
    ShardName::from(name)
}

pub fn shards(names: &[&str]) -> Vec<ShardName> {
    names.iter().map(|name| shard(name)).collect()
}

/// Production config with ungrouped shards
pub fn sharded_config(names: &[&str]) -> ShardRelayConfig {
    let definitions: Vec<(&str, Option<&str>)> = names.iter().map(|name| (*name, None)).collect();
    grouped_config(&definitions)
}

/// Production config with shards and optional group membership
pub fn grouped_config(definitions: &[(&str, Option<&str>)]) -> ShardRelayConfig {
    let mut config = ShardRelayConfig::default();
    config.env.insert(
        "production".to_string(),
        EnvironmentSection {
            master: None,
            shards: definitions
                .iter()
                .map(|(name, group)| ShardDefinition {
                    name: name.to_string(),
                    group: group.map(str::to_string),
                    connection: ConnectionParams::default(),
                })
                .collect(),
        },
    );
    config
}

/// Models used across the integration tests
///
/// - `users`: integer keys spread over the default shards by remainder
/// - `items`: shard stored in the `shard_name` column
/// - `events`: tracked, but the tracker never decides, so saves round-robin
/// - `audits`, `settings`: untracked
pub fn default_models() -> Vec<ModelBinding> {
    vec![
        ModelBinding::new("users")
            .tracked_by(ShardTracker::modulo(shards(&SHARDS)))
            .has_many("items", "items", "user_id")
            .has_many_cross_shard("audits", "audits", "user_id"),
        ModelBinding::new("items")
            .tracked_by(ShardTracker::attribute("shard_name"))
            .belongs_to("user", "users", "user_id"),
        ModelBinding::new("events").tracked_by(ShardTracker::dynamic(|_record: &dyn Routable| Ok(None))),
        ModelBinding::new("audits"),
        ModelBinding::new("settings"),
    ]
}

/// Test environment setup
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub memory: Arc<MemoryConnector>,
    pub proxy: Arc<RoutingProxy>,
}

impl TestEnv {
    /// Default shards and models
    pub async fn new() -> Result<Self> {
        Self::with_config(sharded_config(&SHARDS)).await
    }

    pub async fn with_config(config: ShardRelayConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(MemoryConnector::new())).await
    }

    pub async fn with_connector(config: ShardRelayConfig, memory: Arc<MemoryConnector>) -> Result<Self> {
        let temp_dir = TempDir::new()
            .map_err(|e| ShardRelayError::internal(format!("Failed to create temp dir: {}", e)))?;

        let mut builder = RoutingProxy::builder(config).connector(memory.clone());
        for binding in default_models() {
            builder = builder.model(binding);
        }

        Ok(Self {
            temp_dir,
            memory,
            proxy: Arc::new(builder.build()?),
        })
    }

    /// Write a configuration file into the temp dir
    pub async fn write_config(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    /// Clean up the test environment
    pub async fn cleanup(self) {
        self.proxy.teardown().await;
    }
}

/// Test data generators
pub struct TestDataGenerator;

impl TestDataGenerator {
    pub fn users(ids: std::ops::RangeInclusive<i64>) -> Vec<Record> {
        ids.map(|id| Record::new("users").with("id", id).with("name", format!("user_{}", id)))
            .collect()
    }

    pub fn events(ids: std::ops::RangeInclusive<i64>) -> Vec<Record> {
        ids.map(|id| Record::new("events").with("id", id).with("kind", "login"))
            .collect()
    }
}
