//! # ShardRelay
//!
//! A sharding proxy that sits between an application's data-access layer and
//! several physical database connections, routing every call to the right
//! shard.
//!
//! ## Architecture
//!
//! - **Core** (`shardrelay-core`): shard names, records, statements, errors
//! - **Config** (`shardrelay-config`): layered configuration and topology
//! - **Driver** (`shardrelay-driver`): connection traits and the in-memory driver
//! - **Proxy** (this crate): selection, pooling, trackers, scoped context,
//!   associations, migrations

#![warn(rust_2018_idioms, unused_qualifications)]
#![deny(unsafe_code)]

/// Shard affinity for associations
pub mod association;

/// Routing decisions and call state
pub mod call;

/// Task-local routing context
pub mod context;

/// Process-wide proxy instance
pub mod global;

/// Tracing subscriber setup
pub mod logging;

/// Schema migrations across shards
pub mod migration;

/// Model registrations
pub mod model;

/// Placement directory
pub mod placement;

/// Connection pool
pub mod pool;

/// The routing proxy
pub mod proxy;

/// Round-robin selection
pub mod selector;

/// Shard trackers
pub mod tracker;

pub use call::{Route, RouteSource};
pub use migration::{CancellationFlag, Migration, MigrationReport, MigrationTarget, ShardStatus};
pub use model::{ModelBinding, ModelRegistry};
pub use proxy::{LifecycleHook, ProxyBuilder, RoutingProxy, ShardScope};
pub use selector::SelectOptions;
pub use tracker::{AttributeTracker, DynamicTracker, ShardTracker};

// Re-export commonly used types for convenience
pub use shardrelay_config::{ConfigLoader, ShardRelayConfig};
pub use shardrelay_core::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
