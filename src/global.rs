//! Process-wide proxy instance
//!
//! Callers that prefer module-level functions install one proxy at startup
//! and tear it down explicitly.

use std::sync::Arc;

use shardrelay_core::{Result, ShardName, ShardRelayError};
use tokio::sync::RwLock;

use crate::proxy::RoutingProxy;
use crate::selector::SelectOptions;

static GLOBAL: RwLock<Option<Arc<RoutingProxy>>> = RwLock::const_new(None);

/// Install `proxy` as the process-wide instance
///
/// A previously installed proxy is torn down.
pub async fn install(proxy: RoutingProxy) -> Arc<RoutingProxy> {
    let proxy = Arc::new(proxy);
    let previous = GLOBAL.write().await.replace(proxy.clone());
    if let Some(previous) = previous {
        tracing::info!("Replacing the installed routing proxy");
        previous.teardown().await;
    }
    proxy
}

pub async fn current() -> Result<Arc<RoutingProxy>> {
    GLOBAL
        .read()
        .await
        .clone()
        .ok_or_else(|| ShardRelayError::routing("No routing proxy installed"))
}

/// Remove and tear down the installed proxy
pub async fn teardown() -> Result<()> {
    let proxy = GLOBAL
        .write()
        .await
        .take()
        .ok_or_else(|| ShardRelayError::routing("No routing proxy installed"))?;
    proxy.teardown().await;
    Ok(())
}

pub async fn choose_next_shard(options: SelectOptions) -> Result<ShardName> {
    Ok(current().await?.choose_next_shard(options).await)
}

pub async fn shards() -> Result<Vec<ShardName>> {
    Ok(current().await?.shards().await)
}
