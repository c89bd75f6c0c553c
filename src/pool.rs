//! Connection pool keyed by shard name

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use shardrelay_config::{ConnectionParams, ShardGroup, ShardTopology};
use shardrelay_core::{GroupName, QueryResult, Result, ShardName, ShardRelayError, Statement};
use shardrelay_driver::{Connection, Connector};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};

/// An opened connection owned by the pool
///
/// Statements share the connection unless an [`ExclusiveSession`] holds the
/// shard's gate, in which case they wait for it to be released.
pub struct ShardHandle {
    shard: ShardName,
    connection: Box<dyn Connection>,
    alive: AtomicBool,
    generation: u64,
    gate: Arc<RwLock<()>>,
}

impl ShardHandle {
    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the handle so the next `get` reopens it
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Execute a statement, attaching the shard name to any failure
    pub async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        let _shared = self.gate.read().await;
        self.run(statement).await
    }

    /// Wait for every other user of the shard to finish, then keep the
    /// connection to the caller until the session is dropped
    pub async fn exclusive(self: &Arc<Self>) -> ExclusiveSession {
        let guard = self.gate.clone().write_owned().await;
        tracing::debug!("Holding shard {} exclusively", self.shard);
        ExclusiveSession {
            handle: self.clone(),
            _guard: guard,
        }
    }

    async fn run(&self, statement: &Statement) -> Result<QueryResult> {
        tracing::trace!("Executing {} on shard {}", statement.kind(), self.shard);
        self.connection
            .execute(statement)
            .await
            .map_err(|e| ShardRelayError::query(self.shard.clone(), e))
    }

    async fn close(&self) {
        self.mark_dead();
        if let Err(e) = self.connection.close().await {
            tracing::warn!("Failed to close connection to shard {}: {}", self.shard, e);
        } else {
            tracing::info!("Closed connection to shard {} (generation {})", self.shard, self.generation);
        }
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("shard", &self.shard)
            .field("alive", &self.is_alive())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Sole use of one shard's connection, held for a transaction
pub struct ExclusiveSession {
    handle: Arc<ShardHandle>,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl ExclusiveSession {
    pub fn shard(&self) -> &ShardName {
        self.handle.shard()
    }

    pub fn generation(&self) -> u64 {
        self.handle.generation()
    }

    pub async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        self.handle.run(statement).await
    }
}

impl std::fmt::Debug for ExclusiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveSession").field("handle", &self.handle).finish()
    }
}

struct Slot {
    params: ConnectionParams,
    handle: Mutex<Option<Arc<ShardHandle>>>,
    gate: Arc<RwLock<()>>,
}

struct PoolState {
    generation: u64,
    topology: ShardTopology,
    slots: HashMap<ShardName, Arc<Slot>>,
    retired: AtomicBool,
}

impl PoolState {
    fn new(generation: u64, topology: ShardTopology) -> Self {
        let slots = topology
            .entries()
            .iter()
            .map(|entry| {
                let slot = Slot {
                    params: entry.params.clone(),
                    handle: Mutex::new(None),
                    gate: Arc::new(RwLock::new(())),
                };
                (entry.name.clone(), Arc::new(slot))
            })
            .collect();

        Self {
            generation,
            topology,
            slots,
            retired: AtomicBool::new(false),
        }
    }

    async fn close_handles(&self) {
        for slot in self.slots.values() {
            if let Some(handle) = slot.handle.lock().await.take() {
                handle.close().await;
            }
        }
    }
}

/// Pool of shard connections
///
/// Connections are opened lazily, at most once per shard and generation.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    state: RwLock<Arc<PoolState>>,
    next_generation: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool for the given topology without opening anything
    pub fn new(connector: Arc<dyn Connector>, topology: ShardTopology) -> Self {
        Self {
            connector,
            state: RwLock::new(Arc::new(PoolState::new(1, topology))),
            next_generation: AtomicU64::new(2),
        }
    }

    async fn current(&self) -> Arc<PoolState> {
        self.state.read().await.clone()
    }

    /// Get the connection for a shard, opening it if needed
    pub async fn get(&self, shard: &ShardName) -> Result<Arc<ShardHandle>> {
        loop {
            let state = self.current().await;
            let slot = state
                .slots
                .get(shard)
                .cloned()
                .ok_or_else(|| ShardRelayError::unknown_shard(shard.clone()))?;

            let mut guard = slot.handle.lock().await;
            if state.retired.load(Ordering::Acquire) {
                // Swapped out while waiting; retry against the new generation
                continue;
            }

            if let Some(handle) = guard.as_ref() {
                if handle.is_alive() {
                    return Ok(handle.clone());
                }
                tracing::info!("Reopening dead connection to shard {}", shard);
                handle.close().await;
            }

            let handle = self.open(shard, &slot, state.generation).await?;
            if state.retired.load(Ordering::Acquire) {
                // Reinitialized while the connection was opening
                handle.close().await;
                continue;
            }
            *guard = Some(handle.clone());
            return Ok(handle);
        }
    }

    async fn open(&self, shard: &ShardName, slot: &Slot, generation: u64) -> Result<Arc<ShardHandle>> {
        let params = &slot.params;
        let connection = self.connector.open(shard, params).await.map_err(|e| match e {
            ShardRelayError::ConnectionUnavailable { .. } => e,
            other => ShardRelayError::connection_unavailable(shard.clone(), other),
        })?;

        tracing::info!(
            "Opened connection to shard {} ({} adapter, generation {})",
            shard,
            params.adapter,
            generation
        );

        Ok(Arc::new(ShardHandle {
            shard: shard.clone(),
            connection,
            alive: AtomicBool::new(true),
            generation,
            gate: slot.gate.clone(),
        }))
    }

    /// Ping a shard, marking its handle dead when the ping fails
    pub async fn verify(&self, shard: &ShardName) -> Result<()> {
        let handle = self.get(shard).await?;
        if let Err(e) = handle.connection.ping().await {
            handle.mark_dead();
            tracing::warn!("Connection to shard {} failed verification: {}", shard, e);
            return Err(ShardRelayError::connection_unavailable(shard.clone(), e));
        }
        Ok(())
    }

    /// Close and reopen the connection for one shard
    pub async fn reconnect(&self, shard: &ShardName) -> Result<Arc<ShardHandle>> {
        let state = self.current().await;
        let slot = state
            .slots
            .get(shard)
            .cloned()
            .ok_or_else(|| ShardRelayError::unknown_shard(shard.clone()))?;

        let mut guard = slot.handle.lock().await;
        if let Some(old) = guard.take() {
            old.close().await;
        }

        let handle = self.open(shard, &slot, state.generation).await?;
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Close every open connection; shards reopen lazily afterwards
    pub async fn close_all(&self) {
        self.current().await.close_handles().await;
    }

    /// Replace the topology with a new generation
    ///
    /// Nothing is opened for the new generation. Handles of the retired
    /// generation are closed after the swap.
    pub async fn reinitialize(&self, topology: ShardTopology) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let fresh = Arc::new(PoolState::new(generation, topology));

        let retired = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, fresh)
        };

        retired.retired.store(true, Ordering::Release);
        retired.close_handles().await;

        tracing::info!(
            "Connection pool reinitialized (generation {} -> {})",
            retired.generation,
            generation
        );
        generation
    }

    pub async fn generation(&self) -> u64 {
        self.current().await.generation
    }

    pub async fn topology(&self) -> ShardTopology {
        self.current().await.topology.clone()
    }

    pub async fn enabled(&self) -> bool {
        self.current().await.topology.enabled()
    }

    /// Shard names in configuration order, `master` first
    pub async fn shard_names(&self) -> Vec<ShardName> {
        self.current().await.topology.shard_names()
    }

    pub async fn group_names(&self) -> Vec<GroupName> {
        let state = self.current().await;
        state.topology.groups().iter().map(|group| group.name.clone()).collect()
    }

    pub async fn groups(&self) -> Vec<ShardGroup> {
        self.current().await.topology.groups().to_vec()
    }

    pub async fn group_members(&self, group: &GroupName) -> Result<Vec<ShardName>> {
        let state = self.current().await;
        state
            .topology
            .group(group)
            .map(|group| group.members.clone())
            .ok_or_else(|| ShardRelayError::unknown_group(group.clone()))
    }

    pub async fn contains(&self, shard: &ShardName) -> bool {
        self.current().await.slots.contains_key(shard)
    }

    /// Number of shards with an open connection
    pub async fn open_count(&self) -> usize {
        let state = self.current().await;
        let mut count = 0;
        for slot in state.slots.values() {
            if slot.handle.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardrelay_driver::MemoryConnector;
    use std::time::Duration;

    fn topology() -> ShardTopology {
        ShardTopology::master_only(ConnectionParams::default())
            .with_shard("alpha", ConnectionParams::default())
            .unwrap()
            .with_grouped_shard("beta", "replicas", ConnectionParams::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_opens_lazily_and_caches() {
        let memory = Arc::new(MemoryConnector::new());
        let pool = ConnectionPool::new(memory.clone(), topology());
        let alpha = ShardName::from("alpha");

        assert_eq!(pool.open_count().await, 0);
        let first = pool.get(&alpha).await.unwrap();
        let second = pool.get(&alpha).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memory.opens(&alpha).await, 1);
        assert_eq!(pool.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_get_unknown_shard() {
        let pool = ConnectionPool::new(Arc::new(MemoryConnector::new()), topology());

        let err = pool.get(&ShardName::from("omega")).await.unwrap_err();
        assert!(matches!(err, ShardRelayError::UnknownShard { .. }));
    }

    #[tokio::test]
    async fn test_verify_marks_dead_and_get_reopens() {
        let memory = Arc::new(MemoryConnector::new());
        let pool = ConnectionPool::new(memory.clone(), topology());
        let alpha = ShardName::from("alpha");

        memory.fail_ping(&alpha, true).await;
        let err = pool.verify(&alpha).await.unwrap_err();
        assert!(matches!(err, ShardRelayError::ConnectionUnavailable { .. }));

        memory.fail_ping(&alpha, false).await;
        let handle = pool.get(&alpha).await.unwrap();
        assert!(handle.is_alive());
        assert_eq!(memory.opens(&alpha).await, 2);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        let memory = Arc::new(MemoryConnector::new());
        let pool = ConnectionPool::new(memory.clone(), topology());
        let beta = ShardName::from("beta");

        memory.refuse_connections(&beta, true).await;
        let err = pool.get(&beta).await.unwrap_err();
        assert_eq!(err.shard(), Some(&beta));
        assert_eq!(pool.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_handle() {
        let memory = Arc::new(MemoryConnector::new());
        let pool = ConnectionPool::new(memory.clone(), topology());
        let alpha = ShardName::from("alpha");

        let old = pool.get(&alpha).await.unwrap();
        let new = pool.reconnect(&alpha).await.unwrap();

        assert!(!old.is_alive());
        assert!(new.is_alive());
        assert_eq!(memory.opens(&alpha).await, 2);
    }

    #[tokio::test]
    async fn test_reinitialize_swaps_generation() {
        let memory = Arc::new(MemoryConnector::new());
        let pool = ConnectionPool::new(memory.clone(), topology());
        let alpha = ShardName::from("alpha");

        let old = pool.get(&alpha).await.unwrap();
        assert_eq!(old.generation(), 1);

        let replacement = ShardTopology::master_only(ConnectionParams::default())
            .with_shard("gamma", ConnectionParams::default())
            .unwrap();
        let generation = pool.reinitialize(replacement).await;

        assert_eq!(generation, 2);
        assert!(!old.is_alive());
        assert_eq!(pool.open_count().await, 0);
        assert!(!pool.contains(&alpha).await);
        assert!(pool.contains(&ShardName::from("gamma")).await);
        assert_eq!(pool.get(&ShardName::master()).await.unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_get_racing_reinitialize_returns_current_generation() {
        let memory = Arc::new(MemoryConnector::new().with_open_delay(Duration::from_millis(50)));
        let pool = Arc::new(ConnectionPool::new(memory.clone(), topology()));
        let alpha = ShardName::from("alpha");

        let pending = tokio::spawn({
            let pool = pool.clone();
            let alpha = alpha.clone();
            async move { pool.get(&alpha).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.reinitialize(topology()).await, 2);

        let handle = pending.await.unwrap().unwrap();
        assert_eq!(handle.generation(), 2);
        assert!(handle.is_alive());
        assert_eq!(memory.opens(&alpha).await, 2);
        assert_eq!(pool.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_exclusive_session_blocks_shared_statements() {
        let memory = Arc::new(MemoryConnector::new());
        let pool = ConnectionPool::new(memory.clone(), topology());
        let alpha = ShardName::from("alpha");
        let handle = pool.get(&alpha).await.unwrap();

        let session = handle.exclusive().await;
        session.execute(&Statement::raw("LOCK")).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(20), handle.execute(&Statement::raw("SELECT 1"))).await;
        assert!(waiting.is_err());

        drop(session);
        handle.execute(&Statement::raw("SELECT 1")).await.unwrap();
        assert_eq!(memory.raw_statements(&alpha).await, vec!["LOCK", "SELECT 1"]);
    }

    #[tokio::test]
    async fn test_group_members() {
        let pool = ConnectionPool::new(Arc::new(MemoryConnector::new()), topology());

        let members = pool.group_members(&GroupName::from("replicas")).await.unwrap();
        assert_eq!(members, vec![ShardName::from("beta")]);
        assert_eq!(pool.group_names().await, vec![GroupName::from("replicas")]);

        let err = pool.group_members(&GroupName::from("missing")).await.unwrap_err();
        assert!(matches!(err, ShardRelayError::UnknownGroup { .. }));
    }
}
