//! Directory of where saved records were placed

use std::collections::{BTreeSet, HashMap};

use shardrelay_core::{Datum, ShardName};
use tokio::sync::Mutex;

type PlacementKey = (String, Datum);

/// Where a primary key was saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Unique(ShardName),
    /// The key was saved on more than one shard, so it cannot locate a
    /// record on its own
    Ambiguous(BTreeSet<ShardName>),
}

impl Placement {
    pub fn shards(&self) -> Vec<ShardName> {
        match self {
            Placement::Unique(shard) => vec![shard.clone()],
            Placement::Ambiguous(shards) => shards.iter().cloned().collect(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    placement: Placement,
    last_used: u64,
}

#[derive(Debug)]
struct Directory {
    entries: HashMap<PlacementKey, Entry>,
    capacity: usize,
    clock: u64,
    evictions: u64,
}

impl Directory {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop the least recently used entry
    fn evict_one(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }
}

/// Remembers the shard of records saved through the proxy so finds by
/// primary key return to the same shard
///
/// Holds at most `capacity` keys; the least recently used one is forgotten
/// first.
#[derive(Debug)]
pub struct PlacementDirectory {
    inner: Mutex<Directory>,
}

impl PlacementDirectory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Directory {
                entries: HashMap::new(),
                capacity: capacity.max(1),
                clock: 0,
                evictions: 0,
            }),
        }
    }

    pub async fn lookup(&self, model: &str, key: &Datum) -> Option<Placement> {
        let mut directory = self.inner.lock().await;
        let now = directory.tick();
        let entry = directory.entries.get_mut(&(model.to_string(), key.clone()))?;
        entry.last_used = now;
        Some(entry.placement.clone())
    }

    /// Remember that `key` was saved on `shard`
    ///
    /// A key already known on another shard becomes ambiguous.
    pub async fn record(&self, model: &str, key: &Datum, shard: &ShardName) {
        let mut directory = self.inner.lock().await;
        let now = directory.tick();
        let entry_key = (model.to_string(), key.clone());

        if let Some(entry) = directory.entries.get_mut(&entry_key) {
            entry.last_used = now;
            match &mut entry.placement {
                Placement::Unique(existing) if existing == shard => {}
                Placement::Unique(existing) => {
                    tracing::warn!(
                        "{} record {} saved on shards {} and {}; finds by this key need an explicit shard",
                        model,
                        key,
                        existing,
                        shard
                    );
                    let shards = BTreeSet::from([existing.clone(), shard.clone()]);
                    entry.placement = Placement::Ambiguous(shards);
                }
                Placement::Ambiguous(shards) => {
                    shards.insert(shard.clone());
                }
            }
            return;
        }

        while directory.entries.len() >= directory.capacity {
            directory.evict_one();
        }
        directory.entries.insert(
            entry_key,
            Entry {
                placement: Placement::Unique(shard.clone()),
                last_used: now,
            },
        );
    }

    /// Forget that `key` lives on `shard`
    pub async fn evict(&self, model: &str, key: &Datum, shard: &ShardName) {
        let mut directory = self.inner.lock().await;
        let entry_key = (model.to_string(), key.clone());

        let Some(entry) = directory.entries.get_mut(&entry_key) else {
            return;
        };
        let remaining = match &mut entry.placement {
            Placement::Unique(existing) if existing == shard => None,
            Placement::Unique(_) => return,
            Placement::Ambiguous(shards) => {
                shards.remove(shard);
                let mut left = shards.iter().cloned();
                match (left.next(), left.next()) {
                    (Some(only), None) => Some(Placement::Unique(only)),
                    (None, _) => None,
                    _ => return,
                }
            }
        };

        match remaining {
            Some(placement) => entry.placement = placement,
            None => {
                directory.entries.remove(&entry_key);
            }
        }
    }

    /// Forget everything, taking a new capacity
    pub async fn reset(&self, capacity: usize) {
        let mut directory = self.inner.lock().await;
        directory.entries.clear();
        directory.capacity = capacity.max(1);
    }

    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity
    }

    /// Entries dropped to stay within capacity
    pub async fn evictions(&self) -> u64 {
        self.inner.lock().await.evictions
    }
}
