//! Round-robin shard selection

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use shardrelay_config::RoutingSection;
use shardrelay_core::{GroupName, ShardName};

/// Options controlling which shards a selection may return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// Let the selection return `master`
    pub include_master: bool,
    /// Start a fresh cursor at a random position instead of the first shard
    pub start_with_random_shard: bool,
}

impl SelectOptions {
    pub fn including_master(mut self) -> Self {
        self.include_master = true;
        self
    }

    pub fn random_start(mut self) -> Self {
        self.start_with_random_shard = true;
        self
    }
}

impl From<&RoutingSection> for SelectOptions {
    fn from(section: &RoutingSection) -> Self {
        Self {
            include_master: section.include_master,
            start_with_random_shard: section.start_with_random_shard,
        }
    }
}

/// Identifies an independent round-robin cursor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CursorKey {
    /// Cursor shared by every selection over the whole shard set
    Global,
    /// Cursor for selections inside one group
    Group(GroupName),
}

/// Picks the next shard from a candidate list
///
/// Each cursor advances exactly once per call; concurrent callers are
/// serialized on the cursor map.
#[derive(Debug, Default)]
pub struct ShardSelector {
    cursors: Mutex<HashMap<CursorKey, usize>>,
}

impl ShardSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the next shard for `key` among `candidates`
    ///
    /// `master` is dropped from the candidates unless the options include it.
    /// When nothing is eligible the result is `master` and no cursor moves.
    pub fn resolve(&self, candidates: &[ShardName], key: &CursorKey, options: SelectOptions) -> ShardName {
        let eligible: Vec<&ShardName> = candidates
            .iter()
            .filter(|shard| options.include_master || !shard.is_master())
            .collect();

        if eligible.is_empty() {
            return ShardName::master();
        }

        let len = eligible.len();
        let mut cursors = self.lock();
        let index = match cursors.get(key) {
            Some(cursor) => (cursor + 1) % len,
            None if options.start_with_random_shard => rand::thread_rng().gen_range(0..len),
            None => 0,
        };
        cursors.insert(key.clone(), index);

        eligible[index].clone()
    }

    /// Forget every cursor
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CursorKey, usize>> {
        // The map stays consistent even if a holder panicked
        self.cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
