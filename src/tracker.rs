//! Strategies deciding which shard a record lives on

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use shardrelay_core::{BoxError, Datum, Result, Routable, ShardName, ShardRelayError, TrackerKind};

/// User function deciding the shard of a record
///
/// Must be free of side effects: it runs before the record has a connection
/// and may be called with a probe record carrying only the primary key.
pub type ShardFn =
    dyn Fn(&dyn Routable) -> std::result::Result<Option<ShardName>, BoxError> + Send + Sync;

/// Tracks shards through a column stored on the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeTracker {
    column: String,
    lookup: Option<HashMap<Datum, ShardName>>,
}

impl AttributeTracker {
    /// The column holds the shard name as text
    pub fn new<S: Into<String>>(column: S) -> Self {
        Self {
            column: column.into(),
            lookup: None,
        }
    }

    /// Map a column value to a shard
    pub fn with_mapping<V: Into<Datum>, S: Into<ShardName>>(mut self, value: V, shard: S) -> Self {
        self.lookup
            .get_or_insert_with(HashMap::new)
            .insert(value.into(), shard.into());
        self
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Shard for a raw column value
    pub fn shard_for_value(&self, value: &Datum) -> std::result::Result<Option<ShardName>, BoxError> {
        if value.is_null() {
            return Ok(None);
        }

        match &self.lookup {
            Some(lookup) => lookup
                .get(value)
                .cloned()
                .map(Some)
                .ok_or_else(|| format!("no shard mapped for {} = {}", self.column, value).into()),
            None => value
                .as_text()
                .map(|name| Some(ShardName::from(name)))
                .ok_or_else(|| format!("{} = {} is not a shard name", self.column, value).into()),
        }
    }

    /// Column value recorded for a shard
    pub fn value_for(&self, shard: &ShardName) -> std::result::Result<Datum, BoxError> {
        match &self.lookup {
            Some(lookup) => {
                // Lowest value wins when several map to the same shard
                let mut values: Vec<&Datum> = lookup
                    .iter()
                    .filter(|(_, mapped)| *mapped == shard)
                    .map(|(value, _)| value)
                    .collect();
                values.sort();
                values
                    .first()
                    .map(|value| (*value).clone())
                    .ok_or_else(|| format!("no {} value maps to shard {}", self.column, shard).into())
            }
            None => Ok(Datum::from(shard)),
        }
    }
}

/// Tracks shards through a user function
#[derive(Clone)]
pub struct DynamicTracker {
    resolver: Arc<ShardFn>,
}

impl DynamicTracker {
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn(&dyn Routable) -> std::result::Result<Option<ShardName>, BoxError> + Send + Sync + 'static,
    {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Spread integer primary keys over `shards` by remainder
    ///
    /// Records need their key before the first save; a key assigned by a
    /// shard could point at another one.
    pub fn modulo(shards: Vec<ShardName>) -> Self {
        Self::new(move |record: &dyn Routable| {
            if shards.is_empty() {
                return Err("modulo tracker has no shards".into());
            }
            let Some(key) = record.primary_key() else {
                return Err("record has no primary key to place it by".into());
            };
            let key = key
                .as_int()
                .ok_or_else(|| format!("primary key {} is not an integer", key))?;
            let index = key.rem_euclid(shards.len() as i64) as usize;
            Ok(Some(shards[index].clone()))
        })
    }

    fn resolve(&self, record: &dyn Routable) -> std::result::Result<Option<ShardName>, BoxError> {
        (self.resolver)(record)
    }
}

impl fmt::Debug for DynamicTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicTracker").finish_non_exhaustive()
    }
}

/// Shard tracking strategy bound to a model
#[derive(Debug, Clone)]
pub enum ShardTracker {
    Attribute(AttributeTracker),
    Dynamic(DynamicTracker),
}

impl ShardTracker {
    pub fn attribute<S: Into<String>>(column: S) -> Self {
        Self::Attribute(AttributeTracker::new(column))
    }

    pub fn dynamic<F>(resolver: F) -> Self
    where
        F: Fn(&dyn Routable) -> std::result::Result<Option<ShardName>, BoxError> + Send + Sync + 'static,
    {
        Self::Dynamic(DynamicTracker::new(resolver))
    }

    pub fn modulo(shards: Vec<ShardName>) -> Self {
        Self::Dynamic(DynamicTracker::modulo(shards))
    }

    pub fn kind(&self) -> TrackerKind {
        match self {
            ShardTracker::Attribute(_) => TrackerKind::Attribute,
            ShardTracker::Dynamic(_) => TrackerKind::Dynamic,
        }
    }

    /// Which shard the record belongs to, if the tracker can tell
    pub fn shard_for(&self, record: &dyn Routable) -> Result<Option<ShardName>> {
        let resolved = match self {
            ShardTracker::Attribute(tracker) => match record.attribute(tracker.column()) {
                Some(value) => tracker.shard_for_value(value),
                None => Ok(None),
            },
            ShardTracker::Dynamic(tracker) => tracker.resolve(record),
        };

        resolved.map_err(|e| self.error(record, e))
    }

    /// Record the chosen shard on the record itself
    ///
    /// Dynamic trackers derive the shard from data the record already has,
    /// so only attribute trackers write anything.
    pub fn stamp(&self, record: &mut dyn Routable, shard: &ShardName) -> Result<()> {
        if let ShardTracker::Attribute(tracker) = self {
            let value = tracker.value_for(shard).map_err(|e| self.error(&*record, e))?;
            record.set_attribute(tracker.column(), value);
        }
        Ok(())
    }

    fn error(&self, record: &dyn Routable, source: BoxError) -> ShardRelayError {
        let description = match record.primary_key() {
            Some(key) => key.to_string(),
            None => "(new)".to_string(),
        };
        ShardRelayError::tracker(record.model_name(), description, self.kind(), source)
    }
}
