//! Routable records
//!
//! The proxy never reaches into an ORM's record internals. Anything that can
//! report its model, primary key, attributes and assigned shard can be routed.

use serde::{Deserialize, Serialize};

use crate::{Datum, Row, ShardName};

/// Default primary key column
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Capability interface the routing proxy depends on
pub trait Routable: Send + Sync {
    /// Name of the model this record belongs to
    fn model_name(&self) -> &str;

    /// Column holding the primary key
    fn primary_key_column(&self) -> &str {
        DEFAULT_PRIMARY_KEY
    }

    /// Primary key value, if assigned
    fn primary_key(&self) -> Option<&Datum> {
        self.attribute(self.primary_key_column()).filter(|value| !value.is_null())
    }

    fn attribute(&self, column: &str) -> Option<&Datum>;

    fn set_attribute(&mut self, column: &str, value: Datum);

    /// Shard the record was loaded from or assigned to
    fn current_shard(&self) -> Option<&ShardName>;

    fn set_current_shard(&mut self, shard: ShardName);

    /// Whether the record exists in a shard
    fn is_persisted(&self) -> bool;

    fn mark_persisted(&mut self, persisted: bool);

    /// Column values written to the driver
    fn to_row(&self) -> Row;
}

/// Generic attribute-map record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    model: String,
    primary_key_column: String,
    attributes: Row,
    current_shard: Option<ShardName>,
    persisted: bool,
}

impl Record {
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            primary_key_column: DEFAULT_PRIMARY_KEY.to_string(),
            attributes: Row::new(),
            current_shard: None,
            persisted: false,
        }
    }

    /// Build a record from a row loaded on the given shard
    pub fn loaded<S: Into<String>>(model: S, primary_key_column: &str, row: Row, shard: ShardName) -> Self {
        Self {
            model: model.into(),
            primary_key_column: primary_key_column.to_string(),
            attributes: row,
            current_shard: Some(shard),
            persisted: true,
        }
    }

    pub fn with_primary_key_column<S: Into<String>>(mut self, column: S) -> Self {
        self.primary_key_column = column.into();
        self
    }

    pub fn with<V: Into<Datum>>(mut self, column: &str, value: V) -> Self {
        self.attributes.insert(column.to_string(), value.into());
        self
    }

    pub fn attributes(&self) -> &Row {
        &self.attributes
    }
}

impl Routable for Record {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn primary_key_column(&self) -> &str {
        &self.primary_key_column
    }

    fn attribute(&self, column: &str) -> Option<&Datum> {
        self.attributes.get(column)
    }

    fn set_attribute(&mut self, column: &str, value: Datum) {
        self.attributes.insert(column.to_string(), value);
    }

    fn current_shard(&self) -> Option<&ShardName> {
        self.current_shard.as_ref()
    }

    fn set_current_shard(&mut self, shard: ShardName) {
        self.current_shard = Some(shard);
    }

    fn is_persisted(&self) -> bool {
        self.persisted
    }

    fn mark_persisted(&mut self, persisted: bool) {
        self.persisted = persisted;
    }

    fn to_row(&self) -> Row {
        self.attributes.clone()
    }
}
