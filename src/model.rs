//! Model registrations

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use shardrelay_core::{Result, ShardRelayError, DEFAULT_PRIMARY_KEY};

use crate::tracker::ShardTracker;

/// How an association is keyed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationKind {
    /// Target rows carry the owner's primary key in `foreign_key`
    HasMany { foreign_key: String },
    /// The owner carries the target's primary key in `foreign_key`
    BelongsTo { foreign_key: String },
}

/// A named association from one model to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDef {
    pub name: String,
    pub target_model: String,
    pub kind: AssociationKind,
    /// Resolve the target through its own tracker instead of the owner's shard
    pub cross_shard: bool,
}

/// Everything the proxy knows about one model
#[derive(Debug, Clone)]
pub struct ModelBinding {
    pub model: String,
    pub table: String,
    pub primary_key_column: String,
    pub tracker: Option<ShardTracker>,
    pub associations: BTreeMap<String, AssociationDef>,
}

impl ModelBinding {
    /// Untracked model stored in a table of the same name
    pub fn new<S: Into<String>>(model: S) -> Self {
        let model = model.into();
        Self {
            table: model.clone(),
            model,
            primary_key_column: DEFAULT_PRIMARY_KEY.to_string(),
            tracker: None,
            associations: BTreeMap::new(),
        }
    }

    pub fn table<S: Into<String>>(mut self, table: S) -> Self {
        self.table = table.into();
        self
    }

    pub fn primary_key<S: Into<String>>(mut self, column: S) -> Self {
        self.primary_key_column = column.into();
        self
    }

    pub fn tracked_by(mut self, tracker: ShardTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn has_many(self, name: &str, target_model: &str, foreign_key: &str) -> Self {
        self.associate(
            name,
            target_model,
            AssociationKind::HasMany {
                foreign_key: foreign_key.to_string(),
            },
            false,
        )
    }

    pub fn belongs_to(self, name: &str, target_model: &str, foreign_key: &str) -> Self {
        self.associate(
            name,
            target_model,
            AssociationKind::BelongsTo {
                foreign_key: foreign_key.to_string(),
            },
            false,
        )
    }

    /// Has-many association whose targets may live on any shard
    pub fn has_many_cross_shard(self, name: &str, target_model: &str, foreign_key: &str) -> Self {
        self.associate(
            name,
            target_model,
            AssociationKind::HasMany {
                foreign_key: foreign_key.to_string(),
            },
            true,
        )
    }

    fn associate(mut self, name: &str, target_model: &str, kind: AssociationKind, cross_shard: bool) -> Self {
        self.associations.insert(
            name.to_string(),
            AssociationDef {
                name: name.to_string(),
                target_model: target_model.to_string(),
                kind,
                cross_shard,
            },
        );
        self
    }

    pub fn is_tracked(&self) -> bool {
        self.tracker.is_some()
    }

    pub fn association(&self, name: &str) -> Result<&AssociationDef> {
        self.associations.get(name).ok_or_else(|| ShardRelayError::UnknownAssociation {
            model: self.model.clone(),
            association: name.to_string(),
        })
    }
}

/// Registered models, fixed once the proxy is built
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    bindings: HashMap<String, Arc<ModelBinding>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, replacing an earlier registration of the same name
    pub fn register(&mut self, binding: ModelBinding) {
        if self.bindings.contains_key(&binding.model) {
            tracing::warn!("Model {} registered twice; keeping the last binding", binding.model);
        }
        self.bindings.insert(binding.model.clone(), Arc::new(binding));
    }

    pub fn get(&self, model: &str) -> Result<Arc<ModelBinding>> {
        self.bindings
            .get(model)
            .cloned()
            .ok_or_else(|| ShardRelayError::unknown_model(model))
    }

    /// Check that every association points at a registered model
    pub fn validate(&self) -> Result<()> {
        for binding in self.bindings.values() {
            for association in binding.associations.values() {
                if !self.bindings.contains_key(&association.target_model) {
                    return Err(ShardRelayError::config(format!(
                        "Association {}.{} targets unregistered model {}",
                        binding.model, association.name, association.target_model
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_defaults() {
        let binding = ModelBinding::new("users");
        assert_eq!(binding.table, "users");
        assert_eq!(binding.primary_key_column, "id");
        assert!(!binding.is_tracked());
    }

    #[test]
    fn test_unknown_association() {
        let binding = ModelBinding::new("users").has_many("items", "items", "user_id");
        assert!(binding.association("items").is_ok());

        let err = binding.association("orders").unwrap_err();
        assert_eq!(err.to_string(), "Unknown association orders on model users");
    }

    #[test]
    fn test_registry_validates_targets() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelBinding::new("users").has_many("items", "items", "user_id"));
        assert!(registry.validate().is_err());

        registry.register(ModelBinding::new("items").belongs_to("user", "users", "user_id"));
        registry.validate().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(matches!(
            registry.get("orders").unwrap_err(),
            ShardRelayError::UnknownModel { .. }
        ));
    }
}
