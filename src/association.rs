//! Shard affinity for associated records

use std::sync::Arc;

use shardrelay_core::{Datum, Filter, Result, Routable, ShardName, ShardRelayError};

use crate::model::{AssociationDef, AssociationKind, ModelBinding, ModelRegistry};

/// How to load an association
#[derive(Debug, Clone)]
pub struct AssociationLoad {
    pub target: Arc<ModelBinding>,
    pub filter: Filter,
    /// Shard the query is forced onto; `None` lets the target's tracker decide
    pub pinned: Option<ShardName>,
}

/// How to save a record through an association
#[derive(Debug, Clone)]
pub struct AssociationSave {
    pub target: Arc<ModelBinding>,
    pub pinned: Option<ShardName>,
    /// Foreign key to set on the child before saving
    pub child_key: Option<(String, Datum)>,
    /// Owner column receiving the saved target's key
    pub owner_key: Option<String>,
}

/// Keeps association queries on the owner's shard unless the association is
/// declared cross-shard
pub struct AssociationRouter<'a> {
    models: &'a ModelRegistry,
}

impl<'a> AssociationRouter<'a> {
    pub fn new(models: &'a ModelRegistry) -> Self {
        Self { models }
    }

    pub fn plan_load(&self, owner: &dyn Routable, name: &str) -> Result<AssociationLoad> {
        let (binding, association) = self.lookup(owner, name)?;
        let target = self.models.get(&association.target_model)?;

        let filter = match &association.kind {
            AssociationKind::HasMany { foreign_key } => {
                let key = owner.primary_key().cloned().ok_or_else(|| {
                    ShardRelayError::routing(format!(
                        "Cannot load {}.{} for a {} record without a primary key",
                        binding.model, name, binding.model
                    ))
                })?;
                Filter::eq(foreign_key.clone(), key)
            }
            AssociationKind::BelongsTo { foreign_key } => {
                let key = owner.attribute(foreign_key).cloned().unwrap_or(Datum::Null);
                Filter::eq(target.primary_key_column.clone(), key)
            }
        };

        let pinned = self.owner_shard(owner, &binding, &association)?;
        tracing::debug!(
            "Association {}.{} routed to {}",
            binding.model,
            name,
            pinned.as_ref().map(ShardName::as_str).unwrap_or("target tracker")
        );

        Ok(AssociationLoad { target, filter, pinned })
    }

    pub fn plan_save(&self, owner: &dyn Routable, name: &str) -> Result<AssociationSave> {
        let (binding, association) = self.lookup(owner, name)?;
        let target = self.models.get(&association.target_model)?;

        let (child_key, owner_key) = match &association.kind {
            AssociationKind::HasMany { foreign_key } => {
                let key = owner.primary_key().cloned().ok_or_else(|| {
                    ShardRelayError::routing(format!(
                        "Save the {} record before adding to {}",
                        binding.model, name
                    ))
                })?;
                (Some((foreign_key.clone(), key)), None)
            }
            AssociationKind::BelongsTo { foreign_key } => (None, Some(foreign_key.clone())),
        };

        let pinned = self.owner_shard(owner, &binding, &association)?;
        Ok(AssociationSave {
            target,
            pinned,
            child_key,
            owner_key,
        })
    }

    fn lookup(&self, owner: &dyn Routable, name: &str) -> Result<(Arc<ModelBinding>, AssociationDef)> {
        let binding = self.models.get(owner.model_name())?;
        let association = binding.association(name)?.clone();
        Ok((binding, association))
    }

    fn owner_shard(
        &self,
        owner: &dyn Routable,
        binding: &ModelBinding,
        association: &AssociationDef,
    ) -> Result<Option<ShardName>> {
        if association.cross_shard {
            return Ok(None);
        }
        owner.current_shard().cloned().map(Some).ok_or_else(|| {
            ShardRelayError::routing(format!(
                "{} record has no shard; load or save it before using {}",
                binding.model, association.name
            ))
        })
    }
}
