//! The routing proxy
//!
//! Every data-access call goes through [`RoutingProxy`], which decides the
//! target shard, takes the connection from the pool and executes the
//! statement there. Resolution order, first match wins:
//!
//! 1. shard given for the call (`ShardScope`, association owner) or already
//!    assigned to the record being written
//! 2. innermost `using` / `using_group` block
//! 3. request-level current shard, then current group
//! 4. the model's tracker: placement directory, dynamic function, attribute
//! 5. for a lookup by primary key nothing above could place, the one shard
//!    holding the key
//! 6. round-robin over non-master shards, for tracked models
//! 7. `master`
//!
//! When sharding is disabled for the active environment everything goes to
//! `master`.

use std::future::Future;
use std::sync::Arc;

use shardrelay_config::{ConfigLoader, ConfigValidator, ShardGroup, ShardRelayConfig, ShardTopology};
use shardrelay_core::{
    Datum, Filter, GroupName, QueryResult, Record, Result, Routable, Row, ShardName, ShardRelayError,
    Statement,
};
use shardrelay_driver::{Connector, ConnectorRegistry, MemoryConnector};
use tokio::sync::RwLock;
use tracing::Instrument;

use crate::association::AssociationRouter;
use crate::call::{Route, RouteSource, RoutedCall};
use crate::context::{self, ContextLevel, ContextTarget, ScopeOverride};
use crate::migration::{CancellationFlag, Migration, MigrationDirection, MigrationReport, MigrationRunner};
use crate::model::{ModelBinding, ModelRegistry};
use crate::placement::{Placement, PlacementDirectory};
use crate::pool::ConnectionPool;
use crate::selector::{CursorKey, SelectOptions, ShardSelector};
use crate::tracker::ShardTracker;

/// Callbacks run around record persistence
///
/// Both receive the shard the call was routed to.
pub trait LifecycleHook: Send + Sync {
    fn before_save(&self, _record: &mut dyn Routable, _shard: &ShardName) -> Result<()> {
        Ok(())
    }

    fn after_load(&self, _record: &mut Record, _shard: &ShardName) -> Result<()> {
        Ok(())
    }
}

/// What a call knows that a tracker can use
#[derive(Clone, Copy)]
enum Hint<'a> {
    None,
    Key(&'a Datum),
    Filter(&'a Filter),
    Record(&'a dyn Routable),
}

/// Builder for [`RoutingProxy`]
pub struct ProxyBuilder {
    config: ShardRelayConfig,
    connector: Option<Arc<dyn Connector>>,
    models: ModelRegistry,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl ProxyBuilder {
    /// Connector used to open shard connections
    ///
    /// Defaults to a registry serving the `memory` adapter.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn model(mut self, binding: ModelBinding) -> Self {
        self.models.register(binding);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<RoutingProxy> {
        ConfigValidator::validate(&self.config)?;
        self.models.validate()?;
        let topology = ShardTopology::from_config(&self.config)?;

        let placement = PlacementDirectory::with_capacity(self.config.routing.placement_capacity);
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(ConnectorRegistry::new().register("memory", Arc::new(MemoryConnector::new())))
        });

        tracing::info!(
            "Routing proxy ready for environment {} ({} shards, {} groups, sharding {})",
            self.config.environment,
            topology.entries().len(),
            topology.groups().len(),
            if topology.enabled() { "enabled" } else { "disabled" }
        );

        Ok(RoutingProxy {
            config: RwLock::new(Arc::new(self.config)),
            pool: ConnectionPool::new(connector, topology),
            selector: ShardSelector::new(),
            models: self.models,
            placement,
            hooks: self.hooks,
        })
    }
}

/// Routes data-access calls to shards
pub struct RoutingProxy {
    config: RwLock<Arc<ShardRelayConfig>>,
    pool: ConnectionPool,
    selector: ShardSelector,
    models: ModelRegistry,
    placement: PlacementDirectory,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl RoutingProxy {
    pub fn builder(config: ShardRelayConfig) -> ProxyBuilder {
        ProxyBuilder {
            config,
            connector: None,
            models: ModelRegistry::new(),
            hooks: Vec::new(),
        }
    }

    pub async fn config(&self) -> Arc<ShardRelayConfig> {
        self.config.read().await.clone()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn placement(&self) -> &PlacementDirectory {
        &self.placement
    }

    /// Run calls on one shard, bypassing every other routing rule
    pub fn on_shard<S: Into<ShardName>>(&self, shard: S) -> ShardScope<'_> {
        ShardScope {
            proxy: self,
            shard: shard.into(),
        }
    }

    // Reads

    pub async fn find<K: Into<Datum>>(&self, model: &str, key: K) -> Result<Option<Record>> {
        self.find_on(None, model, key.into()).await
    }

    pub async fn where_eq<V: Into<Datum>>(&self, model: &str, column: &str, value: V) -> Result<Vec<Record>> {
        let binding = self.models.get(model)?;
        self.select(None, &binding, Filter::eq(column, value.into()), "where").await
    }

    pub async fn all(&self, model: &str) -> Result<Vec<Record>> {
        let binding = self.models.get(model)?;
        self.select(None, &binding, Filter::All, "all").await
    }

    async fn find_on(&self, explicit: Option<&ShardName>, model: &str, key: Datum) -> Result<Option<Record>> {
        let binding = self.models.get(model)?;
        let filter = Filter::eq(binding.primary_key_column.clone(), key);
        let records = self.select(explicit, &binding, filter, "find").await?;
        Ok(records.into_iter().next())
    }

    async fn select(
        &self,
        explicit: Option<&ShardName>,
        binding: &ModelBinding,
        filter: Filter,
        operation: &'static str,
    ) -> Result<Vec<Record>> {
        let mut call = RoutedCall::new(operation);
        let span = call.span();
        let result = self.run_select(&mut call, explicit, binding, filter).instrument(span).await;
        call.settle(&result);
        result
    }

    async fn run_select(
        &self,
        call: &mut RoutedCall,
        explicit: Option<&ShardName>,
        binding: &ModelBinding,
        filter: Filter,
    ) -> Result<Vec<Record>> {
        call.begin_resolution()?;
        let route = self.resolve(explicit, Some(binding), Hint::Filter(&filter)).await?;
        call.routed(route)?;

        let statement = Statement::Select {
            table: binding.table.clone(),
            filter,
        };
        let rows = self.dispatch(call, &statement).await?.into_rows();
        let shard = call.route()?.shard.clone();

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.load(binding, row, &shard).await?);
        }
        Ok(records)
    }

    async fn load(&self, binding: &ModelBinding, row: Row, shard: &ShardName) -> Result<Record> {
        let mut record = Record::loaded(binding.model.clone(), &binding.primary_key_column, row, shard.clone());
        for hook in &self.hooks {
            hook.after_load(&mut record, shard)?;
        }
        Ok(record)
    }

    // Writes

    /// Insert or update a record
    ///
    /// A record with an assigned shard stays there. Otherwise the shard is
    /// resolved once, stamped on the record and remembered.
    pub async fn save(&self, record: &mut dyn Routable) -> Result<ShardName> {
        self.save_on(None, record).await
    }

    async fn save_on(&self, explicit: Option<&ShardName>, record: &mut dyn Routable) -> Result<ShardName> {
        let binding = self.models.get(record.model_name())?;
        let mut call = RoutedCall::new("save");
        let span = call.span();
        let result = self.run_save(&mut call, explicit, &binding, record).instrument(span).await;
        call.settle(&result);
        result
    }

    async fn run_save(
        &self,
        call: &mut RoutedCall,
        explicit: Option<&ShardName>,
        binding: &ModelBinding,
        record: &mut dyn Routable,
    ) -> Result<ShardName> {
        call.begin_resolution()?;
        let enabled = self.pool.enabled().await;
        let assigned = record.current_shard().cloned();

        let mut route = self
            .resolve(assigned.as_ref().or(explicit), Some(binding), Hint::Record(&*record))
            .await?;
        if assigned.is_some() && route.source == RouteSource::Explicit {
            route.source = RouteSource::Record;
        }
        let shard = route.shard.clone();

        if let (true, Some(tracker)) = (enabled, &binding.tracker) {
            if record.is_persisted() {
                if let Some(derived) = tracker.shard_for(&*record)? {
                    if derived != shard {
                        return Err(ShardRelayError::routing(format!(
                            "{} record {} lives on shard {} but its {} tracker now points at {}",
                            binding.model,
                            describe(&*record),
                            shard,
                            tracker.kind(),
                            derived
                        )));
                    }
                }
            } else {
                tracker.stamp(record, &shard)?;
            }
        }
        call.routed(route)?;

        for hook in &self.hooks {
            hook.before_save(record, &shard)?;
        }

        let persisted = record.is_persisted();
        let had_key = record.primary_key().is_some();
        let statement = if persisted {
            let key = record.primary_key().cloned().ok_or_else(|| {
                ShardRelayError::routing(format!("Persisted {} record has no primary key", binding.model))
            })?;
            Statement::Update {
                table: binding.table.clone(),
                key_column: binding.primary_key_column.clone(),
                key,
                row: record.to_row(),
            }
        } else {
            Statement::Insert {
                table: binding.table.clone(),
                key_column: binding.primary_key_column.clone(),
                row: record.to_row(),
            }
        };

        let result = self.dispatch(call, &statement).await?;
        match result {
            QueryResult::Inserted { key } => record.set_attribute(&binding.primary_key_column, key),
            QueryResult::Affected(0) if persisted => {
                return Err(ShardRelayError::query(
                    shard,
                    ShardRelayError::driver(format!("{} record {} not found", binding.model, describe(&*record))),
                ));
            }
            _ => {}
        }

        if enabled && !persisted && !had_key {
            self.confirm_assigned_key(call, binding, record, &shard).await?;
        }

        record.mark_persisted(true);
        record.set_current_shard(shard.clone());
        if binding.is_tracked() {
            if let Some(key) = record.primary_key() {
                self.placement.record(&binding.model, key, &shard).await;
            }
        }

        Ok(shard)
    }

    /// Check that a key the shard just assigned leads the model's dynamic
    /// tracker back to that shard, undoing the insert when it does not
    async fn confirm_assigned_key(
        &self,
        call: &mut RoutedCall,
        binding: &ModelBinding,
        record: &mut dyn Routable,
        shard: &ShardName,
    ) -> Result<()> {
        let Some(tracker @ ShardTracker::Dynamic(_)) = &binding.tracker else {
            return Ok(());
        };

        let mismatch = match tracker.shard_for(&*record) {
            Ok(Some(derived)) if derived != *shard => ShardRelayError::tracker(
                &binding.model,
                describe(&*record),
                tracker.kind(),
                format!(
                    "key assigned on shard {} maps to shard {}; set the key before saving",
                    shard, derived
                ),
            ),
            Ok(_) => return Ok(()),
            Err(error) => error,
        };

        if let Some(key) = record.primary_key().cloned() {
            let undo = Statement::Delete {
                table: binding.table.clone(),
                key_column: binding.primary_key_column.clone(),
                key,
            };
            if let Err(e) = self.dispatch(call, &undo).await {
                tracing::error!("Failed to remove misplaced {} record from shard {}: {}", binding.model, shard, e);
            }
        }
        record.set_attribute(&binding.primary_key_column, Datum::Null);
        Err(mismatch)
    }

    /// Delete a record from its shard
    pub async fn delete(&self, record: &mut dyn Routable) -> Result<u64> {
        self.delete_on(None, record).await
    }

    async fn delete_on(&self, explicit: Option<&ShardName>, record: &mut dyn Routable) -> Result<u64> {
        let binding = self.models.get(record.model_name())?;
        let mut call = RoutedCall::new("delete");
        let span = call.span();
        let result = self.run_delete(&mut call, explicit, &binding, record).instrument(span).await;
        call.settle(&result);
        result
    }

    async fn run_delete(
        &self,
        call: &mut RoutedCall,
        explicit: Option<&ShardName>,
        binding: &ModelBinding,
        record: &mut dyn Routable,
    ) -> Result<u64> {
        call.begin_resolution()?;
        let key = record.primary_key().cloned().ok_or_else(|| {
            ShardRelayError::routing(format!("Cannot delete a {} record without a primary key", binding.model))
        })?;

        let assigned = record.current_shard().cloned();
        let mut route = self
            .resolve(assigned.as_ref().or(explicit), Some(binding), Hint::Key(&key))
            .await?;
        if assigned.is_some() && route.source == RouteSource::Explicit {
            route.source = RouteSource::Record;
        }
        call.routed(route)?;

        let statement = Statement::Delete {
            table: binding.table.clone(),
            key_column: binding.primary_key_column.clone(),
            key: key.clone(),
        };
        let affected = self.dispatch(call, &statement).await?.affected();

        let shard = call.route()?.shard.clone();
        self.placement.evict(&binding.model, &key, &shard).await;
        record.mark_persisted(false);
        Ok(affected)
    }

    // Raw statements and transactions

    /// Run a statement on the shard selected by the context, or `master`
    pub async fn execute(&self, statement: Statement) -> Result<QueryResult> {
        self.execute_on(None, statement).await
    }

    async fn execute_on(&self, explicit: Option<&ShardName>, statement: Statement) -> Result<QueryResult> {
        let mut call = RoutedCall::new("execute");
        let span = call.span();
        let result = async {
            call.begin_resolution()?;
            let route = self.resolve(explicit, None, Hint::None).await?;
            call.routed(route)?;
            self.dispatch(&mut call, &statement).await
        }
        .instrument(span)
        .await;
        call.settle(&result);
        result
    }

    /// Run `body` inside a transaction on one shard
    ///
    /// The shard comes from the context (or `master`). Calls made by `body`
    /// are routed to that shard. The transaction commits when `body`
    /// succeeds and rolls back otherwise.
    ///
    /// The shard is held exclusively until then: calls from other requests
    /// to it wait, and so does a second transaction on it.
    pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(ShardName) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.transaction_on(None, body).await
    }

    async fn transaction_on<T, F, Fut>(&self, explicit: Option<&ShardName>, body: F) -> Result<T>
    where
        F: FnOnce(ShardName) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut call = RoutedCall::new("transaction");
        let span = call.span();

        let result = async {
            call.begin_resolution()?;
            let route = self.resolve(explicit, None, Hint::None).await?;
            call.routed(route)?;
            let shard = call.begin_execution()?;

            if context::snapshot().transaction(&shard).is_some() {
                return Err(ShardRelayError::routing(format!(
                    "A transaction on shard {} is already open in this request",
                    shard
                )));
            }

            let session = Arc::new(self.pool.get(&shard).await?.exclusive().await);
            session.execute(&Statement::Begin).await?;

            let outcome = context::with_transaction(session.clone(), body(shard.clone())).await;

            match outcome {
                Ok(value) => {
                    session.execute(&Statement::Commit).await?;
                    Ok(value)
                }
                Err(error) => {
                    if let Err(rollback) = session.execute(&Statement::Rollback).await {
                        tracing::error!("Rollback on shard {} failed: {}", shard, rollback);
                    }
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await;

        call.settle(&result);
        result
    }

    // Associations

    /// Load an association of a record
    ///
    /// The query runs on the owner's shard unless the association is
    /// cross-shard.
    pub async fn load_association(&self, owner: &dyn Routable, name: &str) -> Result<Vec<Record>> {
        let plan = AssociationRouter::new(&self.models).plan_load(owner, name)?;
        self.select(plan.pinned.as_ref(), &plan.target, plan.filter, "load_association")
            .await
    }

    /// Save `child` through an association of `owner`
    ///
    /// Has-many children get the owner's key and land on the owner's shard.
    /// For belongs-to the saved target's key is set on the owner, which the
    /// caller saves afterwards.
    pub async fn save_associated(
        &self,
        owner: &mut dyn Routable,
        name: &str,
        child: &mut dyn Routable,
    ) -> Result<ShardName> {
        let plan = AssociationRouter::new(&self.models).plan_save(&*owner, name)?;
        if child.model_name() != plan.target.model {
            return Err(ShardRelayError::routing(format!(
                "{}.{} expects a {} record, got {}",
                owner.model_name(),
                name,
                plan.target.model,
                child.model_name()
            )));
        }

        if let Some((column, key)) = &plan.child_key {
            child.set_attribute(column, key.clone());
        }

        let shard = self.save_on(plan.pinned.as_ref(), child).await?;

        if let Some(column) = &plan.owner_key {
            if let Some(key) = child.primary_key().cloned() {
                owner.set_attribute(column, key);
            }
        }
        Ok(shard)
    }

    // Migrations

    pub async fn migrate(&self, migration: &Migration) -> Result<MigrationReport> {
        self.run_migration(migration, MigrationDirection::Up, CancellationFlag::new())
            .await
    }

    /// Like [`migrate`](Self::migrate), stopping before the next shard once
    /// `cancel` is set
    pub async fn migrate_with_cancellation(
        &self,
        migration: &Migration,
        cancel: CancellationFlag,
    ) -> Result<MigrationReport> {
        self.run_migration(migration, MigrationDirection::Up, cancel).await
    }

    pub async fn rollback_migration(&self, migration: &Migration) -> Result<MigrationReport> {
        self.run_migration(migration, MigrationDirection::Down, CancellationFlag::new())
            .await
    }

    async fn run_migration(
        &self,
        migration: &Migration,
        direction: MigrationDirection,
        cancel: CancellationFlag,
    ) -> Result<MigrationReport> {
        let config = self.config().await;
        MigrationRunner::new(&self.pool, config.migration.table.clone(), config.migration.failure_mode)
            .with_cancellation(cancel)
            .run(migration, direction)
            .await
    }

    // Scoped context

    /// Run `body` with every call routed to `shard`
    ///
    /// Fails with `UnknownShard` before running `body` when the shard is not
    /// configured. With sharding disabled `body` runs unmodified.
    pub async fn using<S, F>(&self, shard: S, body: F) -> Result<F::Output>
    where
        S: Into<ShardName>,
        F: Future,
    {
        if !self.pool.enabled().await {
            return Ok(body.await);
        }

        let shard = shard.into();
        self.ensure_shard(&shard).await?;
        Ok(context::with_override(ScopeOverride::Shard(shard), body).await)
    }

    /// Run `body` with calls spread over the members of `group`
    pub async fn using_group<G, F>(&self, group: G, body: F) -> Result<F::Output>
    where
        G: Into<GroupName>,
        F: Future,
    {
        if !self.pool.enabled().await {
            return Ok(body.await);
        }

        let group = group.into();
        self.pool.group_members(&group).await?;
        Ok(context::with_override(ScopeOverride::Group(group), body).await)
    }

    /// Run `body` on the next shard chosen by round-robin
    pub async fn using_any_shard<F: Future>(&self, options: SelectOptions, body: F) -> Result<F::Output> {
        let shard = self.choose_next_shard(options).await;
        self.using(shard, body).await
    }

    /// Run `body` in a fresh request context
    pub async fn request<F: Future>(&self, body: F) -> F::Output {
        context::fresh(body).await
    }

    pub async fn set_current_shard(&self, shard: Option<ShardName>) -> Result<()> {
        if let Some(shard) = &shard {
            if self.pool.enabled().await {
                self.ensure_shard(shard).await?;
            }
        }
        context::set_current_shard(shard)
    }

    pub async fn set_current_group(&self, group: Option<GroupName>) -> Result<()> {
        if let Some(group) = &group {
            if self.pool.enabled().await {
                self.pool.group_members(group).await?;
            }
        }
        context::set_current_group(group)
    }

    /// Shard the context points at, without consulting any model
    ///
    /// A group resolves to its first member so no cursor moves.
    pub async fn current_shard(&self) -> ShardName {
        if !self.pool.enabled().await {
            return ShardName::master();
        }

        match context::snapshot().target() {
            Some((ContextTarget::Shard(shard), _)) => shard,
            Some((ContextTarget::Group(group), _)) => match self.pool.group_members(&group).await {
                Ok(members) => members.into_iter().next().unwrap_or_else(ShardName::master),
                Err(e) => {
                    tracing::warn!("Current group cannot be resolved, reporting master: {}", e);
                    ShardName::master()
                }
            },
            None => ShardName::master(),
        }
    }

    // Topology

    /// Next shard by round-robin over every configured shard
    pub async fn choose_next_shard(&self, options: SelectOptions) -> ShardName {
        let candidates = self.pool.shard_names().await;
        self.selector.resolve(&candidates, &CursorKey::Global, options)
    }

    pub async fn shards(&self) -> Vec<ShardName> {
        self.pool.shard_names().await
    }

    pub async fn groups(&self) -> Vec<ShardGroup> {
        self.pool.groups().await
    }

    /// Environments sharding is enabled for
    pub async fn environments(&self) -> Vec<String> {
        self.config().await.environments.clone()
    }

    pub async fn enabled(&self) -> bool {
        self.pool.enabled().await
    }

    /// Replace the configuration and swap in a new pool generation
    pub async fn reload(&self, config: ShardRelayConfig) -> Result<u64> {
        ConfigValidator::validate(&config)?;
        let topology = ShardTopology::from_config(&config)?;

        let capacity = config.routing.placement_capacity;
        let mut current = self.config.write().await;
        let generation = self.pool.reinitialize(topology).await;
        *current = Arc::new(config);
        drop(current);

        self.selector.reset();
        self.placement.reset(capacity).await;
        tracing::info!("Shard configuration reloaded (generation {})", generation);
        Ok(generation)
    }

    pub async fn reload_from(&self, loader: &ConfigLoader) -> Result<u64> {
        let config = loader.load().await?;
        self.reload(config).await
    }

    /// Close every connection and forget routing state
    pub async fn teardown(&self) {
        self.pool.close_all().await;
        self.selector.reset();
        self.placement.clear().await;
        tracing::info!("Routing proxy torn down");
    }

    // Resolution

    async fn resolve(&self, explicit: Option<&ShardName>, binding: Option<&ModelBinding>, hint: Hint<'_>) -> Result<Route> {
        if !self.pool.enabled().await {
            return Ok(Route::master());
        }

        if let Some(shard) = explicit {
            self.ensure_shard(shard).await?;
            return Ok(Route::new(shard.clone(), RouteSource::Explicit));
        }

        let target = context::snapshot().target();
        if let Some((target, level)) = target {
            let source = match level {
                ContextLevel::Block => RouteSource::Block,
                ContextLevel::Request => RouteSource::Request,
            };
            let shard = match target {
                ContextTarget::Shard(shard) => {
                    self.ensure_shard(&shard).await?;
                    shard
                }
                ContextTarget::Group(group) => self.next_in_group(&group).await?,
            };
            return Ok(Route::new(shard, source));
        }

        let Some(binding) = binding.filter(|binding| binding.is_tracked()) else {
            return Ok(Route::master());
        };

        if let Some(route) = self.tracked_route(binding, hint).await? {
            return Ok(route);
        }

        let options = SelectOptions::from(&self.config().await.routing);
        let shard = self.choose_next_shard(options).await;
        let source = if shard.is_master() {
            RouteSource::Master
        } else {
            RouteSource::RoundRobin
        };
        Ok(Route::new(shard, source))
    }

    async fn tracked_route(&self, binding: &ModelBinding, hint: Hint<'_>) -> Result<Option<Route>> {
        let Some(tracker) = &binding.tracker else {
            return Ok(None);
        };

        let key = match hint {
            Hint::None => None,
            Hint::Key(key) => Some(key),
            Hint::Filter(Filter::Eq { column, value }) if *column == binding.primary_key_column => Some(value),
            Hint::Filter(Filter::Eq { column, value }) => {
                return match tracker {
                    ShardTracker::Attribute(attribute) if attribute.column() == column.as_str() => {
                        let shard = attribute.shard_for_value(value).map_err(|e| {
                            ShardRelayError::tracker(&binding.model, value.to_string(), tracker.kind(), e)
                        })?;
                        self.tracked(shard, RouteSource::Tracker).await
                    }
                    _ => Ok(None),
                };
            }
            Hint::Filter(Filter::All) => None,
            Hint::Record(record) => {
                let shard = tracker.shard_for(record)?;
                return self.tracked(shard, RouteSource::Tracker).await;
            }
        };

        let Some(key) = key else {
            return Ok(None);
        };

        match self.placement.lookup(&binding.model, key).await {
            Some(Placement::Unique(shard)) => {
                if self.pool.contains(&shard).await {
                    return Ok(Some(Route::new(shard, RouteSource::Placement)));
                }
            }
            Some(Placement::Ambiguous(shards)) => {
                let shards: Vec<ShardName> = shards.into_iter().collect();
                return Err(ambiguous_key(binding, key, &shards));
            }
            None => {}
        }

        let probe = Record::new(binding.model.clone())
            .with_primary_key_column(binding.primary_key_column.clone())
            .with(&binding.primary_key_column, key.clone());
        if let Some(route) = self.tracked(tracker.shard_for(&probe)?, RouteSource::Tracker).await? {
            return Ok(Some(route));
        }

        self.locate(binding, key).await
    }

    /// Look for a key on every shard a tracked record can land on
    ///
    /// A key found on one shard is remembered there. A key found on several
    /// cannot pick a record and fails the call.
    async fn locate(&self, binding: &ModelBinding, key: &Datum) -> Result<Option<Route>> {
        let include_master = self.config().await.routing.include_master;
        let statement = Statement::Select {
            table: binding.table.clone(),
            filter: Filter::eq(binding.primary_key_column.clone(), key.clone()),
        };

        let mut holders = Vec::new();
        for shard in self.pool.shard_names().await {
            if shard.is_master() && !include_master {
                continue;
            }
            if !self.run_on(&shard, &statement).await?.into_rows().is_empty() {
                holders.push(shard);
            }
        }
        tracing::debug!("{} record {} found on {} shard(s)", binding.model, key, holders.len());

        for shard in &holders {
            self.placement.record(&binding.model, key, shard).await;
        }
        match holders.len() {
            0 => Ok(None),
            1 => Ok(holders.pop().map(|shard| Route::new(shard, RouteSource::Scan))),
            _ => Err(ambiguous_key(binding, key, &holders)),
        }
    }

    async fn tracked(&self, shard: Option<ShardName>, source: RouteSource) -> Result<Option<Route>> {
        match shard {
            Some(shard) => {
                self.ensure_shard(&shard).await?;
                Ok(Some(Route::new(shard, source)))
            }
            None => Ok(None),
        }
    }

    async fn next_in_group(&self, group: &GroupName) -> Result<ShardName> {
        let members = self.pool.group_members(group).await?;
        let options = SelectOptions {
            include_master: false,
            start_with_random_shard: self.config().await.routing.start_with_random_shard,
        };
        Ok(self
            .selector
            .resolve(&members, &CursorKey::Group(group.clone()), options))
    }

    async fn ensure_shard(&self, shard: &ShardName) -> Result<()> {
        if self.pool.contains(shard).await {
            Ok(())
        } else {
            Err(ShardRelayError::unknown_shard(shard.clone()))
        }
    }

    async fn dispatch(&self, call: &mut RoutedCall, statement: &Statement) -> Result<QueryResult> {
        let shard = call.begin_execution()?;
        self.run_on(&shard, statement).await
    }

    // Inside a transaction on the shard, statements use its session
    async fn run_on(&self, shard: &ShardName, statement: &Statement) -> Result<QueryResult> {
        let session = context::snapshot().transaction(shard);
        if let Some(session) = session {
            return session.execute(statement).await;
        }
        self.pool.get(shard).await?.execute(statement).await
    }
}

fn describe(record: &dyn Routable) -> String {
    match record.primary_key() {
        Some(key) => key.to_string(),
        None => "(new)".to_string(),
    }
}

fn ambiguous_key(binding: &ModelBinding, key: &Datum, shards: &[ShardName]) -> ShardRelayError {
    let names: Vec<&str> = shards.iter().map(ShardName::as_str).collect();
    ShardRelayError::routing(format!(
        "{} record {} exists on shards {}; pick one with on_shard",
        binding.model,
        key,
        names.join(", ")
    ))
}

/// Calls pinned to one shard
///
/// The shard takes precedence over blocks, request settings and trackers.
/// Records saved through the scope keep their own shard when they already
/// have one.
pub struct ShardScope<'a> {
    proxy: &'a RoutingProxy,
    shard: ShardName,
}

impl<'a> ShardScope<'a> {
    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    pub async fn find<K: Into<Datum>>(&self, model: &str, key: K) -> Result<Option<Record>> {
        self.proxy.find_on(Some(&self.shard), model, key.into()).await
    }

    pub async fn where_eq<V: Into<Datum>>(&self, model: &str, column: &str, value: V) -> Result<Vec<Record>> {
        let binding = self.proxy.models.get(model)?;
        self.proxy
            .select(Some(&self.shard), &binding, Filter::eq(column, value.into()), "where")
            .await
    }

    pub async fn all(&self, model: &str) -> Result<Vec<Record>> {
        let binding = self.proxy.models.get(model)?;
        self.proxy.select(Some(&self.shard), &binding, Filter::All, "all").await
    }

    pub async fn save(&self, record: &mut dyn Routable) -> Result<ShardName> {
        self.proxy.save_on(Some(&self.shard), record).await
    }

    pub async fn delete(&self, record: &mut dyn Routable) -> Result<u64> {
        self.proxy.delete_on(Some(&self.shard), record).await
    }

    pub async fn execute(&self, statement: Statement) -> Result<QueryResult> {
        self.proxy.execute_on(Some(&self.shard), statement).await
    }

    pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(ShardName) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.proxy.transaction_on(Some(&self.shard), body).await
    }
}
