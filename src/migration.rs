//! Schema migrations replayed across shards

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shardrelay_core::{
    Datum, FailureMode, Filter, GroupName, MigrationFailure, Result, Row, ShardFailure, ShardName,
    ShardRelayError, Statement,
};

use crate::context;
use crate::pool::{ConnectionPool, ExclusiveSession};

/// Column of the version table holding the migration version
pub const VERSION_COLUMN: &str = "version";

/// Shards a migration runs on
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MigrationTarget {
    /// `master` followed by every configured shard
    #[default]
    AllShards,
    Shards(Vec<ShardName>),
    /// Every member of the listed groups
    Groups(Vec<GroupName>),
    /// The first member of every group
    GroupLeaders,
}

/// A versioned schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub up: Vec<String>,
    pub down: Vec<String>,
    pub transactional: bool,
    pub target: MigrationTarget,
}

impl Migration {
    pub fn new<S: Into<String>>(version: u64, name: S) -> Self {
        Self {
            version,
            name: name.into(),
            up: Vec::new(),
            down: Vec::new(),
            transactional: true,
            target: MigrationTarget::AllShards,
        }
    }

    pub fn up<S: Into<String>>(mut self, statement: S) -> Self {
        self.up.push(statement.into());
        self
    }

    pub fn down<S: Into<String>>(mut self, statement: S) -> Self {
        self.down.push(statement.into());
        self
    }

    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn target(mut self, target: MigrationTarget) -> Self {
        self.target = target;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    Up,
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// What happened on one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    Applied,
    /// Version was already recorded on the shard
    AlreadyApplied,
    /// Rolling back a version the shard never recorded
    NotApplied,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ShardOutcome {
    pub shard: ShardName,
    pub status: ShardStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-shard results of one migration run
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub version: u64,
    pub name: String,
    pub direction: MigrationDirection,
    pub mode: FailureMode,
    pub outcomes: Vec<ShardOutcome>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    fn shards_with(&self, predicate: impl Fn(&ShardStatus) -> bool) -> Vec<ShardName> {
        self.outcomes
            .iter()
            .filter(|outcome| predicate(&outcome.status))
            .map(|outcome| outcome.shard.clone())
            .collect()
    }

    /// Shards that ran the migration in this report
    pub fn applied(&self) -> Vec<ShardName> {
        self.shards_with(|status| *status == ShardStatus::Applied)
    }

    /// Shards that already were in the requested state
    pub fn unchanged(&self) -> Vec<ShardName> {
        self.shards_with(|status| matches!(status, ShardStatus::AlreadyApplied | ShardStatus::NotApplied))
    }

    pub fn failed(&self) -> Vec<ShardName> {
        self.shards_with(|status| matches!(status, ShardStatus::Failed(_)))
    }

    pub fn skipped(&self) -> Vec<ShardName> {
        self.shards_with(|status| *status == ShardStatus::Skipped)
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && !self.cancelled
    }
}

/// Flag stopping a running migration before its next shard
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs a migration on its target shards one after another
pub struct MigrationRunner<'a> {
    pool: &'a ConnectionPool,
    table: String,
    mode: FailureMode,
    cancel: CancellationFlag,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(pool: &'a ConnectionPool, table: String, mode: FailureMode) -> Self {
        Self {
            pool,
            table,
            mode,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Shards the migration runs on, in configuration order
    ///
    /// Unknown shards or groups fail here, before any shard is touched.
    pub async fn targets(&self, target: &MigrationTarget) -> Result<Vec<ShardName>> {
        let configured = self.pool.shard_names().await;

        let selected: Vec<ShardName> = match target {
            MigrationTarget::AllShards => return Ok(configured),
            MigrationTarget::Shards(shards) => {
                for shard in shards {
                    if !configured.contains(shard) {
                        return Err(ShardRelayError::unknown_shard(shard.clone()));
                    }
                }
                shards.clone()
            }
            MigrationTarget::Groups(groups) => {
                let mut members = Vec::new();
                for group in groups {
                    members.extend(self.pool.group_members(group).await?);
                }
                members
            }
            MigrationTarget::GroupLeaders => self
                .pool
                .groups()
                .await
                .iter()
                .filter_map(|group| group.leader().cloned())
                .collect(),
        };

        Ok(configured.into_iter().filter(|shard| selected.contains(shard)).collect())
    }

    pub async fn run(&self, migration: &Migration, direction: MigrationDirection) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let targets = self.targets(&migration.target).await?;

        tracing::info!(
            "Running migration {} ({}) {} on {} shards",
            migration.version,
            migration.name,
            direction,
            targets.len()
        );

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut errors = Vec::new();
        let mut cancelled = false;
        let mut stop = false;

        for shard in targets {
            if stop || self.cancel.is_cancelled() {
                cancelled |= !stop;
                outcomes.push(ShardOutcome {
                    shard,
                    status: ShardStatus::Skipped,
                    finished_at: None,
                });
                continue;
            }

            let status = match self.run_on_shard(migration, direction, &shard).await {
                Ok(status) => {
                    tracing::info!("Migration {} {} on shard {}: {:?}", migration.version, direction, shard, status);
                    status
                }
                Err(error) => {
                    tracing::error!("Migration {} failed on shard {}: {}", migration.version, shard, error);
                    let status = ShardStatus::Failed(error.to_string());
                    errors.push(ShardFailure {
                        shard: shard.clone(),
                        error,
                    });
                    stop = self.mode == FailureMode::FailFast;
                    status
                }
            };

            outcomes.push(ShardOutcome {
                shard,
                status,
                finished_at: Some(Utc::now()),
            });
        }

        let report = MigrationReport {
            version: migration.version,
            name: migration.name.clone(),
            direction,
            mode: self.mode,
            outcomes,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };

        if cancelled {
            tracing::warn!(
                "Migration {} cancelled; skipped shards: {:?}",
                migration.version,
                report.skipped()
            );
        }

        if errors.is_empty() {
            return Ok(report);
        }

        Err(MigrationFailure {
            version: migration.version,
            mode: self.mode,
            failed: errors,
            succeeded: report.applied(),
            skipped: report.skipped(),
        }
        .into())
    }

    async fn run_on_shard(
        &self,
        migration: &Migration,
        direction: MigrationDirection,
        shard: &ShardName,
    ) -> Result<ShardStatus> {
        if context::snapshot().transaction(shard).is_some() {
            return Err(ShardRelayError::routing(format!(
                "Cannot migrate shard {} from inside a transaction on it",
                shard
            )));
        }

        // Other calls to the shard wait until the migration is done with it
        let handle = self.pool.get(shard).await?;
        let session = handle.exclusive().await;

        let recorded = self.is_recorded(&session, migration.version).await?;
        match direction {
            MigrationDirection::Up if recorded => return Ok(ShardStatus::AlreadyApplied),
            MigrationDirection::Down if !recorded => return Ok(ShardStatus::NotApplied),
            _ => {}
        }

        if !migration.transactional {
            self.apply(&session, migration, direction).await?;
            return Ok(ShardStatus::Applied);
        }

        session.execute(&Statement::Begin).await?;
        match self.apply(&session, migration, direction).await {
            Ok(()) => {
                session.execute(&Statement::Commit).await?;
                Ok(ShardStatus::Applied)
            }
            Err(error) => match session.execute(&Statement::Rollback).await {
                Ok(_) => Err(error),
                Err(rollback) => {
                    tracing::error!("Rollback of migration {} failed on shard {}: {}", migration.version, shard, rollback);
                    Err(ShardRelayError::query(
                        shard.clone(),
                        ShardRelayError::driver(format!("{}; rollback failed: {}", error, rollback)),
                    ))
                }
            },
        }
    }

    async fn is_recorded(&self, session: &ExclusiveSession, version: u64) -> Result<bool> {
        let select = Statement::Select {
            table: self.table.clone(),
            filter: Filter::eq(VERSION_COLUMN, version_datum(version)),
        };
        Ok(!session.execute(&select).await?.into_rows().is_empty())
    }

    // Statements and the version row change together
    async fn apply(&self, session: &ExclusiveSession, migration: &Migration, direction: MigrationDirection) -> Result<()> {
        let statements = match direction {
            MigrationDirection::Up => &migration.up,
            MigrationDirection::Down => &migration.down,
        };

        for statement in statements {
            session.execute(&Statement::raw(statement.as_str())).await?;
        }

        let bookkeeping = match direction {
            MigrationDirection::Up => {
                let mut row = Row::new();
                row.insert(VERSION_COLUMN.to_string(), version_datum(migration.version));
                row.insert("name".to_string(), Datum::from(migration.name.as_str()));
                row.insert("applied_at".to_string(), Datum::from(Utc::now().to_rfc3339()));
                Statement::Insert {
                    table: self.table.clone(),
                    key_column: VERSION_COLUMN.to_string(),
                    row,
                }
            }
            MigrationDirection::Down => Statement::Delete {
                table: self.table.clone(),
                key_column: VERSION_COLUMN.to_string(),
                key: version_datum(migration.version),
            },
        };
        session.execute(&bookkeeping).await?;
        Ok(())
    }
}

fn version_datum(version: u64) -> Datum {
    Datum::Int(i64::try_from(version).unwrap_or(i64::MAX))
}
