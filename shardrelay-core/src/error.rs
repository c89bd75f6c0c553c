//! Core error types for ShardRelay

use std::fmt;

use thiserror::Error;

use crate::{FailureMode, GroupName, ShardName, TrackerKind};

/// Boxed error returned by user-supplied callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Core error type for ShardRelay operations
#[derive(Debug, Error)]
pub enum ShardRelayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown shard: {shard}")]
    UnknownShard { shard: ShardName },

    #[error("Unknown shard group: {group}")]
    UnknownGroup { group: GroupName },

    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    #[error("Unknown association {association} on model {model}")]
    UnknownAssociation { model: String, association: String },

    #[error("Connection to shard {shard} unavailable: {source}")]
    ConnectionUnavailable { shard: ShardName, source: BoxError },

    #[error("Query on shard {shard} failed: {source}")]
    Query {
        shard: ShardName,
        source: Box<ShardRelayError>,
    },

    #[error("Driver error: {message}")]
    Driver { message: String },

    #[error("{variant} tracker failed for {model} record {record}: {source}")]
    Tracker {
        model: String,
        record: String,
        variant: TrackerKind,
        source: BoxError,
    },

    #[error("{0}")]
    Migration(Box<MigrationFailure>),

    #[error("Routing error: {message}")]
    Routing { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ShardRelayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn unknown_shard<S: Into<ShardName>>(shard: S) -> Self {
        Self::UnknownShard { shard: shard.into() }
    }

    pub fn unknown_group<G: Into<GroupName>>(group: G) -> Self {
        Self::UnknownGroup { group: group.into() }
    }

    pub fn unknown_model<S: Into<String>>(model: S) -> Self {
        Self::UnknownModel { model: model.into() }
    }

    pub fn connection_unavailable<E>(shard: ShardName, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::ConnectionUnavailable { shard, source: error.into() }
    }

    /// Attach the shard a driver error occurred on
    pub fn query(shard: ShardName, error: ShardRelayError) -> Self {
        match error {
            // Errors that already name a shard are not wrapped twice
            already @ (Self::Query { .. } | Self::ConnectionUnavailable { .. }) => already,
            other => Self::Query { shard, source: Box::new(other) },
        }
    }

    pub fn driver<S: Into<String>>(message: S) -> Self {
        Self::Driver { message: message.into() }
    }

    pub fn tracker<E>(model: &str, record: String, variant: TrackerKind, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Tracker {
            model: model.to_string(),
            record,
            variant,
            source: error.into(),
        }
    }

    pub fn routing<S: Into<String>>(message: S) -> Self {
        Self::Routing { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Shard named by the error, if any
    pub fn shard(&self) -> Option<&ShardName> {
        match self {
            Self::UnknownShard { shard }
            | Self::ConnectionUnavailable { shard, .. }
            | Self::Query { shard, .. } => Some(shard),
            _ => None,
        }
    }
}

/// Result type alias for ShardRelay operations
pub type Result<T> = std::result::Result<T, ShardRelayError>;

/// A single shard's failure inside a migration fan-out
#[derive(Debug)]
pub struct ShardFailure {
    pub shard: ShardName,
    pub error: ShardRelayError,
}

/// Aggregate failure of a migration fan-out
#[derive(Debug)]
pub struct MigrationFailure {
    /// Migration version
    pub version: u64,
    /// Failure mode the fan-out ran in
    pub mode: FailureMode,
    /// Shards whose run failed, with the underlying error
    pub failed: Vec<ShardFailure>,
    /// Shards where the migration is applied
    pub succeeded: Vec<ShardName>,
    /// Shards that were never attempted
    pub skipped: Vec<ShardName>,
}

impl MigrationFailure {
    pub fn failed_shards(&self) -> Vec<&ShardName> {
        self.failed.iter().map(|failure| &failure.shard).collect()
    }
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.failed.iter().map(|failure| failure.shard.as_str()).collect();
        write!(
            f,
            "Migration {} failed on shards [{}] ({})",
            self.version,
            names.join(", "),
            self.mode
        )?;
        for failure in &self.failed {
            write!(f, "; {}: {}", failure.shard, failure.error)?;
        }
        Ok(())
    }
}

impl From<MigrationFailure> for ShardRelayError {
    fn from(failure: MigrationFailure) -> Self {
        ShardRelayError::Migration(Box::new(failure))
    }
}
