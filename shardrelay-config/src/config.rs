//! Configuration structures for ShardRelay

use serde::{Deserialize, Serialize};
use shardrelay_core::FailureMode;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Main configuration structure for ShardRelay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRelayConfig {
    /// Environment the process runs in
    pub environment: String,
    /// Environments in which sharding is active
    pub environments: Vec<String>,
    /// Shard definitions per environment
    #[serde(default)]
    pub env: HashMap<String, EnvironmentSection>,
    /// Round-robin defaults
    pub routing: RoutingSection,
    /// Migration fan-out behaviour
    pub migration: MigrationSection,
    /// Logging configuration
    pub logging: LoggingSection,
}

impl ShardRelayConfig {
    /// Whether sharding is active for the current environment
    pub fn enabled(&self) -> bool {
        self.environments.iter().any(|env| env == &self.environment)
    }

    /// Shard definitions for the current environment
    pub fn current_section(&self) -> Option<&EnvironmentSection> {
        self.env.get(&self.environment)
    }
}

/// Shards configured for one environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSection {
    /// Connection parameters of the reserved `master` shard
    #[serde(default)]
    pub master: Option<ConnectionParams>,
    /// Shard definitions, in routing order
    #[serde(default)]
    pub shards: Vec<ShardDefinition>,
}

/// A single shard definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDefinition {
    /// Unique shard name
    pub name: String,
    /// Group (replica set) the shard belongs to
    #[serde(default)]
    pub group: Option<String>,
    /// Connection parameters
    #[serde(flatten)]
    pub connection: ConnectionParams,
}

/// Parameters handed to the driver to open a physical connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Driver adapter name
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Adapter-specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_adapter() -> String {
    "memory".to_string()
}

impl ConnectionParams {
    pub fn with_adapter<S: Into<String>>(adapter: S) -> Self {
        Self {
            adapter: adapter.into(),
            ..Self::default()
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            options: BTreeMap::new(),
        }
    }
}

// Password stays out of logs.
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("adapter", &self.adapter)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("options", &self.options)
            .finish()
    }
}

/// Defaults for `using_any_shard` style selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSection {
    /// Let round-robin selection return `master`
    #[serde(default)]
    pub include_master: bool,
    /// Start the round-robin cursor at a random shard
    #[serde(default)]
    pub start_with_random_shard: bool,
    /// Most saved-record placements remembered before the least recently
    /// used are forgotten
    #[serde(default = "default_placement_capacity")]
    pub placement_capacity: usize,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            include_master: false,
            start_with_random_shard: false,
            placement_capacity: default_placement_capacity(),
        }
    }
}

fn default_placement_capacity() -> usize {
    10_000
}

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSection {
    /// Behaviour when one shard fails
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Table recording applied versions on every shard
    #[serde(default = "default_migration_table")]
    pub table: String,
}

fn default_migration_table() -> String {
    "schema_migrations".to_string()
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            table: default_migration_table(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (structured)
    Json,
    /// Human-readable format
    Pretty,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

impl Default for ShardRelayConfig {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            environments: vec!["production".to_string()],
            env: HashMap::new(),
            routing: RoutingSection::default(),
            migration: MigrationSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
        }
    }
}
