//! Configuration loading and management

use std::path::{Path, PathBuf};

use shardrelay_core::{Result, ShardRelayError};

use crate::{ConfigValidator, ShardRelayConfig};

/// Name of the shard configuration file looked up in every search path
pub const CONFIG_FILE_NAME: &str = "shards.toml";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "SHARDRELAY";

/// Configuration loader with hierarchical loading support
pub struct ConfigLoader {
    /// Search paths for configuration files
    search_paths: Vec<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                "/etc/shardrelay".to_string(),
                "~/.shardrelay".to_string(),
                ".".to_string(),
            ],
        }
    }

    pub fn with_search_paths(mut self, paths: Vec<String>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest precedence)
    /// 2. `shards.toml` found in the search paths, later paths winning
    /// 3. Default values (lowest precedence)
    pub async fn load(&self) -> Result<ShardRelayConfig> {
        let mut builder = self.base_builder()?;

        for path in self.find_config_files() {
            tracing::debug!("Loading shard configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        self.finish(builder.add_source(Self::environment_source()))
    }

    /// Load configuration from a specific file
    pub async fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<ShardRelayConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ShardRelayError::config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let builder = self
            .base_builder()?
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(Self::environment_source());

        self.finish(builder)
    }

    /// Load configuration from TOML text, without environment overrides
    pub fn load_from_str(&self, content: &str) -> Result<ShardRelayConfig> {
        let builder = self
            .base_builder()?
            .add_source(config::File::from_str(content, config::FileFormat::Toml));

        self.finish(builder)
    }

    /// Save current configuration to a file
    pub async fn save_to_file<P: AsRef<Path>>(
        &self,
        config: &ShardRelayConfig,
        path: P,
    ) -> Result<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ShardRelayError::config(format!("Failed to serialize configuration: {}", e))
        })?;

        tokio::fs::write(path, toml_string).await.map_err(|e| {
            ShardRelayError::config(format!("Failed to write configuration file: {}", e))
        })?;

        Ok(())
    }

    fn base_builder(&self) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let defaults = toml::to_string_pretty(&ShardRelayConfig::default()).map_err(|e| {
            ShardRelayError::config(format!("Failed to serialize default configuration: {}", e))
        })?;

        Ok(config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Toml)))
    }

    fn environment_source() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("environments")
            .try_parsing(true)
    }

    fn finish(
        &self,
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ShardRelayConfig> {
        let config = builder.build().map_err(|e| {
            ShardRelayError::config(format!("Failed to build configuration: {}", e))
        })?;

        let shard_config: ShardRelayConfig = config.try_deserialize().map_err(|e| {
            ShardRelayError::config(format!("Failed to deserialize configuration: {}", e))
        })?;

        ConfigValidator::validate(&shard_config)?;

        Ok(shard_config)
    }

    fn find_config_files(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for search_path in &self.search_paths {
            let mut path = if let Some(rest) = search_path.strip_prefix("~/") {
                match std::env::var_os("HOME") {
                    Some(home) => PathBuf::from(home).join(rest),
                    None => continue,
                }
            } else {
                PathBuf::from(search_path)
            };
            path.push(CONFIG_FILE_NAME);

            if path.exists() && !found.contains(&path) {
                found.push(path);
            }
        }
        found
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
