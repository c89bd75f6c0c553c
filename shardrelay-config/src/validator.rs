//! Configuration validation

use std::collections::HashSet;

use crate::{ConnectionParams, EnvironmentSection, ShardRelayConfig};
use shardrelay_core::{Result, ShardRelayError, MASTER_SHARD};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration
    pub fn validate(config: &ShardRelayConfig) -> Result<()> {
        Self::validate_environments(config)?;

        for (name, section) in &config.env {
            Self::validate_section(name, section)?;
        }

        Self::validate_migration(config)?;

        if config.routing.placement_capacity == 0 {
            return Err(ShardRelayError::config("Placement capacity must be at least 1"));
        }

        // Cross-section validation
        Self::validate_cross_section(config)?;

        Ok(())
    }

    fn validate_environments(config: &ShardRelayConfig) -> Result<()> {
        if config.environment.trim().is_empty() {
            return Err(ShardRelayError::config("Environment name cannot be empty"));
        }

        for env in &config.environments {
            if env.trim().is_empty() {
                return Err(ShardRelayError::config(
                    "Sharded environments list contains an empty name",
                ));
            }
        }

        Ok(())
    }

    fn validate_section(env: &str, section: &EnvironmentSection) -> Result<()> {
        if let Some(master) = &section.master {
            Self::validate_connection(env, MASTER_SHARD, master)?;
        }

        let mut seen = HashSet::new();
        for shard in &section.shards {
            if shard.name.trim().is_empty() {
                return Err(ShardRelayError::config(format!(
                    "Shard name cannot be empty (environment {})",
                    env
                )));
            }

            if shard.name == MASTER_SHARD {
                return Err(ShardRelayError::config(format!(
                    "Shard name '{}' is reserved (environment {}); configure it under the master key",
                    MASTER_SHARD, env
                )));
            }

            if !seen.insert(shard.name.as_str()) {
                return Err(ShardRelayError::config(format!(
                    "Duplicate shard name {} in environment {}",
                    shard.name, env
                )));
            }

            if let Some(group) = &shard.group {
                if group.trim().is_empty() {
                    return Err(ShardRelayError::config(format!(
                        "Shard {} has an empty group name",
                        shard.name
                    )));
                }
            }

            Self::validate_connection(env, &shard.name, &shard.connection)?;
        }

        // Group names share the lookup namespace with shard names
        for shard in &section.shards {
            if let Some(group) = &shard.group {
                if seen.contains(group.as_str()) || group == MASTER_SHARD {
                    return Err(ShardRelayError::config(format!(
                        "Group name {} collides with a shard name",
                        group
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_connection(env: &str, shard: &str, params: &ConnectionParams) -> Result<()> {
        if params.adapter.trim().is_empty() {
            return Err(ShardRelayError::config(format!(
                "Shard {} in environment {} has no adapter",
                shard, env
            )));
        }

        if params.port == Some(0) {
            return Err(ShardRelayError::config(format!(
                "Shard {} in environment {} has an invalid port 0",
                shard, env
            )));
        }

        Ok(())
    }

    fn validate_migration(config: &ShardRelayConfig) -> Result<()> {
        if config.migration.table.trim().is_empty() {
            return Err(ShardRelayError::config("Migration table name cannot be empty"));
        }

        Ok(())
    }

    fn validate_cross_section(config: &ShardRelayConfig) -> Result<()> {
        if config.enabled() && config.current_section().is_none() {
            tracing::warn!(
                "Sharding is enabled for {} but no [env.{}] section exists - all traffic goes to master",
                config.environment,
                config.environment
            );
        }

        for env in config.env.keys() {
            if !config.environments.contains(env) {
                tracing::debug!("Shards defined for {} but sharding is not enabled there", env);
            }
        }

        Ok(())
    }
}
