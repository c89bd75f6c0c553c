//! Resolved shard topology for the active environment

use shardrelay_core::{GroupName, Result, ShardName, ShardRelayError};

use crate::{ConnectionParams, ShardRelayConfig};

/// A configured shard with its connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEntry {
    pub name: ShardName,
    pub params: ConnectionParams,
    pub group: Option<GroupName>,
}

/// A named, ordered set of interchangeable shards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardGroup {
    pub name: GroupName,
    pub members: Vec<ShardName>,
}

impl ShardGroup {
    /// First member of the group
    pub fn leader(&self) -> Option<&ShardName> {
        self.members.first()
    }
}

/// Shards and groups the proxy routes over
///
/// `master` is always the first entry, followed by the configured shards in
/// definition order. Groups are ordered by first appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTopology {
    shards: Vec<ShardEntry>,
    groups: Vec<ShardGroup>,
    enabled: bool,
}

impl ShardTopology {
    /// Resolve the topology for the configuration's current environment
    ///
    /// When sharding is disabled for the environment only `master` is
    /// present.
    pub fn from_config(config: &ShardRelayConfig) -> Result<Self> {
        let enabled = config.enabled();
        let section = config.current_section();

        let master_params = section
            .and_then(|section| section.master.clone())
            .unwrap_or_default();

        let mut topology = Self::master_only(master_params);
        topology.enabled = enabled;

        if !enabled {
            return Ok(topology);
        }

        if let Some(section) = section {
            for definition in &section.shards {
                topology.push(
                    ShardName::new(definition.name.clone()),
                    definition.connection.clone(),
                    definition.group.clone().map(GroupName::from),
                )?;
            }
        } else {
            tracing::warn!(
                "Sharding enabled for environment {} but no shards are configured",
                config.environment
            );
        }

        Ok(topology)
    }

    /// Topology containing only the `master` shard
    pub fn master_only(params: ConnectionParams) -> Self {
        Self {
            shards: vec![ShardEntry {
                name: ShardName::master(),
                params,
                group: None,
            }],
            groups: Vec::new(),
            enabled: true,
        }
    }

    /// Add a shard at the end of the routing order
    pub fn push(
        &mut self,
        name: ShardName,
        params: ConnectionParams,
        group: Option<GroupName>,
    ) -> Result<()> {
        if name.is_master() {
            return Err(ShardRelayError::config(
                "Shard name 'master' is reserved; configure it under the master key",
            ));
        }
        if self.contains(&name) {
            return Err(ShardRelayError::config(format!("Duplicate shard name: {}", name)));
        }

        if let Some(group_name) = &group {
            match self.groups.iter_mut().find(|g| &g.name == group_name) {
                Some(existing) => existing.members.push(name.clone()),
                None => self.groups.push(ShardGroup {
                    name: group_name.clone(),
                    members: vec![name.clone()],
                }),
            }
        }

        self.shards.push(ShardEntry { name, params, group });
        Ok(())
    }

    pub fn with_shard(mut self, name: &str, params: ConnectionParams) -> Result<Self> {
        self.push(ShardName::from(name), params, None)?;
        Ok(self)
    }

    pub fn with_grouped_shard(mut self, name: &str, group: &str, params: ConnectionParams) -> Result<Self> {
        self.push(ShardName::from(name), params, Some(GroupName::from(group)))?;
        Ok(self)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn contains(&self, name: &ShardName) -> bool {
        self.shards.iter().any(|entry| &entry.name == name)
    }

    pub fn entries(&self) -> &[ShardEntry] {
        &self.shards
    }

    pub fn shard_names(&self) -> Vec<ShardName> {
        self.shards.iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn groups(&self) -> &[ShardGroup] {
        &self.groups
    }

    pub fn group(&self, name: &GroupName) -> Option<&ShardGroup> {
        self.groups.iter().find(|group| &group.name == name)
    }
}
