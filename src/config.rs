//! Types for parsing anna configuration files.
//!
//! The top level config type is [`Config`].

use eyre::{bail, Context};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// The top level config type.
///
/// This type can be read and written to config files using the [`serde::Serialize`] and
/// [`serde::Deserialize`] implementations.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Defines the number of threads that should be used per node.
    pub threads: Threads,
    /// Defines the replication factors for different tiers.
    pub replication: Replication,
    /// Defines the memory capacity for each tier.
    pub capacities: Capacities,
    /// Controls which policies of the monitoring should be enabled.
    pub policy: Policy,
    /// Timing and threshold constants of the monitoring node.
    #[serde(default)]
    pub monitoring: Monitoring,
}

impl Config {
    /// Reads and validates the YAML config file at the given path.
    pub fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let config: Config = serde_yaml::from_str(
            &fs::read_to_string(path)
                .with_context(|| format!("failed to read config file `{}`", path.display()))?,
        )
        .context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the thread counts and thresholds describe a usable cluster.
    pub fn validate(&self) -> eyre::Result<()> {
        if self.threads.memory == 0 || self.threads.ebs == 0 {
            bail!("KVS nodes need at least one thread per tier");
        }
        let m = &self.monitoring;
        for (name, value) in [
            ("max-memory-consumption", m.max_memory_consumption),
            ("min-memory-consumption", m.min_memory_consumption),
            ("max-ebs-consumption", m.max_ebs_consumption),
            ("min-ebs-consumption", m.min_ebs_consumption),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("`{}` must be within [0, 1], got {}", name, value);
            }
        }
        if m.min_memory_consumption >= m.max_memory_consumption {
            bail!("`min-memory-consumption` must be lower than `max-memory-consumption`");
        }
        if m.min_ebs_consumption >= m.max_ebs_consumption {
            bail!("`min-ebs-consumption` must be lower than `max-ebs-consumption`");
        }
        if m.node_addition_batch_size == 0 {
            bail!("`node-addition-batch-size` must be at least 1");
        }
        Ok(())
    }
}

/// Specifies the number of threads that should be spawned for nodes.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Threads {
    /// The number of threads that should be spawned for KVS nodes on the memory tier.
    pub memory: u32,
    /// The number of threads that should be spawned for KVS nodes on the disk tier.
    pub ebs: u32,
    /// The number of threads that should be spawned for routing nodes.
    pub routing: u32,
    /// The number of threads that should be spawned for benchmark nodes.
    pub benchmark: u32,
}

/// Specifies the replication factors that should be used for nodes.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Replication {
    /// The replication factor for KVS nodes on the memory tier.
    pub memory: usize,
    /// The replication factor for KVS nodes on the disk tier.
    pub ebs: usize,
    /// The local replication factor.
    pub local: usize,
    /// The minimum replication factor.
    pub minimum: usize,
}

/// Defines the capacity of KVS nodes depending on the [`Tier`][crate::messages::Tier].
///
/// Both values are given in megabytes.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Capacities {
    /// Capacity of memory nodes.
    pub memory_cap: u64,
    /// Capacity of disk nodes.
    pub ebs_cap: u64,
}

/// The `anna` KVS supports different policies for dynamically optimizing the key distribution
/// and cluster layout at runtime.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Policy {
    /// Adds and remove nodes dynamically if needed, e.g. on insufficient storage capacity.
    pub elasticity: bool,
    /// Automatically promote/demote keys across storage tiers based on their access frequency.
    pub tiering: bool,
    /// Automatically increase the number of in-memory replicas for hot keys.
    pub selective_rep: bool,
}

/// The constants table of the monitoring node.
///
/// Every field has a default, so the whole section can be omitted from config files.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Monitoring {
    /// Length of one monitoring epoch.
    pub epoch_secs: u64,
    /// How long a scale-down condition must hold before nodes are removed.
    pub grace_period_secs: u64,
    /// How long a monitoring epoch waits for the responses to its statistics requests.
    pub response_timeout_ms: u64,
    /// How long an issued scale action may stay unacknowledged before it is abandoned.
    pub action_timeout_secs: u64,
    /// Maximum number of nodes requested by a single scale-up.
    pub node_addition_batch_size: usize,
    /// Storage consumption of memory nodes above which the tier is scaled up.
    pub max_memory_consumption: f64,
    /// Storage consumption of memory nodes below which the tier is scaled down.
    pub min_memory_consumption: f64,
    /// Storage consumption of disk nodes above which the tier is scaled up.
    pub max_ebs_consumption: f64,
    /// Storage consumption of disk nodes below which the tier is scaled down.
    pub min_ebs_consumption: f64,
    /// Keys accessed more often than this per epoch are promoted to the memory tier.
    pub key_promotion_threshold: usize,
    /// Keys accessed at most this often per epoch are demoted to the disk tier.
    pub key_demotion_threshold: usize,
    /// The memory tier is never scaled below this number of nodes.
    pub min_memory_tier_size: usize,
    /// The disk tier is never scaled below this number of nodes.
    pub min_ebs_tier_size: usize,
    /// Client-observed latency above which the latency SLO counts as violated.
    pub slo_worst_ms: f64,
}

impl Monitoring {
    /// The monitoring epoch length.
    pub fn epoch(&self) -> Duration {
        Duration::from_secs(self.epoch_secs)
    }

    /// The grace period for scale-down decisions.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// The collection window of one epoch.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// The acknowledgement timeout of scale actions.
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            epoch_secs: 30,
            grace_period_secs: 120,
            response_timeout_ms: 5000,
            action_timeout_secs: 300,
            node_addition_batch_size: 2,
            max_memory_consumption: 0.6,
            min_memory_consumption: 0.3,
            max_ebs_consumption: 0.75,
            min_ebs_consumption: 0.5,
            key_promotion_threshold: 0,
            key_demotion_threshold: 0,
            min_memory_tier_size: 1,
            min_ebs_tier_size: 0,
            slo_worst_ms: 3000.,
        }
    }
}
