//! Messages related to replication of keys.

use crate::{hash_ring::KeyReplication, ClientKey};

/// A message that captures the replication factor for an individual key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationFactor {
    /// The name of the key whose replication factor is being changed.
    pub key: ClientKey,
    /// A set of mappings from individual tiers (MEMORY, DISK -- see Tier enum)
    /// to the cross-machine replication factor at that tier.
    pub global: Vec<ReplicationValue>,
    /// A set of mappings from individual tiers (MEMORY, DISK -- see Tier enum)
    /// to the intra-machine replication factor at that tier.
    pub local: Vec<ReplicationValue>,
}

impl ReplicationFactor {
    /// Describes the given replication vector of `key`.
    pub fn new(key: ClientKey, replication: &KeyReplication) -> Self {
        let mut global: Vec<_> = replication
            .global_replication
            .iter()
            .map(|(&tier, &value)| ReplicationValue { tier, value })
            .collect();
        let mut local: Vec<_> = replication
            .local_replication
            .iter()
            .map(|(&tier, &value)| ReplicationValue { tier, value })
            .collect();
        global.sort_by_key(|v| v.tier);
        local.sort_by_key(|v| v.tier);
        Self { key, global, local }
    }

    /// Converts the message back into a [`KeyReplication`].
    pub fn key_replication(&self) -> KeyReplication {
        KeyReplication {
            global_replication: self.global.iter().map(|v| (v.tier, v.value)).collect(),
            local_replication: self.local.iter().map(|v| (v.tier, v.value)).collect(),
        }
    }
}

/// A message representing the replication level for a single key at a
/// single tier.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationValue {
    /// The tier represented by this message.
    pub tier: super::Tier,
    /// The replication level at this particular tier for this particular key.
    pub value: usize,
}

/// A message to propagate changes to a set of keys' replication factors.
///
/// The receiver acknowledges the update by sending a [`Response`][super::Response] with the
/// given `request_id` to the `response_address`.
#[derive(Default, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationFactorUpdate {
    /// Used to match the acknowledgement with this update.
    pub request_id: Option<String>,
    /// The topic on which the acknowledgement is expected.
    pub response_address: Option<String>,
    /// The set of replication factor updates being sent.
    pub updates: Vec<ReplicationFactor>,
}
