#![warn(missing_docs)]

//! Monitoring and elasticity control loop for the [`anna`](https://github.com/hydro-project/anna)
//! key-value store.
//!
//! The [`MonitoringNode`][nodes::monitoring::MonitoringNode] periodically queries the
//! self-reported statistics of every KVS node thread through the store's own request/response
//! path, folds them into one cluster-wide
//! [`SummaryStats`][nodes::monitoring::SummaryStats] snapshot and feeds that snapshot to two
//! controllers:
//!
//! - the [`ElasticityController`][nodes::monitoring::ElasticityController], which adds nodes to
//!   or removes nodes from the memory and disk tiers, and
//! - the [`ReplicationController`][nodes::monitoring::ReplicationController], which promotes
//!   hot keys to the memory tier and demotes cold keys to the disk tier.
//!
//! ## Usage Example
//!
//! `cargo run --bin simulate -- example-config.yml --epochs 10` runs the control loop against
//! an in-process [`SimulatedCluster`][simulation::SimulatedCluster] and logs every decision.

use eyre::anyhow;
use messages::Tier;
use metadata::MetadataKey;
use std::{error::Error, fmt::Display, sync::Arc};

pub mod config;
pub mod hash_ring;
pub mod messages;
pub mod metadata;
pub mod nodes;
pub mod simulation;
pub mod topics;
pub mod transport;

/// List of all known [`Tier`]s (except the `Routing` tier).
pub const ALL_TIERS: &[Tier] = &[Tier::Memory, Tier::Disk];

/// A string-based key type used to store user-supplied data.
///
/// We use an [`Arc`]-wrapped [`String`] because keys often get cloned. For bare strings, this
/// would require a reallocation, but with the `Arc` wrapper only reference counter is
/// incremented.
#[derive(
    Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, serde::Serialize, serde::Deserialize,
)]
pub struct ClientKey(Arc<String>);

impl std::ops::Deref for ClientKey {
    type Target = Arc<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for ClientKey {
    fn from(k: String) -> Self {
        Self(Arc::new(k))
    }
}

impl From<&str> for ClientKey {
    fn from(k: &str) -> Self {
        Self::from(k.to_owned())
    }
}

/// The key type used in the key-value store.
///
/// Metadata keys live in their own namespace, so they can never collide with user keys even
/// though both are routed through the same hash rings.
#[derive(Debug, PartialEq, Eq, Hash, Clone, serde::Serialize, serde::Deserialize)]
pub enum Key {
    /// A key supplied by a client.
    Client(ClientKey),
    /// Used to store internal metadata.
    Metadata(MetadataKey),
}

impl From<MetadataKey> for Key {
    fn from(key: MetadataKey) -> Self {
        Self::Metadata(key)
    }
}

impl From<ClientKey> for Key {
    fn from(key: ClientKey) -> Self {
        Self::Client(key)
    }
}

impl<'a> From<&'a ClientKey> for Key {
    fn from(key: &'a ClientKey) -> Self {
        Self::Client(key.clone())
    }
}

impl std::convert::TryFrom<Key> for ClientKey {
    type Error = eyre::Error;

    fn try_from(value: Key) -> Result<Self, Self::Error> {
        match value {
            Key::Metadata(_) => Err(anyhow!("key is a metadata key instead of a client key")),
            Key::Client(key) => Ok(key),
        }
    }
}

/// Used to signal errors in messages.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum AnnaError {
    /// The requested key does not exist.
    KeyDoesNotExist,
    /// The request was sent to the wrong thread, which is not responsible for the
    /// key.
    WrongThread,
    /// The request timed out.
    Timeout,
    /// The lattice type was not correctly specified or conflicted with an
    /// existing key.
    Lattice,
    /// This error is returned by the routing tier if no servers are in the
    /// cluster.
    NoServers,
    /// Failed to serialize a message.
    Serialize,
}

impl Display for AnnaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyDoesNotExist => write!(f, "The requested key does not exist."),
            Self::WrongThread => write!(
                f,
                "The request was sent to the wrong thread, which is not responsible for the key."
            ),
            Self::Timeout => write!(f, "The request timed out."),
            Self::Lattice => write!(
                f,
                "The lattice type was not correctly specified or conflicted with an existing key."
            ),
            Self::NoServers => write!(f, "There are no servers in the cluster."),
            Self::Serialize => write!(f, "Serialization error."),
        }
    }
}

impl Error for AnnaError {}

impl From<serde_json::Error> for AnnaError {
    fn from(_: serde_json::Error) -> Self {
        Self::Serialize
    }
}
