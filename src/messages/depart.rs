//! Private module containing the [`SelfDepart`] and [`Departed`] types.

use super::Tier;
use crate::topics::NodeAddress;

/// Signals that a node (or one of its threads) left the cluster.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Departed {
    /// The tier of the departed node.
    pub tier: Tier,
    /// The address of the departed node.
    pub node: NodeAddress,
}

/// The receiving node should leave the cluster.
///
/// Each of its threads should send a [`Departed`] message as an acknowledge message to the
/// given `response_topic` once it handed off its data.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SelfDepart {
    /// The topic on which the `Departed` message should be sent.
    pub response_topic: String,
}
