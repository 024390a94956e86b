//! Communication with the management node.

use super::Tier;
use crate::topics::NodeAddress;

/// Adds the given number of nodes to the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AddNodes {
    /// The number of new nodes that should be added.
    pub number: usize,
    /// The tier in which the new nodes should be added.
    pub tier: Tier,
}

/// Shuts down the given node that is no longer part of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RemoveNode {
    /// The tier that the node belonged to.
    pub tier: Tier,
    /// The address of the node that departed from the cluster.
    pub departed: NodeAddress,
}
