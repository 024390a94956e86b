//! Private module containing the [`Join`] type.

use super::Tier;
use crate::topics::NodeAddress;

/// Signals that a node joined the cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Join {
    /// The tier of the newly joined node.
    pub tier: Tier,
    /// The address of the joined node.
    ///
    /// Routing nodes are identified by the private IP of this address.
    pub node: NodeAddress,
    /// Counter to signal that a node is rejoining.
    pub join_count: u32,
}
