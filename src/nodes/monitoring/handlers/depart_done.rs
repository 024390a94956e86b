use crate::{
    hash_ring::tier_name,
    messages::{management::RemoveNode, Departed},
    nodes::monitoring::{elasticity::DepartProgress, MonitoringNode},
    transport::Transport,
};
use eyre::Context;
use std::time::Instant;

impl<T: Transport> MonitoringNode<T> {
    /// Counts one thread departure of a node that is being removed.
    ///
    /// After the last thread of the node acknowledged, the management node is told to
    /// release the node. Acknowledgements of unknown nodes are ignored.
    pub fn depart_done_handler(&mut self, serialized: &str) -> eyre::Result<()> {
        let departed: Departed =
            serde_json::from_str(serialized).context("failed to deserialize Depart message")?;

        match self
            .elasticity
            .depart_done(&departed.node, Instant::now())
        {
            DepartProgress::Unknown => {
                log::warn!(
                    "Ignoring depart acknowledgement of node {} that is not departing.",
                    departed.node
                );
            }
            DepartProgress::Pending(remaining) => {
                log::debug!(
                    "Node {} has {} departing thread(s) left.",
                    departed.node,
                    remaining
                );
            }
            DepartProgress::Complete(operation) => {
                log::info!(
                    "Removing {} node {}.",
                    tier_name(operation.tier),
                    operation.node,
                );

                let payload = serde_json::to_string(&RemoveNode {
                    tier: operation.tier,
                    departed: operation.node,
                })
                .context("failed to serialize RemoveNode")?;
                let topic = self.management_node.remove_node_topic(&self.prefix);
                self.send(&topic, payload);
            }
        }

        Ok(())
    }
}
