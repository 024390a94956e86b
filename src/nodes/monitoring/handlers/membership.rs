use crate::{
    hash_ring::tier_name,
    messages::{self, Tier},
    nodes::monitoring::MonitoringNode,
    transport::Transport,
    ALL_TIERS,
};
use eyre::{bail, Context};

impl<T: Transport> MonitoringNode<T> {
    /// Applies a join or depart notification to the hash rings.
    ///
    /// Every change is published as a new ring snapshot and restarts the grace period of the
    /// affected tier.
    pub fn membership_handler(&mut self, serialized: &str) -> eyre::Result<()> {
        let parsed =
            serde_json::from_str(serialized).context("failed to deserialize notify message")?;

        match parsed {
            messages::Notify::Join(messages::Join {
                tier,
                node,
                join_count,
            }) => {
                log::info!(
                    "Received join from server {} in tier {}.",
                    node,
                    tier_name(tier)
                );

                match tier {
                    Tier::Memory | Tier::Disk => {
                        let inserted = self
                            .hash_rings
                            .update(|rings| rings.global_mut(tier).insert_node(node, join_count));
                        if inserted {
                            self.elasticity.membership_changed(tier);
                        }
                    }
                    Tier::Routing => {
                        self.routing_node_ids.insert(node.private_ip);
                    }
                }
            }
            messages::Notify::Depart(messages::Departed { tier, node }) => {
                log::info!("Received depart from server {}.", node);

                if tier == Tier::Routing {
                    bail!("invalid depart message for routing tier");
                }
                self.hash_rings
                    .update(|rings| rings.global_mut(tier).remove_node(&node));
                self.elasticity.node_departed(tier, &node);
                self.elasticity.membership_changed(tier);
            }
        }

        let rings = self.hash_rings.load();
        for &tier in ALL_TIERS {
            log::info!(
                "Hash ring for tier {} size is {}.",
                tier_name(tier),
                rings.node_count(tier)
            );
        }

        Ok(())
    }
}
