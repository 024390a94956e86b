//! An in-process stand-in for a KVS cluster.
//!
//! The [`SimulatedCluster`] consumes the messages that a
//! [`MonitoringNode`][crate::nodes::monitoring::MonitoringNode] publishes through a
//! [`ChannelTransport`][crate::transport::ChannelTransport] and answers them the way KVS,
//! routing and management nodes would.

use crate::{
    config::Config,
    hash_ring::KeyReplication,
    messages::{
        key_data::{KeyAccessData, KeyCount, KeySize, KeySizeData},
        management::{AddNodes, RemoveNode},
        replication_factor::{ReplicationFactor, ReplicationFactorUpdate},
        request::RequestData,
        response::{ResponseTuple, ResponseType},
        user_feedback::ServerThreadStatistics,
        Departed, Join, Notify, Request, Response, SelfDepart, Tier,
    },
    metadata::{KvsMetadataKind, MetadataKey},
    nodes::monitoring::{EpochReport, MonitoringNode},
    topics::NodeAddress,
    transport::{OutboundMessage, Transport},
    AnnaError, ClientKey, Key,
};
use eyre::{anyhow, Context};
use smol::channel::{Receiver, Sender};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Instant,
};

/// The self-reported behavior of one simulated node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeProfile {
    /// The tier of the node.
    pub tier: Tier,
    /// Consumed bytes reported by every thread.
    pub storage_per_thread: u64,
    /// Occupancy reported by every thread.
    pub occupancy: f64,
    /// Served accesses reported by every thread.
    pub accesses_per_thread: usize,
    /// Key access counts, reported by thread 0.
    pub key_access: BTreeMap<ClientKey, usize>,
    /// Key sizes in bytes, reported by thread 0.
    pub key_sizes: BTreeMap<ClientKey, usize>,
}

impl NodeProfile {
    /// An idle node without data.
    pub fn empty(tier: Tier) -> Self {
        Self {
            tier,
            storage_per_thread: 0,
            occupancy: 0.,
            accesses_per_thread: 0,
            key_access: Default::default(),
            key_sizes: Default::default(),
        }
    }

    /// Sets the reported access count and size of `key`.
    pub fn with_key(mut self, key: impl Into<ClientKey>, access_count: usize, size: usize) -> Self {
        let key = key.into();
        self.key_access.insert(key.clone(), access_count);
        self.key_sizes.insert(key, size);
        self
    }
}

/// A message that the cluster delivers to the monitoring node outside of the response channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A serialized [`Notify`] for the membership handler.
    Notify(String),
    /// A serialized [`Departed`] for the depart-done handler.
    DepartDone(String),
}

/// Simulated KVS, routing and management nodes.
#[derive(Debug)]
pub struct SimulatedCluster {
    prefix: String,
    threads: HashMap<Tier, u32>,
    nodes: BTreeMap<NodeAddress, NodeProfile>,
    muted: BTreeSet<NodeAddress>,
    metadata: HashMap<MetadataKey, Vec<u8>>,
    events: Vec<InboundEvent>,
    history: Vec<OutboundMessage>,
    next_address: u32,
}

impl SimulatedCluster {
    /// Creates an empty cluster whose nodes run the thread counts of `config`.
    pub fn new(prefix: impl Into<String>, config: &Config) -> Self {
        Self {
            prefix: prefix.into(),
            threads: [
                (Tier::Memory, config.threads.memory),
                (Tier::Disk, config.threads.ebs),
            ]
            .iter()
            .copied()
            .collect(),
            nodes: Default::default(),
            muted: Default::default(),
            metadata: Default::default(),
            events: Default::default(),
            history: Default::default(),
            next_address: 1,
        }
    }

    /// Starts a node and queues its join notification.
    pub fn add_node(&mut self, profile: NodeProfile) -> eyre::Result<NodeAddress> {
        let i = self.next_address;
        self.next_address += 1;
        let node = NodeAddress::new(
            format!("34.0.{}.{}", i / 256, i % 256),
            format!("10.0.{}.{}", i / 256, i % 256),
        );

        let join = Notify::Join(Join {
            tier: profile.tier,
            node: node.clone(),
            join_count: 0,
        });
        self.events.push(InboundEvent::Notify(
            serde_json::to_string(&join).context("failed to serialize Join")?,
        ));
        self.nodes.insert(node.clone(), profile);
        Ok(node)
    }

    /// Registers a routing node. It acknowledges every replication update.
    pub fn add_routing_node(&mut self, node_id: impl Into<String>) -> eyre::Result<()> {
        let node_id = node_id.into();
        let join = Notify::Join(Join {
            tier: Tier::Routing,
            node: NodeAddress::new(node_id.clone(), node_id),
            join_count: 0,
        });
        self.events.push(InboundEvent::Notify(
            serde_json::to_string(&join).context("failed to serialize Join")?,
        ));
        Ok(())
    }

    /// The running nodes.
    pub fn nodes(&self) -> &BTreeMap<NodeAddress, NodeProfile> {
        &self.nodes
    }

    /// The running nodes of the given tier.
    pub fn tier_nodes(&self, tier: Tier) -> Vec<NodeAddress> {
        self.nodes
            .iter()
            .filter(|(_, profile)| profile.tier == tier)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Gives mutable access to the profile of `node`.
    pub fn node_mut(&mut self, node: &NodeAddress) -> Option<&mut NodeProfile> {
        self.nodes.get_mut(node)
    }

    /// Stops `node` from answering anything.
    pub fn mute(&mut self, node: &NodeAddress) {
        self.muted.insert(node.clone());
    }

    /// Lets a muted node answer again.
    pub fn unmute(&mut self, node: &NodeAddress) {
        self.muted.remove(node);
    }

    /// All messages that the cluster received so far.
    pub fn history(&self) -> &[OutboundMessage] {
        &self.history
    }

    /// The replication vector stored in the metadata namespace for `key`.
    pub fn stored_replication(&self, key: &ClientKey) -> Option<KeyReplication> {
        self.metadata
            .get(&MetadataKey::Replication { key: key.clone() })
            .and_then(|value| serde_json::from_slice::<ReplicationFactor>(value).ok())
            .map(|factor| factor.key_replication())
    }

    /// Handles all queued outbound messages.
    ///
    /// Responses and acknowledgements are pushed into `responses`. Returns the membership and
    /// departure events that were produced since the last call.
    pub fn pump(
        &mut self,
        outbound: &Receiver<OutboundMessage>,
        responses: &Sender<String>,
    ) -> eyre::Result<Vec<InboundEvent>> {
        while let Ok(message) = outbound.try_recv() {
            self.handle(&message, responses)
                .with_context(|| format!("failed to handle message on `{}`", message.topic))?;
            self.history.push(message);
        }
        Ok(std::mem::take(&mut self.events))
    }

    /// Runs one epoch of `node` while the cluster answers its requests.
    ///
    /// Queued events are delivered before the epoch starts; the actions of the epoch are
    /// applied afterwards, so their effect is visible to the next epoch.
    pub fn drive_epoch<T: Transport>(
        &mut self,
        node: &mut MonitoringNode<T>,
        outbound: &Receiver<OutboundMessage>,
        responses: &Sender<String>,
    ) -> eyre::Result<EpochReport> {
        self.deliver(node, outbound, responses)?;

        let (report, served) = smol::block_on(futures::future::join(
            node.run_epoch(Instant::now()),
            async { self.pump(outbound, responses) },
        ));
        self.events.extend(served?);
        let report = report?;

        self.deliver(node, outbound, responses)?;
        Ok(report)
    }

    /// Delivers events to `node` until the cluster is quiet.
    pub fn deliver<T: Transport>(
        &mut self,
        node: &mut MonitoringNode<T>,
        outbound: &Receiver<OutboundMessage>,
        responses: &Sender<String>,
    ) -> eyre::Result<()> {
        loop {
            let events = self.pump(outbound, responses)?;
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                match event {
                    InboundEvent::Notify(serialized) => node.membership_handler(&serialized)?,
                    InboundEvent::DepartDone(serialized) => {
                        node.depart_done_handler(&serialized)?
                    }
                }
            }
        }
    }

    fn handle(
        &mut self,
        message: &OutboundMessage,
        responses: &Sender<String>,
    ) -> eyre::Result<()> {
        let path = message
            .topic
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| anyhow!("topic is outside of prefix `{}`", self.prefix))?;
        let parts: Vec<&str> = path.split('/').collect();

        match parts.as_slice() {
            ["management", "add_nodes"] => {
                let AddNodes { number, tier } = serde_json::from_str(&message.payload)
                    .context("failed to deserialize AddNodes")?;
                log::info!("Simulated cluster starts {} node(s) in tier {:?}.", number, tier);
                for _ in 0..number {
                    self.add_node(NodeProfile::empty(tier))?;
                }
            }
            ["management", "remove_node"] => {
                let RemoveNode { tier, departed } = serde_json::from_str(&message.payload)
                    .context("failed to deserialize RemoveNode")?;
                self.nodes.remove(&departed);
                self.muted.remove(&departed);
                let depart = Notify::Depart(Departed {
                    tier,
                    node: departed,
                });
                self.events.push(InboundEvent::Notify(serde_json::to_string(&depart)?));
            }
            [ip, "key_request", _] => {
                if let Some(node) = self.answering_node(ip) {
                    let request: Request = serde_json::from_str(&message.payload)
                        .context("failed to deserialize Request")?;
                    let response = self.answer(&node, &request);
                    if let Some(address) = &request.response_address {
                        reply(responses, address, &response)?;
                    }
                }
            }
            [ip, "server_replication_change", _] => {
                if self.answering_node(ip).is_some() {
                    acknowledge_update(responses, &message.payload)?;
                }
            }
            [_, "routing_replication_change", _] => {
                acknowledge_update(responses, &message.payload)?;
            }
            [ip, "self_depart", _] => {
                if let Some(node) = self.answering_node(ip) {
                    let SelfDepart { response_topic } = serde_json::from_str(&message.payload)
                        .context("failed to deserialize SelfDepart")?;
                    log::debug!("Departed node answers on {}.", response_topic);

                    let tier = self.nodes[&node].tier;
                    let departed = serde_json::to_string(&Departed {
                        tier,
                        node: node.clone(),
                    })?;
                    for _ in 0..self.threads.get(&tier).copied().unwrap_or(1) {
                        self.events.push(InboundEvent::DepartDone(departed.clone()));
                    }
                }
            }
            _ => log::warn!("Simulated cluster ignores message on `{}`.", message.topic),
        }
        Ok(())
    }

    /// The running, unmuted node with the given private IP.
    fn answering_node(&self, private_ip: &str) -> Option<NodeAddress> {
        self.nodes
            .keys()
            .find(|node| node.private_ip == private_ip)
            .filter(|node| !self.muted.contains(*node))
            .cloned()
    }

    fn answer(&mut self, receiver: &NodeAddress, request: &Request) -> Response {
        let mut response = request.new_response();
        match &request.request {
            RequestData::Get { keys } => {
                for key in keys {
                    let value = self.read_metadata(key);
                    response.tuples.push(ResponseTuple {
                        key: key.clone(),
                        error: if value.is_none() {
                            Some(AnnaError::KeyDoesNotExist)
                        } else {
                            None
                        },
                        value,
                    });
                }
            }
            RequestData::Put { tuples } => {
                for tuple in tuples {
                    if let Key::Metadata(key) = &tuple.key {
                        self.metadata.insert(key.clone(), tuple.value.clone());
                    }
                    response.tuples.push(ResponseTuple {
                        key: tuple.key.clone(),
                        value: None,
                        error: None,
                    });
                }
                log::debug!("Node {} stored {} metadata tuple(s).", receiver, tuples.len());
            }
        }
        response
    }

    fn read_metadata(&self, key: &Key) -> Option<Vec<u8>> {
        let (kvs_thread, kind) = match key {
            Key::Metadata(MetadataKey::KvsThread {
                kvs_thread, kind, ..
            }) => (kvs_thread, *kind),
            Key::Metadata(other) => return self.metadata.get(other).cloned(),
            Key::Client(_) => return None,
        };
        if self.muted.contains(&kvs_thread.node) {
            return None;
        }
        let profile = self.nodes.get(&kvs_thread.node)?;
        let reports_keys = kvs_thread.thread_id == 0;

        let value = match kind {
            KvsMetadataKind::ServerStats => serde_json::to_vec(&ServerThreadStatistics {
                storage_consumption: profile.storage_per_thread,
                occupancy: profile.occupancy,
                epoch: 0,
                access_count: profile.accesses_per_thread,
            }),
            KvsMetadataKind::KeyAccess => serde_json::to_vec(&KeyAccessData {
                keys: profile
                    .key_access
                    .iter()
                    .filter(|_| reports_keys)
                    .map(|(key, &access_count)| KeyCount {
                        key: key.into(),
                        access_count,
                    })
                    .collect(),
            }),
            KvsMetadataKind::KeySize => serde_json::to_vec(&KeySizeData {
                key_sizes: profile
                    .key_sizes
                    .iter()
                    .filter(|_| reports_keys)
                    .map(|(key, &size)| KeySize {
                        key: key.clone(),
                        size,
                    })
                    .collect(),
            }),
        };
        value.ok()
    }
}

fn reply(responses: &Sender<String>, address: &str, response: &Response) -> eyre::Result<()> {
    let serialized = serde_json::to_string(response).context("failed to serialize Response")?;
    responses
        .try_send(serialized)
        .map_err(|err| anyhow!("failed to answer on `{}`: {}", address, err))
}

fn acknowledge_update(responses: &Sender<String>, payload: &str) -> eyre::Result<()> {
    let update: ReplicationFactorUpdate =
        serde_json::from_str(payload).context("failed to deserialize ReplicationFactorUpdate")?;
    let address = match &update.response_address {
        Some(address) => address,
        None => return Ok(()),
    };
    let response = Response {
        response_id: update.request_id.clone(),
        ty: ResponseType::Put,
        error: Ok(()),
        tuples: Vec::new(),
    };
    reply(responses, address, &response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Capacities, Monitoring, Policy, Replication, Threads},
        transport::ChannelTransport,
    };
    use pretty_assertions::assert_eq;

    fn config() -> Config {
        Config {
            threads: Threads {
                memory: 2,
                ebs: 1,
                routing: 1,
                benchmark: 1,
            },
            replication: Replication {
                memory: 1,
                ebs: 0,
                local: 1,
                minimum: 1,
            },
            capacities: Capacities {
                memory_cap: 1,
                ebs_cap: 1,
            },
            policy: Policy {
                elasticity: false,
                tiering: false,
                selective_rep: false,
            },
            monitoring: Monitoring::default(),
        }
    }

    #[test]
    fn muted_node_reports_missing_statistics() {
        let (transport, outbound) = ChannelTransport::channel();
        let (responses_tx, responses_rx) = smol::channel::unbounded();
        let mut config = config();
        config.monitoring.response_timeout_ms = 50;

        let mut node = MonitoringNode::new(
            &config,
            "m".into(),
            transport,
            responses_rx,
            "anna".into(),
        );
        let mut cluster = SimulatedCluster::new("anna", &config);
        let mut profile = NodeProfile::empty(Tier::Memory);
        profile.storage_per_thread = 100;
        let a = cluster.add_node(profile.clone()).unwrap();
        let b = cluster.add_node(profile).unwrap();
        cluster.deliver(&mut node, &outbound, &responses_tx).unwrap();
        assert_eq!(node.hash_rings().load().node_count(Tier::Memory), 2);

        let report = cluster.drive_epoch(&mut node, &outbound, &responses_tx).unwrap();
        assert_eq!(report.stats.summary.memory.total_consumption, 400);

        cluster.mute(&b);
        let report = cluster.drive_epoch(&mut node, &outbound, &responses_tx).unwrap();
        assert!(report.stats.missing > 0);
        assert!(report.stats.stale_nodes.contains(&(Tier::Memory, b)));
        // statistics of the silent node are excluded
        assert!(report.stats.summary.memory.node_count <= 1);
        assert!(cluster.nodes().contains_key(&a));
    }
}
