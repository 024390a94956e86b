//! Monitoring nodes observe and react to key access patterns and node statistics.

pub use self::{
    elasticity::{ElasticityCommand, ElasticityController, ElasticityState},
    replication::{create_new_replication_vector, ReplicationController, ReplicationPlan},
    stats::{FeedbackStats, ThreadStats},
    summary::{Aggregator, SummaryStats, TierSummary, TrackedMin},
};

use self::{
    elasticity::ElasticityInput,
    requests::{metadata_destination, PendingRequests, RequestBuilder},
};
use crate::{
    config::{Config, Monitoring},
    hash_ring::{tier_name, HashRings, KeyReplication, SharedHashRings},
    messages::{management::AddNodes, SelfDepart, Tier},
    metadata::{KvsMetadataKind, MetadataKey, TierMetadata},
    topics::{KvsThread, ManagementThread, MonitoringThread},
    transport::Transport,
    ClientKey, ALL_TIERS,
};
use eyre::Context;
use futures::StreamExt;
use smol::{channel::Receiver, Timer};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Instant,
};

pub mod elasticity;
pub mod replication;
pub mod requests;
pub mod stats;
pub mod summary;

mod handlers;

/// Configuration options relevant to a monitor node.
#[derive(Debug, Clone)]
pub struct ConfigData {
    memory_thread_count: u32,
    ebs_thread_count: u32,
    tier_metadata: HashMap<Tier, TierMetadata>,
    default_local_replication: usize,
    monitoring: Monitoring,
}

impl ConfigData {
    /// Extracts the monitoring-relevant parts of `config`.
    pub fn new(config: &Config) -> Self {
        let mut tier_metadata = HashMap::new();
        tier_metadata.insert(
            Tier::Memory,
            TierMetadata {
                thread_number: config.threads.memory,
                default_replication: config.replication.memory,
                node_capacity: config.capacities.memory_cap * 1000000,
            },
        );
        tier_metadata.insert(
            Tier::Disk,
            TierMetadata {
                thread_number: config.threads.ebs,
                default_replication: config.replication.ebs,
                node_capacity: config.capacities.ebs_cap * 1000000,
            },
        );

        Self {
            memory_thread_count: config.threads.memory,
            ebs_thread_count: config.threads.ebs,
            tier_metadata,
            default_local_replication: config.replication.local,
            monitoring: config.monitoring.clone(),
        }
    }

    fn thread_count(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Memory => self.memory_thread_count,
            Tier::Disk => self.ebs_thread_count,
            Tier::Routing => 0,
        }
    }
}

/// The outcome of one [`MonitoringNode::run_epoch`] call.
#[derive(Debug)]
pub struct EpochReport {
    /// The number of the epoch.
    pub epoch: usize,
    /// The collected statistics and their summary, immutable after aggregation.
    pub stats: Arc<ThreadStats>,
    /// The scale actions issued in this epoch.
    pub commands: Vec<ElasticityCommand>,
    /// The replication changes decided in this epoch.
    pub replication_requests: BTreeMap<ClientKey, KeyReplication>,
}

/// A message received between epochs.
enum Inbound {
    Notify(String),
    DepartDone(String),
    Feedback(String),
}

/// Creates periodical statistics about running nodes and executes enabled policy mechanisms.
pub struct MonitoringNode<T> {
    config_data: ConfigData,

    mt: MonitoringThread,
    management_node: ManagementThread,

    transport: T,
    prefix: String,
    responses: Receiver<String>,

    hash_rings: SharedHashRings,
    routing_node_ids: BTreeSet<String>,
    feedback: FeedbackStats,

    elasticity: ElasticityController,
    replication: ReplicationController,
    aggregator: Aggregator,

    server_monitoring_epoch: usize,
}

impl<T: Transport> MonitoringNode<T> {
    /// Creates a monitoring node with empty hash rings.
    ///
    /// Outbound messages are handed to `transport`; responses to the node's requests must be
    /// delivered on `responses`.
    pub fn new(
        config: &Config,
        node_id: String,
        transport: T,
        responses: Receiver<String>,
        prefix: String,
    ) -> Self {
        let config_data = ConfigData::new(config);
        let thread_counts: HashMap<_, _> = ALL_TIERS
            .iter()
            .map(|&tier| (tier, config_data.thread_count(tier)))
            .collect();

        MonitoringNode {
            mt: MonitoringThread { node_id },
            management_node: ManagementThread::singleton(),
            transport,
            prefix,
            responses,
            hash_rings: SharedHashRings::new(HashRings::new(thread_counts.clone())),
            routing_node_ids: Default::default(),
            feedback: Default::default(),
            elasticity: ElasticityController::new(
                &config.monitoring,
                &config.policy,
                &thread_counts,
            ),
            replication: ReplicationController::new(config),
            aggregator: Aggregator {
                max_memory_consumption: config.monitoring.max_memory_consumption,
                max_ebs_consumption: config.monitoring.max_ebs_consumption,
            },
            server_monitoring_epoch: 0,
            config_data,
        }
    }

    /// The addressing information of this node.
    pub fn thread(&self) -> &MonitoringThread {
        &self.mt
    }

    /// The topic on which this node expects responses and acknowledgements.
    pub fn response_topic(&self) -> String {
        self.mt.response_topic(&self.prefix)
    }

    /// The topic on which departing nodes acknowledge their departure.
    pub fn depart_done_topic(&self) -> String {
        self.mt.depart_done_topic(&self.prefix)
    }

    /// A handle to the published ring snapshots.
    pub fn hash_rings(&self) -> SharedHashRings {
        self.hash_rings.clone()
    }

    /// The known routing nodes.
    pub fn routing_node_ids(&self) -> &BTreeSet<String> {
        &self.routing_node_ids
    }

    /// The state of the scale actions.
    pub fn elasticity(&self) -> &ElasticityController {
        &self.elasticity
    }

    /// The replication vectors of all known keys.
    pub fn replication(&self) -> &ReplicationController {
        &self.replication
    }

    /// Hands a message to the transport. Failures are logged and reported as `false`.
    fn send(&self, topic: &str, payload: String) -> bool {
        match self.transport.send(topic, payload) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Failed to send message on `{}`: {:?}", topic, err);
                false
            }
        }
    }

    /// Multiplexes the inbound message streams and runs one epoch per epoch tick.
    ///
    /// Returns when all message streams closed, or with an error when the response channel
    /// closed.
    pub async fn run(
        mut self,
        notify: Receiver<String>,
        depart_done: Receiver<String>,
        feedback: Receiver<String>,
    ) -> eyre::Result<()> {
        let mut inbound = futures::stream::select_all(vec![
            // responsible for both node join and departure
            notify.map(Inbound::Notify).boxed(),
            // responsible for receiving depart done notice
            depart_done.map(Inbound::DepartDone).boxed(),
            // responsible for receiving feedback from users
            feedback.map(Inbound::Feedback).boxed(),
        ])
        .fuse();

        let mut epoch_timer = Timer::interval(self.config_data.monitoring.epoch()).fuse();

        loop {
            futures::select! {
                message = inbound.next() => match message {
                    Some(Inbound::Notify(serialized)) => {
                        if let Err(err) = self.membership_handler(&serialized) {
                            log::warn!("Notify handler failed: {:?}", err);
                        }
                    }
                    Some(Inbound::DepartDone(serialized)) => {
                        if let Err(err) = self.depart_done_handler(&serialized) {
                            log::warn!("Depart done handler failed: {:?}", err);
                        }
                    }
                    Some(Inbound::Feedback(serialized)) => {
                        if let Err(err) = self.feedback_handler(&serialized) {
                            log::warn!("Feedback handler failed: {:?}", err);
                        }
                    }
                    None => break,
                },
                _ = epoch_timer.select_next_some() => {
                    if let Err(err) = self.run_epoch(Instant::now()).await {
                        if self.responses.is_closed() {
                            return Err(err);
                        }
                        log::error!("Monitoring epoch failed: {:?}", err);
                    }
                }
            }
        }

        log::info!("monitor task is finished");

        Ok(())
    }

    /// Runs one monitoring epoch.
    ///
    /// Queries the statistics of every known node thread, waits for the responses until the
    /// response timeout after `now`, aggregates them and executes the resulting scale and
    /// replication actions. The actions are not awaited; their effect shows in later epochs.
    pub async fn run_epoch(&mut self, now: Instant) -> eyre::Result<EpochReport> {
        self.server_monitoring_epoch += 1;
        let epoch = self.server_monitoring_epoch;
        let rings = self.hash_rings.load();
        let response_topic = self.response_topic();

        let mut builder = RequestBuilder::new(response_topic.clone(), epoch);
        let mut stats = ThreadStats::new(epoch);

        self.prepare_stats_requests(&rings, &mut builder);
        let mut pending =
            PendingRequests::new(now + self.config_data.monitoring.response_timeout());
        for (destination, request) in builder.take_requests() {
            let payload = serde_json::to_string(&request).context("failed to serialize Request")?;
            if self.send(&destination, payload) {
                pending.track(&destination, &request, now);
            } else {
                let keys: Vec<_> = request.request.keys().into_iter().cloned().collect();
                stats.mark_missing(&keys);
            }
        }

        let unclaimed = stats::collect(&self.responses, &mut pending, &mut stats)
            .await
            .context("failed to collect statistics")?;
        for response in unclaimed {
            if !self.replication.acknowledge(&response) {
                log::warn!(
                    "Ignoring response with unknown id {:?}.",
                    response.response_id
                );
            }
        }
        for request in pending.into_expired() {
            log::warn!(
                "No response from {} in monitoring epoch {}.",
                request.destination,
                epoch
            );
            stats.mark_missing(&request.keys);
        }

        stats.feedback = std::mem::take(&mut self.feedback);
        stats.compute_summary(&self.aggregator, &self.config_data.tier_metadata);
        stats.summary.log();

        // initialize replication factor for new keys
        for key in stats.key_access_summary.keys() {
            self.replication.init_replication(key.clone());
        }

        let node_counts: HashMap<_, _> = ALL_TIERS
            .iter()
            .map(|&tier| (tier, rings.node_count(tier)))
            .collect();
        let plan = self.replication.plan(&stats, &node_counts);
        let commands = self.elasticity.evaluate(ElasticityInput {
            now,
            summary: &stats.summary,
            node_counts: &node_counts,
            overflow: &plan.overflow,
        });

        let mut replication_requests = plan.requests;
        for command in &commands {
            self.execute(command, &rings, &mut replication_requests)?;
        }

        for (key, target) in &replication_requests {
            self.replication.begin_update(
                key.clone(),
                target.clone(),
                &rings,
                &self.routing_node_ids,
                &self.prefix,
            );
        }
        let messages = self.replication.outbound(
            &mut builder,
            &response_topic,
            &rings,
            &self.routing_node_ids,
            self.config_data.default_local_replication,
            &self.prefix,
        )?;
        for (topic, payload) in messages {
            self.send(&topic, payload);
        }
        self.replication.log_pending();

        Ok(EpochReport {
            epoch,
            stats: Arc::new(stats),
            commands,
            replication_requests,
        })
    }

    fn prepare_stats_requests(&self, rings: &HashRings, builder: &mut RequestBuilder) {
        for &tier in ALL_TIERS {
            let ring = match rings.global(tier) {
                Some(ring) => ring,
                None => continue,
            };
            for node in ring.sorted_nodes() {
                for thread_id in 0..self.config_data.thread_count(tier) {
                    let kvs_thread = KvsThread::new(node.clone(), thread_id);
                    for &kind in KvsMetadataKind::ALL {
                        let key = MetadataKey::KvsThread {
                            tier,
                            kvs_thread: kvs_thread.clone(),
                            kind,
                        };
                        match metadata_destination(
                            rings,
                            &key,
                            self.config_data.default_local_replication,
                            &self.prefix,
                        ) {
                            Some(destination) => {
                                builder.prepare_metadata_get_request(&key, destination)
                            }
                            None => {
                                log::warn!("No memory nodes to read statistics from.");
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn execute(
        &mut self,
        command: &ElasticityCommand,
        rings: &HashRings,
        replication_requests: &mut BTreeMap<ClientKey, KeyReplication>,
    ) -> eyre::Result<()> {
        match command {
            &ElasticityCommand::AddNodes { tier, number } => {
                log::info!("Adding {} node(s) in tier {}.", number, tier_name(tier));

                let payload = serde_json::to_string(&AddNodes { number, tier })
                    .context("failed to serialize AddNodes")?;
                let ok = self.send(&self.management_node.add_nodes_topic(&self.prefix), payload);
                self.elasticity.dispatched(tier, ok);
            }
            ElasticityCommand::RemoveNode { tier, node, .. } => {
                let tier = *tier;
                if tier == Tier::Memory {
                    let memory_nodes = rings.node_count(Tier::Memory);
                    replication_requests.extend(self.replication.cap_replication(memory_nodes));
                    // no vector may exceed the remaining nodes
                    for target in replication_requests.values_mut() {
                        if let Some(global) = target.global_replication.get_mut(&Tier::Memory) {
                            if *global >= memory_nodes {
                                *global = memory_nodes.saturating_sub(1);
                            }
                        }
                    }
                }

                log::info!("Removing node {} from tier {}.", node, tier_name(tier));

                let payload = serde_json::to_string(&SelfDepart {
                    response_topic: self.mt.depart_done_topic(&self.prefix),
                })
                .context("failed to serialize SelfDepart")?;
                let topic = KvsThread::new(node.clone(), 0).self_depart_topic(&self.prefix);
                let ok = self.send(&topic, payload);
                self.elasticity.dispatched(tier, ok);
            }
        }
        Ok(())
    }
}
