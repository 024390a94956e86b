//! Maintains the replication vector of every client key.
//!
//! A changed vector becomes effective only after every old and new owner of the key
//! acknowledged it. Until then, reads of [`ReplicationController::replication`] return the
//! previous vector.

use super::{
    elasticity::LATENCY_SCALE_UP_OCCUPANCY,
    requests::{metadata_destination, RequestBuilder},
    stats::ThreadStats,
    summary::required_nodes,
};
use crate::{
    config::Config,
    hash_ring::{tier_name, HashRings, KeyReplication},
    messages::{
        replication_factor::{ReplicationFactor, ReplicationFactorUpdate},
        Response, Tier,
    },
    metadata::MetadataKey,
    topics::{KvsThread, RoutingThread},
    ClientKey, ALL_TIERS,
};
use eyre::Context;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Constructs a replication vector from its four replica counts.
pub fn create_new_replication_vector(
    global_memory: usize,
    global_ebs: usize,
    local_memory: usize,
    local_ebs: usize,
) -> KeyReplication {
    KeyReplication::create_new(global_memory, global_ebs, local_memory, local_ebs)
}

/// The replication changes decided in one epoch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplicationPlan {
    /// New target vectors per key.
    pub requests: BTreeMap<ClientKey, KeyReplication>,
    /// Total node count per tier that blocked promotions or demotions would need.
    pub overflow: BTreeMap<Tier, usize>,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingUpdate {
    target: KeyReplication,
    /// Destination topic and whether it acknowledged `target`.
    destinations: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq)]
enum InFlight {
    Broadcast {
        destination: String,
        updates: Vec<(ClientKey, KeyReplication)>,
    },
    Persist {
        keys: Vec<ClientKey>,
    },
}

/// Decides and propagates replication changes.
#[derive(Debug)]
pub struct ReplicationController {
    default_global: HashMap<Tier, usize>,
    default_local: usize,
    minimum_replica_number: usize,
    key_promotion_threshold: usize,
    key_demotion_threshold: usize,
    enable_tiering: bool,
    enable_selective_rep: bool,
    enable_elasticity: bool,
    memory_thread_count: usize,
    max_consumption: HashMap<Tier, f64>,
    node_capacity: HashMap<Tier, u64>,
    slo_worst: f64,

    key_replication_map: HashMap<ClientKey, KeyReplication>,
    pending: BTreeMap<ClientKey, PendingUpdate>,
    in_flight: HashMap<String, InFlight>,
    committed: BTreeSet<ClientKey>,
}

impl ReplicationController {
    /// Creates a controller without any known keys.
    pub fn new(config: &Config) -> Self {
        let m = &config.monitoring;
        Self {
            default_global: [
                (Tier::Memory, config.replication.memory),
                (Tier::Disk, config.replication.ebs),
            ]
            .iter()
            .copied()
            .collect(),
            default_local: config.replication.local,
            minimum_replica_number: config.replication.minimum,
            key_promotion_threshold: m.key_promotion_threshold,
            key_demotion_threshold: m.key_demotion_threshold,
            enable_tiering: config.policy.tiering,
            enable_selective_rep: config.policy.selective_rep,
            enable_elasticity: config.policy.elasticity,
            memory_thread_count: config.threads.memory as usize,
            max_consumption: [
                (Tier::Memory, m.max_memory_consumption),
                (Tier::Disk, m.max_ebs_consumption),
            ]
            .iter()
            .copied()
            .collect(),
            node_capacity: [
                (Tier::Memory, config.capacities.memory_cap * 1_000_000),
                (Tier::Disk, config.capacities.ebs_cap * 1_000_000),
            ]
            .iter()
            .copied()
            .collect(),
            slo_worst: m.slo_worst_ms,
            key_replication_map: Default::default(),
            pending: Default::default(),
            in_flight: Default::default(),
            committed: Default::default(),
        }
    }

    /// Assigns the configured default vector to a key seen for the first time.
    pub fn init_replication(&mut self, key: ClientKey) {
        if !self.key_replication_map.contains_key(&key) {
            let vector = self.default_vector();
            self.key_replication_map.insert(key, vector);
        }
    }

    fn default_vector(&self) -> KeyReplication {
        create_new_replication_vector(
            self.default_global
                .get(&Tier::Memory)
                .copied()
                .unwrap_or_default(),
            self.default_global
                .get(&Tier::Disk)
                .copied()
                .unwrap_or_default(),
            self.default_local,
            self.default_local,
        )
    }

    /// The effective vector of `key`.
    pub fn replication(&self, key: &ClientKey) -> KeyReplication {
        self.key_replication_map
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.default_vector())
    }

    /// Returns true if a change of `key` waits for acknowledgements.
    pub fn is_pending(&self, key: &ClientKey) -> bool {
        self.pending.contains_key(key)
    }

    /// The vector that `key` will have once its pending update completes.
    pub fn pending_target(&self, key: &ClientKey) -> Option<&KeyReplication> {
        self.pending.get(key).map(|p| &p.target)
    }

    /// Derives the promotions, demotions and replica adjustments of this epoch.
    pub fn plan(&self, stats: &ThreadStats, node_counts: &HashMap<Tier, usize>) -> ReplicationPlan {
        let mut plan = ReplicationPlan::default();
        let node_count = |tier| node_counts.get(&tier).copied().unwrap_or_default();

        if self.enable_tiering {
            self.promote(stats, node_count(Tier::Memory), &mut plan);
            self.demote(stats, node_count(Tier::Disk), &mut plan);
        }
        if self.enable_selective_rep {
            self.dereplicate(stats, &mut plan);
        }
        self.hot_key_replication(stats, node_count(Tier::Memory), &mut plan);

        plan.requests
            .retain(|key, target| &self.replication(key) != target);
        plan
    }

    fn free_storage(&self, tier: Tier, nodes: usize, consumption: u64) -> u64 {
        let limit = self.max_consumption.get(&tier).copied().unwrap_or_default()
            * self.node_capacity.get(&tier).copied().unwrap_or_default() as f64
            * nodes as f64;
        (limit as u64).saturating_sub(consumption)
    }

    fn required_total(&self, tier: Tier, consumption: u64) -> usize {
        required_nodes(
            consumption,
            self.max_consumption.get(&tier).copied().unwrap_or_default(),
            self.node_capacity.get(&tier).copied().unwrap_or_default(),
        )
    }

    fn promote(&self, stats: &ThreadStats, memory_nodes: usize, plan: &mut ReplicationPlan) {
        let consumption = stats.summary.memory.total_consumption;
        let free_storage = self.free_storage(Tier::Memory, memory_nodes, consumption);
        let mut required_storage = 0;
        let mut overflow = false;
        let mut promoted = 0;

        for (key, &access_count) in &stats.key_access_summary {
            let current = self.replication(key);
            let slow = stats
                .feedback
                .latency_miss_ratio
                .get(key)
                .map(|&(ratio, _)| ratio > 1.)
                .unwrap_or(false);
            let size = match stats.key_size.get(key) {
                Some(&size) => size as u64,
                None => continue,
            };
            if (access_count > self.key_promotion_threshold || slow)
                && current.global(Tier::Memory) == 0
            {
                required_storage += size;
                if required_storage > free_storage {
                    overflow = true;
                } else {
                    promoted += 1;
                    plan.requests.insert(
                        key.clone(),
                        create_new_replication_vector(
                            usize::min(current.global(Tier::Memory) + 1, memory_nodes),
                            current.global(Tier::Disk).saturating_sub(1),
                            current.local(Tier::Memory),
                            current.local(Tier::Disk),
                        ),
                    );
                }
            }
        }

        if promoted > 0 {
            log::info!("Promoting {} keys into memory tier.", promoted);
        }
        if overflow && self.enable_elasticity {
            let needed = self.required_total(Tier::Memory, consumption + required_storage);
            if needed > memory_nodes {
                plan.overflow.insert(Tier::Memory, needed);
            }
        }
    }

    fn demote(&self, stats: &ThreadStats, ebs_nodes: usize, plan: &mut ReplicationPlan) {
        let consumption = stats.summary.ebs.total_consumption;
        let free_storage = self.free_storage(Tier::Disk, ebs_nodes, consumption);
        let mut required_storage = 0;
        let mut overflow = false;
        let mut demoted = 0;

        for (key, &access_count) in &stats.key_access_summary {
            let current = self.replication(key);
            let size = match stats.key_size.get(key) {
                Some(&size) => size as u64,
                None => continue,
            };
            if access_count <= self.key_demotion_threshold
                && current.global(Tier::Memory) > 0
                && !plan.requests.contains_key(key)
            {
                required_storage += size;
                if required_storage > free_storage {
                    overflow = true;
                } else {
                    demoted += 1;
                    plan.requests.insert(
                        key.clone(),
                        create_new_replication_vector(
                            0,
                            usize::max(self.minimum_replica_number, 1),
                            1,
                            1,
                        ),
                    );
                }
            }
        }

        if demoted > 0 {
            log::info!("Demoting {} keys into EBS tier.", demoted);
        }
        if overflow && self.enable_elasticity {
            let needed = self.required_total(Tier::Disk, consumption + required_storage);
            if needed > ebs_nodes {
                plan.overflow.insert(Tier::Disk, needed);
            }
        }
    }

    fn dereplicate(&self, stats: &ThreadStats, plan: &mut ReplicationPlan) {
        let mean = stats.summary.key_access_mean;
        for (key, &access_count) in &stats.key_access_summary {
            let current = self.replication(key);
            if access_count as f64 <= mean
                && current.global(Tier::Memory) > 1
                && !plan.requests.contains_key(key)
            {
                let target = create_new_replication_vector(
                    1,
                    self.minimum_replica_number.saturating_sub(1),
                    1,
                    1,
                );
                log::info!(
                    "Dereplication for key {}. M: {}->{}. E: {}->{}",
                    key,
                    current.global(Tier::Memory),
                    target.global(Tier::Memory),
                    current.global(Tier::Disk),
                    target.global(Tier::Disk)
                );
                plan.requests.insert(key.clone(), target);
            }
        }
    }

    fn hot_key_replication(
        &self,
        stats: &ThreadStats,
        memory_nodes: usize,
        plan: &mut ReplicationPlan,
    ) {
        let summary = &stats.summary;
        if summary.avg_latency <= self.slo_worst || !self.enable_selective_rep {
            return;
        }
        // elasticity answers the violation by adding nodes instead
        if self.enable_elasticity
            && summary.memory.min_occupancy.value() > LATENCY_SCALE_UP_OCCUPANCY
        {
            return;
        }

        let threshold = summary.key_access_mean + summary.key_access_std;
        for (key, &access_count) in &stats.key_access_summary {
            let miss_ratio = match stats.feedback.latency_miss_ratio.get(key) {
                Some(&(ratio, _)) if access_count as f64 > threshold => ratio,
                _ => continue,
            };
            let current = plan
                .requests
                .get(key)
                .cloned()
                .unwrap_or_else(|| self.replication(key));
            let current_mem_rep = current.global(Tier::Memory);

            let mut target_rep_factor = (current_mem_rep as f64 * miss_ratio) as usize;
            if target_rep_factor == current_mem_rep {
                target_rep_factor += 1;
            }

            if target_rep_factor > current_mem_rep && current_mem_rep < memory_nodes {
                let new_mem_rep = usize::min(memory_nodes, target_rep_factor);
                let target = create_new_replication_vector(
                    new_mem_rep,
                    self.minimum_replica_number.saturating_sub(new_mem_rep),
                    current.local(Tier::Memory),
                    current.local(Tier::Disk),
                );
                log::info!(
                    "Global hot key replication for key {}. M: {}->{}.",
                    key,
                    current_mem_rep,
                    new_mem_rep
                );
                plan.requests.insert(key.clone(), target);
            } else if self.memory_thread_count > current.local(Tier::Memory) {
                let target = create_new_replication_vector(
                    current_mem_rep,
                    current.global(Tier::Disk),
                    self.memory_thread_count,
                    current.local(Tier::Disk),
                );
                log::info!(
                    "Local hot key replication for key {}. T: {}->{}.",
                    key,
                    current.local(Tier::Memory),
                    self.memory_thread_count
                );
                plan.requests.insert(key.clone(), target);
            }
        }
    }

    /// Lowers every vector that uses all memory nodes by one memory replica.
    ///
    /// Used before a memory node is removed.
    pub fn cap_replication(&self, memory_nodes: usize) -> BTreeMap<ClientKey, KeyReplication> {
        let mut requests = BTreeMap::new();
        if memory_nodes == 0 {
            return requests;
        }
        for (key, current) in &self.key_replication_map {
            let current = self
                .pending_target(key)
                .cloned()
                .unwrap_or_else(|| current.clone());
            if current.global(Tier::Memory) == memory_nodes {
                let new_mem_rep = memory_nodes - 1;
                let target = create_new_replication_vector(
                    new_mem_rep,
                    usize::max(
                        current.global(Tier::Disk),
                        self.minimum_replica_number.saturating_sub(new_mem_rep),
                    ),
                    current.local(Tier::Memory),
                    current.local(Tier::Disk),
                );
                log::info!(
                    "Dereplication for key {}. M: {}->{}. E: {}->{}",
                    key,
                    current.global(Tier::Memory),
                    target.global(Tier::Memory),
                    current.global(Tier::Disk),
                    target.global(Tier::Disk)
                );
                requests.insert(key.clone(), target);
            }
        }
        requests
    }

    /// Starts propagating `target` as the new vector of `key`.
    ///
    /// The update is addressed to every node that owns the key under the current or the
    /// target vector, plus all routing nodes. A newer target replaces a pending one.
    /// Returns false if nothing changes.
    pub fn begin_update(
        &mut self,
        key: ClientKey,
        target: KeyReplication,
        rings: &HashRings,
        routing_node_ids: &BTreeSet<String>,
        prefix: &str,
    ) -> bool {
        if self.pending_target(&key) == Some(&target) {
            return false;
        }
        let current = self.replication(&key);
        if current == target {
            // a pending change is reverted by restoring the current vector
            return self.pending.remove(&key).is_some();
        }

        let destinations = self
            .update_destinations(&key, &target, rings, routing_node_ids, prefix)
            .into_iter()
            .map(|destination| (destination, false))
            .collect::<BTreeMap<_, _>>();

        if destinations.is_empty() {
            self.commit(key, target);
        } else {
            self.pending.insert(
                key,
                PendingUpdate {
                    target,
                    destinations,
                },
            );
        }
        true
    }

    /// The topics that must acknowledge `target` before it replaces the current vector
    /// of `key`.
    fn update_destinations(
        &self,
        key: &ClientKey,
        target: &KeyReplication,
        rings: &HashRings,
        routing_node_ids: &BTreeSet<String>,
        prefix: &str,
    ) -> BTreeSet<String> {
        let current = self.replication(key);
        let mut destinations = BTreeSet::new();
        for vector in [&current, target].iter() {
            for node in rings.key_owners(key, vector) {
                destinations.insert(KvsThread::new(node, 0).replication_change_topic(prefix));
            }
        }
        for routing_node in routing_node_ids {
            destinations.insert(
                RoutingThread::new(routing_node.clone(), 0).replication_change_topic(prefix),
            );
        }
        destinations
    }

    /// Aligns the destinations of every pending update with the current membership.
    ///
    /// Departed owners no longer need to acknowledge and new owners are added. Updates whose
    /// remaining destinations all acknowledged are committed.
    fn refresh_destinations(
        &mut self,
        rings: &HashRings,
        routing_node_ids: &BTreeSet<String>,
        prefix: &str,
    ) {
        let live: Vec<(ClientKey, BTreeSet<String>)> = self
            .pending
            .iter()
            .map(|(key, update)| {
                let destinations =
                    self.update_destinations(key, &update.target, rings, routing_node_ids, prefix);
                (key.clone(), destinations)
            })
            .collect();

        let mut complete = Vec::new();
        for (key, live) in live {
            let update = match self.pending.get_mut(&key) {
                Some(update) => update,
                None => continue,
            };
            update.destinations.retain(|destination, acked| {
                let owner = live.contains(destination);
                if !owner && !*acked {
                    log::info!(
                        "`{}` left before acknowledging the replication of key {}.",
                        destination,
                        key
                    );
                }
                owner
            });
            for destination in live {
                update.destinations.entry(destination).or_insert(false);
            }
            if update.destinations.values().all(|&acked| acked) {
                complete.push(key);
            }
        }
        for key in complete {
            if let Some(update) = self.pending.remove(&key) {
                self.commit(key, update.target);
            }
        }
    }

    fn commit(&mut self, key: ClientKey, target: KeyReplication) {
        log::info!(
            "Replication of key {} is now M: {}/{}, E: {}/{}.",
            key,
            target.global(Tier::Memory),
            target.local(Tier::Memory),
            target.global(Tier::Disk),
            target.local(Tier::Disk)
        );
        self.key_replication_map.insert(key.clone(), target);
        self.committed.insert(key);
    }

    /// Creates the messages of this epoch: one update per destination that has not yet
    /// acknowledged, and metadata PUTs for newly committed vectors.
    ///
    /// Destinations are first re-derived from `rings` and `routing_node_ids`, so an owner
    /// that left the cluster does not block its update forever.
    ///
    /// Returns `(topic, payload)` pairs.
    pub fn outbound(
        &mut self,
        builder: &mut RequestBuilder,
        response_topic: &str,
        rings: &HashRings,
        routing_node_ids: &BTreeSet<String>,
        local_replication: usize,
        prefix: &str,
    ) -> eyre::Result<Vec<(String, String)>> {
        self.refresh_destinations(rings, routing_node_ids, prefix);
        let mut messages = Vec::new();

        let mut per_destination: BTreeMap<&String, Vec<(ClientKey, KeyReplication)>> =
            BTreeMap::new();
        for (key, update) in &self.pending {
            for (destination, _) in update.destinations.iter().filter(|(_, &acked)| !acked) {
                per_destination
                    .entry(destination)
                    .or_default()
                    .push((key.clone(), update.target.clone()));
            }
        }

        let resent: BTreeSet<String> = per_destination.keys().map(|&d| d.clone()).collect();
        let mut in_flight = Vec::new();
        for (destination, updates) in per_destination {
            let request_id = builder.next_request_id();
            let message = ReplicationFactorUpdate {
                request_id: Some(request_id.clone()),
                response_address: Some(response_topic.to_owned()),
                updates: updates
                    .iter()
                    .map(|(key, target)| ReplicationFactor::new(key.clone(), target))
                    .collect(),
            };
            messages.push((
                destination.clone(),
                serde_json::to_string(&message)
                    .context("failed to serialize ReplicationFactorUpdate")?,
            ));
            in_flight.push((
                request_id,
                InFlight::Broadcast {
                    destination: destination.clone(),
                    updates,
                },
            ));
        }

        // write committed vectors to the metadata namespace
        let mut persisted = Vec::new();
        for key in &self.committed {
            let replication_key = MetadataKey::Replication { key: key.clone() };
            let destination =
                match metadata_destination(rings, &replication_key, local_replication, prefix) {
                    Some(destination) => destination,
                    None => continue,
                };
            let value = serde_json::to_vec(&ReplicationFactor::new(
                key.clone(),
                &self.replication(key),
            ))
            .context("failed to serialize ReplicationFactor")?;
            builder.prepare_metadata_put_request(&replication_key, value, destination);
            persisted.push(key.clone());
        }
        for key in &persisted {
            self.committed.remove(key);
        }
        for (destination, request) in builder.take_requests() {
            let keys = request
                .request
                .keys()
                .into_iter()
                .filter_map(|key| match key {
                    crate::Key::Metadata(MetadataKey::Replication { key }) => Some(key.clone()),
                    _ => None,
                })
                .collect();
            if let Some(request_id) = request.request_id.clone() {
                in_flight.push((request_id, InFlight::Persist { keys }));
            }
            messages.push((
                destination,
                serde_json::to_string(&request).context("failed to serialize Request")?,
            ));
        }

        // drop broadcasts that were resent or no longer wait for an acknowledgement
        let pending = &self.pending;
        self.in_flight.retain(|_, entry| match entry {
            InFlight::Broadcast {
                destination,
                updates,
            } => {
                !resent.contains(destination.as_str())
                    && updates.iter().any(|(key, target)| {
                        pending
                            .get(key)
                            .filter(|p| &p.target == target)
                            .and_then(|p| p.destinations.get(destination.as_str()))
                            == Some(&false)
                    })
            }
            InFlight::Persist { .. } => false,
        });
        self.in_flight.extend(in_flight);

        Ok(messages)
    }

    /// Matches an acknowledgement with a sent update.
    ///
    /// Returns false if the response id is unknown, e.g. for duplicates.
    pub fn acknowledge(&mut self, response: &Response) -> bool {
        let entry = match response
            .response_id
            .as_ref()
            .and_then(|id| self.in_flight.remove(id))
        {
            Some(entry) => entry,
            None => return false,
        };

        match entry {
            InFlight::Broadcast {
                destination,
                updates,
            } => {
                if let Err(error) = response.error {
                    log::warn!(
                        "Replication update to `{}` failed: {}. It will be retried.",
                        destination,
                        error
                    );
                    return true;
                }
                for (key, target) in updates {
                    let complete = match self.pending.get_mut(&key) {
                        Some(update) if update.target == target => {
                            if let Some(acked) = update.destinations.get_mut(&destination) {
                                *acked = true;
                            }
                            update.destinations.values().all(|&acked| acked)
                        }
                        _ => false,
                    };
                    if complete {
                        self.pending.remove(&key);
                        self.commit(key, target);
                    }
                }
            }
            InFlight::Persist { keys } => {
                let failed = response.error.is_err()
                    || response.tuples.iter().any(|tuple| tuple.error.is_some());
                if failed {
                    log::warn!(
                        "Failed to store the replication metadata of {} key(s).",
                        keys.len()
                    );
                }
            }
        }
        true
    }

    /// Logs the number of pending updates per tier.
    pub fn log_pending(&self) {
        if self.pending.is_empty() {
            return;
        }
        for &tier in ALL_TIERS {
            let count = self
                .pending
                .values()
                .filter(|p| p.target.global(tier) > 0)
                .count();
            log::debug!(
                "{} pending replication update(s) involve tier {}.",
                count,
                tier_name(tier)
            );
        }
        log::info!(
            "{} replication update(s) wait for acknowledgements.",
            self.pending.len()
        );
    }
}
