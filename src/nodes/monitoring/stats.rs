//! Collects the statistics of one monitoring epoch.
//!
//! Responses to the epoch's metadata requests are matched by id until the deadline. Server
//! statistics, key access counts and key sizes are recorded per thread, and nodes with
//! missing or malformed data are left out of the epoch's summary.

use super::{
    requests::PendingRequests,
    summary::{Aggregator, SummaryStats, TierSummary, TrackedMin},
};
use crate::{
    messages::{
        key_data::{KeyAccessData, KeySizeData},
        response::ResponseTuple,
        user_feedback::{KeyLatency, ServerThreadStatistics, UserFeedback},
        Response, Tier,
    },
    metadata::{KvsMetadataKind, MetadataKey, TierMetadata},
    topics::{KvsThread, NodeAddress},
    ClientKey, Key,
};
use eyre::bail;
use smol::{channel::Receiver, Timer};
use std::collections::{hash_map, BTreeMap, BTreeSet, HashMap};

/// Raw per-thread records of one storage tier.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TierUsage {
    /// Consumed bytes per node and thread.
    pub storage: BTreeMap<NodeAddress, BTreeMap<u32, u64>>,
    /// Occupancy and reporting epoch per node and thread.
    pub occupancy: BTreeMap<NodeAddress, BTreeMap<u32, (f64, usize)>>,
    /// Served key accesses per node and thread.
    pub accesses: BTreeMap<NodeAddress, BTreeMap<u32, usize>>,
}

impl TierUsage {
    fn remove_node(&mut self, node: &NodeAddress) {
        self.storage.remove(node);
        self.occupancy.remove(node);
        self.accesses.remove(node);
    }
}

/// Client-reported latency and throughput.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeedbackStats {
    /// Latest latency per client.
    pub user_latency: HashMap<String, f64>,
    /// Latest throughput per client.
    pub user_throughput: HashMap<String, f64>,
    /// Running mean of `observed latency / slo` and the number of samples, per key.
    pub latency_miss_ratio: HashMap<ClientKey, (f64, usize)>,
}

impl FeedbackStats {
    /// Records one feedback message.
    ///
    /// Warm-up feedback is ignored and a finished client is forgotten.
    pub fn record(&mut self, feedback: UserFeedback, slo_worst: f64) {
        if feedback.warmup {
            return;
        }
        if feedback.finish {
            self.user_latency.remove(&feedback.uid);
            self.user_throughput.remove(&feedback.uid);
            return;
        }

        self.user_latency
            .insert(feedback.uid.clone(), feedback.latency);
        self.user_throughput
            .insert(feedback.uid, feedback.throughput);

        for KeyLatency { key, latency } in feedback.key_latency {
            let ratio = if slo_worst > 0. { latency / slo_worst } else { 0. };
            match self.latency_miss_ratio.entry(key) {
                hash_map::Entry::Occupied(mut entry) => {
                    let (mean, samples) = entry.get_mut();
                    *mean = (*mean * *samples as f64 + ratio) / (*samples + 1) as f64;
                    *samples += 1;
                }
                hash_map::Entry::Vacant(entry) => {
                    entry.insert((ratio, 1));
                }
            }
        }
    }
}

/// Everything the monitoring node learns during one epoch.
///
/// Filled by [`collect`], then frozen by [`ThreadStats::compute_summary`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ThreadStats {
    /// The monitoring epoch the statistics belong to.
    pub epoch: usize,
    /// Access counts of every client key, per reporting thread.
    pub key_access_frequency: HashMap<ClientKey, HashMap<KvsThread, usize>>,
    /// Total access count of every client key.
    pub key_access_summary: BTreeMap<ClientKey, usize>,
    /// The reported size of client keys in bytes.
    pub key_size: HashMap<ClientKey, usize>,
    /// Raw per-thread records of the memory tier.
    pub memory: TierUsage,
    /// Raw per-thread records of the disk tier.
    pub ebs: TierUsage,
    /// The aggregated snapshot.
    pub summary: SummaryStats,
    /// Client feedback received since the previous epoch.
    pub feedback: FeedbackStats,
    /// Number of dropped responses or values that could not be parsed.
    pub malformed: usize,
    /// Number of metadata keys that were requested but not delivered.
    pub missing: usize,
    /// Nodes whose statistics are incomplete and which are excluded from the summary.
    pub stale_nodes: BTreeSet<(Tier, NodeAddress)>,
}

impl ThreadStats {
    /// Creates empty statistics for the given epoch.
    pub fn new(epoch: usize) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }

    /// The raw records of the given storage tier.
    pub fn tier_usage(&self, tier: Tier) -> Option<&TierUsage> {
        match tier {
            Tier::Memory => Some(&self.memory),
            Tier::Disk => Some(&self.ebs),
            Tier::Routing => None,
        }
    }

    fn tier_usage_mut(&mut self, tier: Tier) -> Option<&mut TierUsage> {
        match tier {
            Tier::Memory => Some(&mut self.memory),
            Tier::Disk => Some(&mut self.ebs),
            Tier::Routing => None,
        }
    }

    /// Records all tuples of a matched response.
    pub fn record_response(&mut self, response: &Response) {
        for tuple in &response.tuples {
            self.record_response_tuple(tuple);
        }
    }

    /// Parses the value of the given tuple and folds it into the raw records.
    ///
    /// A tuple carrying an error counts as missing data, an unparseable tuple as malformed.
    pub fn record_response_tuple(&mut self, tuple: &ResponseTuple) {
        let (tier, kvs_thread, kind) = match &tuple.key {
            Key::Metadata(MetadataKey::KvsThread {
                tier,
                kvs_thread,
                kind,
            }) => (*tier, kvs_thread.clone(), *kind),
            other => {
                log::warn!("Dropping response tuple with unexpected key {:?}.", other);
                self.malformed += 1;
                return;
            }
        };

        if let Some(error) = tuple.error {
            log::warn!(
                "Metadata {:?} of {} thread {} is unavailable: {}",
                kind,
                kvs_thread.node,
                kvs_thread.thread_id,
                error
            );
            self.mark_missing(std::slice::from_ref(&tuple.key));
            return;
        }
        if self.stale_nodes.contains(&(tier, kvs_thread.node.clone())) {
            return;
        }

        let value = match &tuple.value {
            Some(value) => value,
            None => {
                log::warn!("Dropping response tuple without value for {:?}.", tuple.key);
                self.malformed += 1;
                return;
            }
        };

        let result = match kind {
            KvsMetadataKind::ServerStats => {
                serde_json::from_slice::<ServerThreadStatistics>(value)
                    .map(|stat| self.record_server_stats(tier, kvs_thread, stat))
            }
            KvsMetadataKind::KeyAccess => serde_json::from_slice::<KeyAccessData>(value)
                .map(|access| self.record_key_access(kvs_thread, access)),
            KvsMetadataKind::KeySize => serde_json::from_slice::<KeySizeData>(value)
                .map(|sizes| self.record_key_sizes(sizes)),
        };
        if let Err(err) = result {
            log::warn!("Dropping malformed {:?} value: {}", kind, err);
            self.malformed += 1;
        }
    }

    fn record_server_stats(
        &mut self,
        tier: Tier,
        thread: KvsThread,
        stat: ServerThreadStatistics,
    ) {
        let usage = match self.tier_usage_mut(tier) {
            Some(usage) => usage,
            None => {
                log::warn!("Ignoring server statistics of routing thread {:?}.", thread);
                return;
            }
        };
        usage
            .storage
            .entry(thread.node.clone())
            .or_default()
            .insert(thread.thread_id, stat.storage_consumption);
        usage
            .occupancy
            .entry(thread.node.clone())
            .or_default()
            .insert(thread.thread_id, (stat.occupancy, stat.epoch));
        usage
            .accesses
            .entry(thread.node)
            .or_default()
            .insert(thread.thread_id, stat.access_count);
    }

    fn record_key_access(&mut self, thread: KvsThread, access: KeyAccessData) {
        for key_count in access.keys {
            if let Key::Client(key) = key_count.key {
                self.key_access_frequency
                    .entry(key)
                    .or_default()
                    .insert(thread.clone(), key_count.access_count);
            }
        }
    }

    fn record_key_sizes(&mut self, sizes: KeySizeData) {
        for key_size in sizes.key_sizes {
            self.key_size.insert(key_size.key, key_size.size);
        }
    }

    /// Marks the nodes that the given metadata keys describe as stale.
    pub fn mark_missing(&mut self, keys: &[Key]) {
        for key in keys {
            self.missing += 1;
            if let Key::Metadata(MetadataKey::KvsThread {
                tier, kvs_thread, ..
            }) = key
            {
                self.mark_stale(*tier, &kvs_thread.node);
            }
        }
    }

    /// Excludes the given node from this epoch's summary.
    pub fn mark_stale(&mut self, tier: Tier, node: &NodeAddress) {
        if self.stale_nodes.insert((tier, node.clone())) {
            log::warn!(
                "Statistics of node {} are incomplete in epoch {}.",
                node,
                self.epoch
            );
        }
        if let Some(usage) = self.tier_usage_mut(tier) {
            usage.remove_node(node);
        }
        for access in self.key_access_frequency.values_mut() {
            access.retain(|thread, _| &thread.node != node);
        }
    }

    /// Builds one operand per reporting node, one for key accesses and one for client
    /// feedback, and folds them into [`Self::summary`].
    pub fn compute_summary(
        &mut self,
        aggregator: &Aggregator,
        tier_metadata: &HashMap<Tier, TierMetadata>,
    ) -> &SummaryStats {
        let capacity = |tier| {
            tier_metadata
                .get(&tier)
                .map(|meta| meta.node_capacity)
                .unwrap_or_default()
        };
        let base = SummaryStats {
            memory: TierSummary {
                node_capacity: capacity(Tier::Memory),
                ..Default::default()
            },
            ebs: TierSummary {
                node_capacity: capacity(Tier::Disk),
                ..Default::default()
            },
            ..Default::default()
        };

        self.key_access_summary = self
            .key_access_frequency
            .iter()
            .map(|(key, access)| (key.clone(), access.values().sum()))
            .collect();

        let mut operands = vec![self.key_access_operand(&base)];
        operands.extend(self.node_operands(Tier::Memory, &base));
        operands.extend(self.node_operands(Tier::Disk, &base));
        operands.push(self.feedback_operand(&base));

        self.summary = aggregator.fold(&operands);
        &self.summary
    }

    fn key_access_operand(&self, base: &SummaryStats) -> SummaryStats {
        let mut cnt = 0;
        let mut mean = 0.0;
        let mut ms = 0.0;

        for &access_count in self.key_access_summary.values() {
            if access_count > 0 {
                cnt += 1;

                let delta = access_count as f64 - mean;
                mean += delta / cnt as f64;

                let delta2 = access_count as f64 - mean;
                ms += delta * delta2;
            }
        }

        SummaryStats {
            key_access_cnt: cnt,
            key_access_mean: mean,
            key_access_std: if cnt > 0 { (ms / cnt as f64).sqrt() } else { 0. },
            ..base.clone()
        }
    }

    fn node_operands(&self, tier: Tier, base: &SummaryStats) -> Vec<SummaryStats> {
        let (usage, capacity) = match tier {
            Tier::Memory => (&self.memory, base.memory.node_capacity),
            Tier::Disk => (&self.ebs, base.ebs.node_capacity),
            Tier::Routing => return Vec::new(),
        };

        let mut operands = Vec::new();
        for (node, storage) in &usage.storage {
            let consumption: u64 = storage.values().sum();
            let threads = usage.occupancy.get(node);
            let occupancy = threads
                .filter(|t| !t.is_empty())
                .map(|t| t.values().map(|(occ, _)| occ).sum::<f64>() / t.len() as f64)
                .unwrap_or_default();
            let total_access = usage
                .accesses
                .get(node)
                .map(|a| a.values().sum())
                .unwrap_or_default();
            let percentage = if capacity > 0 {
                consumption as f64 / capacity as f64
            } else {
                0.
            };

            log::debug!(
                "{:?} node {} storage consumption is {}, occupancy is {} (monitoring epoch {}).",
                tier,
                node,
                percentage,
                occupancy,
                self.epoch
            );

            let summary = TierSummary {
                node_count: 1,
                total_access,
                total_consumption: consumption,
                max_consumption_percentage: percentage,
                avg_consumption_percentage: percentage,
                node_capacity: capacity,
                max_occupancy: occupancy,
                min_occupancy: TrackedMin::observed(occupancy, node.clone()),
                avg_occupancy: occupancy,
                sum_occupancy: occupancy,
                cnt_occupancy: 1,
                required_nodes: 0,
            };
            let mut operand = base.clone();
            match tier {
                Tier::Memory => operand.memory = summary,
                _ => operand.ebs = summary,
            }
            operands.push(operand);
        }
        operands
    }

    fn feedback_operand(&self, base: &SummaryStats) -> SummaryStats {
        SummaryStats {
            sum_latency: self.feedback.user_latency.values().sum(),
            cnt_latency: self.feedback.user_latency.len(),
            total_throughput: self.feedback.user_throughput.values().sum(),
            ..base.clone()
        }
    }
}

/// Receives responses until all pending requests are answered or their deadline passes.
///
/// Matched responses are folded into `stats`. Responses whose id is not pending are
/// returned to the caller. Messages that are already buffered when collection ends are
/// drained as well.
pub async fn collect(
    responses: &Receiver<String>,
    pending: &mut PendingRequests,
    stats: &mut ThreadStats,
) -> eyre::Result<Vec<Response>> {
    let mut unclaimed = Vec::new();
    let deadline = pending.deadline();

    while !pending.is_empty() {
        let next = smol::future::or(async { Some(responses.recv().await) }, async {
            Timer::at(deadline).await;
            None
        })
        .await;

        match next {
            Some(Ok(raw)) => handle_response(&raw, pending, stats, &mut unclaimed),
            Some(Err(_)) => bail!("response channel closed unexpectedly"),
            None => {
                log::warn!(
                    "{} metadata request(s) unanswered at the end of epoch {}.",
                    pending.len(),
                    stats.epoch
                );
                break;
            }
        }
    }

    while let Ok(raw) = responses.try_recv() {
        handle_response(&raw, pending, stats, &mut unclaimed);
    }

    Ok(unclaimed)
}

fn handle_response(
    raw: &str,
    pending: &mut PendingRequests,
    stats: &mut ThreadStats,
    unclaimed: &mut Vec<Response>,
) {
    let response: Response = match serde_json::from_str(raw) {
        Ok(response) => response,
        Err(err) => {
            log::warn!("Dropping malformed response: {}", err);
            stats.malformed += 1;
            return;
        }
    };
    let response_id = match &response.response_id {
        Some(id) => id.clone(),
        None => {
            log::warn!("ignoring unexpected response without ID");
            return;
        }
    };

    match pending.take(&response_id) {
        Some(request) => match response.error {
            Ok(()) => stats.record_response(&response),
            Err(error) => {
                log::warn!("Request `{}` failed: {}", response_id, error);
                stats.mark_missing(&request.keys);
            }
        },
        None => unclaimed.push(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{
            key_data::{KeyCount, KeySize},
            response::ResponseType,
        },
        AnnaError,
    };
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    const AGGREGATOR: Aggregator = Aggregator {
        max_memory_consumption: 0.6,
        max_ebs_consumption: 0.75,
    };

    fn node(i: u8) -> NodeAddress {
        NodeAddress::new(format!("34.0.0.{}", i), format!("10.0.0.{}", i))
    }

    fn tier_metadata() -> HashMap<Tier, TierMetadata> {
        let mut map = HashMap::new();
        for (tier, capacity) in [(Tier::Memory, 1000), (Tier::Disk, 4000)] {
            map.insert(
                tier,
                TierMetadata {
                    thread_number: 2,
                    default_replication: 1,
                    node_capacity: capacity,
                },
            );
        }
        map
    }

    fn key(tier: Tier, node: NodeAddress, thread_id: u32, kind: KvsMetadataKind) -> Key {
        MetadataKey::KvsThread {
            tier,
            kvs_thread: KvsThread::new(node, thread_id),
            kind,
        }
        .into()
    }

    fn server_stats(
        tier: Tier,
        n: u8,
        thread_id: u32,
        storage: u64,
        occupancy: f64,
    ) -> ResponseTuple {
        let stat = ServerThreadStatistics {
            storage_consumption: storage,
            occupancy,
            epoch: 1,
            access_count: 5,
        };
        ResponseTuple {
            key: key(tier, node(n), thread_id, KvsMetadataKind::ServerStats),
            value: Some(serde_json::to_vec(&stat).unwrap()),
            error: None,
        }
    }

    fn key_access(n: u8, counts: &[(&str, usize)]) -> ResponseTuple {
        let data = KeyAccessData {
            keys: counts
                .iter()
                .map(|&(k, access_count)| KeyCount {
                    key: ClientKey::from(k).into(),
                    access_count,
                })
                .collect(),
        };
        ResponseTuple {
            key: key(Tier::Memory, node(n), 0, KvsMetadataKind::KeyAccess),
            value: Some(serde_json::to_vec(&data).unwrap()),
            error: None,
        }
    }

    #[test]
    fn summary_over_reported_threads() {
        let mut stats = ThreadStats::new(1);
        stats.record_response_tuple(&server_stats(Tier::Memory, 1, 0, 300, 0.2));
        stats.record_response_tuple(&server_stats(Tier::Memory, 1, 1, 200, 0.4));
        stats.record_response_tuple(&server_stats(Tier::Memory, 2, 0, 100, 0.1));
        stats.record_response_tuple(&server_stats(Tier::Disk, 3, 0, 2000, 0.5));
        stats.record_response_tuple(&key_access(1, &[("a", 2), ("b", 4), ("c", 0)]));
        stats.record_response_tuple(&ResponseTuple {
            key: key(Tier::Memory, node(1), 0, KvsMetadataKind::KeySize),
            value: Some(
                serde_json::to_vec(&KeySizeData {
                    key_sizes: vec![KeySize {
                        key: "a".into(),
                        size: 12,
                    }],
                })
                .unwrap(),
            ),
            error: None,
        });

        let summary = stats.compute_summary(&AGGREGATOR, &tier_metadata()).clone();

        assert_eq!(summary.memory.node_count, 2);
        assert_eq!(summary.memory.total_consumption, 600);
        assert_eq!(summary.memory.total_access, 15);
        assert_eq!(summary.memory.max_consumption_percentage, 0.5);
        assert_eq!(summary.memory.avg_consumption_percentage, 0.3);
        assert_eq!(summary.memory.required_nodes, 1);
        assert_eq!(summary.memory.min_occupancy.identity(), Some(&node(2)));
        assert_eq!(summary.ebs.node_count, 1);
        assert_eq!(summary.ebs.avg_consumption_percentage, 0.5);
        assert_eq!(summary.ebs.node_capacity, 4000);

        // "c" was not accessed and does not count towards the mean
        assert_eq!(summary.key_access_cnt, 2);
        assert_eq!(summary.key_access_mean, 3.);
        assert_eq!(summary.key_access_std, 1.);
        assert_eq!(stats.key_access_summary.get(&ClientKey::from("c")), Some(&0));
        assert_eq!(stats.key_size.get(&ClientKey::from("a")), Some(&12));
        assert_eq!(stats.malformed, 0);
    }

    #[test]
    fn error_tuples_are_missing_not_malformed() {
        let mut stats = ThreadStats::new(1);
        stats.record_response_tuple(&server_stats(Tier::Memory, 1, 0, 300, 0.2));
        stats.record_response_tuple(&ResponseTuple {
            key: key(Tier::Memory, node(1), 1, KvsMetadataKind::ServerStats),
            value: None,
            error: Some(AnnaError::KeyDoesNotExist),
        });
        stats.record_response_tuple(&ResponseTuple {
            key: key(Tier::Memory, node(2), 0, KvsMetadataKind::ServerStats),
            value: Some(b"not json".to_vec()),
            error: None,
        });

        assert_eq!(stats.missing, 1);
        assert_eq!(stats.malformed, 1);
        assert!(stats.stale_nodes.contains(&(Tier::Memory, node(1))));

        // later data of a stale node is ignored as well
        stats.record_response_tuple(&server_stats(Tier::Memory, 1, 0, 300, 0.2));
        let summary = stats.compute_summary(&AGGREGATOR, &tier_metadata());
        assert_eq!(summary.memory.node_count, 0);
        assert_eq!(summary.memory.node_capacity, 1000);
    }

    #[test]
    fn feedback_running_mean() {
        let feedback = |uid: &str, latency: f64, finish: bool, warmup: bool| UserFeedback {
            uid: uid.into(),
            latency,
            finish,
            throughput: 10.,
            warmup,
            key_latency: vec![KeyLatency {
                key: "hot".into(),
                latency,
            }],
        };
        let mut stats = FeedbackStats::default();
        stats.record(feedback("u1", 3000., false, false), 1500.);
        stats.record(feedback("u2", 1500., false, false), 1500.);
        stats.record(feedback("u3", 90000., false, true), 1500.);

        assert_eq!(stats.latency_miss_ratio[&ClientKey::from("hot")], (1.5, 2));
        assert_eq!(stats.user_latency.len(), 2);

        stats.record(feedback("u1", 0., true, false), 1500.);
        assert_eq!(stats.user_latency.len(), 1);
        assert_eq!(stats.user_throughput.len(), 1);
    }

    #[test]
    fn collect_stops_at_deadline() {
        let (sender, receiver) = smol::channel::unbounded();
        let now = Instant::now();
        let mut pending = PendingRequests::new(now + Duration::from_millis(50));

        let answered = crate::messages::Request {
            request_id: Some("r:0:0".into()),
            response_address: None,
            tier: None,
            request: crate::messages::request::RequestData::Get {
                keys: vec![key(Tier::Memory, node(1), 0, KvsMetadataKind::ServerStats)],
            },
        };
        let mut silent = answered.clone();
        silent.request_id = Some("r:0:1".into());
        silent.request = crate::messages::request::RequestData::Get {
            keys: vec![key(Tier::Disk, node(2), 0, KvsMetadataKind::ServerStats)],
        };
        pending.track("a", &answered, now);
        pending.track("b", &silent, now);

        let mut response = answered.new_response();
        response.tuples.push(server_stats(Tier::Memory, 1, 0, 10, 0.1));
        let mut unknown = response.clone();
        unknown.response_id = Some("elsewhere".into());
        unknown.ty = ResponseType::Put;

        for raw in [
            serde_json::to_string(&response).unwrap(),
            serde_json::to_string(&response).unwrap(),
            "{garbage".to_owned(),
            serde_json::to_string(&unknown).unwrap(),
        ] {
            sender.try_send(raw).unwrap();
        }

        let mut stats = ThreadStats::new(0);
        let unclaimed = smol::block_on(collect(&receiver, &mut pending, &mut stats)).unwrap();

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.memory.storage[&node(1)][&0], 10);
        // the duplicate and the foreign response are handed back
        assert_eq!(unclaimed.len(), 2);
        let expired = pending.into_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].destination, "b");
        assert!(Instant::now() >= now + Duration::from_millis(50));
    }

    #[test]
    fn closed_channel_is_fatal() {
        let (sender, receiver) = smol::channel::unbounded::<String>();
        drop(sender);
        let now = Instant::now();
        let mut pending = PendingRequests::new(now + Duration::from_secs(5));
        pending.track(
            "a",
            &crate::messages::Request {
                request_id: Some("r".into()),
                response_address: None,
                tier: None,
                request: crate::messages::request::RequestData::Get { keys: vec![] },
            },
            now,
        );
        let mut stats = ThreadStats::new(0);
        assert!(smol::block_on(collect(&receiver, &mut pending, &mut stats)).is_err());
    }
}
