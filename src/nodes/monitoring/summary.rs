//! Cluster-wide statistics and the rules for combining them.

use crate::{messages::Tier, topics::NodeAddress};

/// A minimum value together with the identity of whoever reported it.
///
/// The value and the identity are only ever replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMin<T> {
    value: f64,
    identity: Option<T>,
}

impl<T> Default for TrackedMin<T> {
    /// Starts at 1, the largest possible occupancy ratio.
    fn default() -> Self {
        Self {
            value: 1.,
            identity: None,
        }
    }
}

impl<T: Clone> TrackedMin<T> {
    /// A minimum consisting of a single observation.
    pub fn observed(value: f64, identity: T) -> Self {
        Self {
            value,
            identity: Some(identity),
        }
    }

    /// The current minimum.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The identity that reported [`Self::value`], if anything was observed yet.
    pub fn identity(&self) -> Option<&T> {
        self.identity.as_ref()
    }

    /// Replaces `self` with `other` if `other` holds the smaller value.
    ///
    /// The first real observation also replaces the initial value when it is equal to it.
    pub fn merge(&mut self, other: &Self) {
        let unseen = self.identity.is_none() && other.identity.is_some();
        if other.value < self.value || (unseen && other.value <= self.value) {
            *self = other.clone();
        }
    }
}

/// Aggregated statistics of one storage tier.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TierSummary {
    /// Number of nodes that contributed to this summary.
    pub node_count: usize,
    /// Total key accesses served by the tier.
    pub total_access: usize,
    /// Total bytes stored in the tier.
    pub total_consumption: u64,
    /// The highest storage consumption ratio of a single node.
    pub max_consumption_percentage: f64,
    /// The average storage consumption ratio over all nodes.
    pub avg_consumption_percentage: f64,
    /// Capacity of a single node in bytes, taken from the latest operand.
    pub node_capacity: u64,
    /// The number of nodes needed to keep consumption below the tier's threshold.
    pub required_nodes: usize,
    /// The highest occupancy of a single node.
    pub max_occupancy: f64,
    /// The lowest occupancy of a single node and that node's address.
    pub min_occupancy: TrackedMin<NodeAddress>,
    /// `sum_occupancy / cnt_occupancy`.
    pub avg_occupancy: f64,
    /// Sum of all node occupancies.
    pub sum_occupancy: f64,
    /// Number of node occupancies in `sum_occupancy`.
    pub cnt_occupancy: usize,
}

/// The cluster-wide snapshot consumed by the controllers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SummaryStats {
    /// Number of keys with a nonzero access count.
    pub key_access_cnt: usize,
    /// Mean access count over those keys.
    pub key_access_mean: f64,
    /// Standard deviation of the access counts.
    pub key_access_std: f64,
    /// Statistics of the memory tier.
    pub memory: TierSummary,
    /// Statistics of the disk tier.
    pub ebs: TierSummary,
    /// Sum of all reported client latencies.
    pub sum_latency: f64,
    /// Number of reported client latencies.
    pub cnt_latency: usize,
    /// Average reported client latency.
    pub avg_latency: f64,
    /// Sum of all reported client throughputs.
    pub total_throughput: f64,
}

impl SummaryStats {
    /// Resets all counters; minima restart at 1 and maxima at 0.
    pub fn clear(&mut self) {
        *self = Default::default();
    }

    /// The summary of the given storage tier.
    pub fn tier(&self, tier: Tier) -> Option<&TierSummary> {
        match tier {
            Tier::Memory => Some(&self.memory),
            Tier::Disk => Some(&self.ebs),
            Tier::Routing => None,
        }
    }

    /// Logs the cluster-wide values of the snapshot.
    pub fn log(&self) {
        log::info!(
            "Access: mean={}, std={}",
            self.key_access_mean,
            self.key_access_std
        );
        for (name, tier) in [("memory", &self.memory), ("EBS", &self.ebs)] {
            log::info!(
                "Total {} accesses is {}, consumption is {} bytes.",
                name,
                tier.total_access,
                tier.total_consumption
            );
            log::info!(
                "Average {} node consumption is {}, max is {}.",
                name,
                tier.avg_consumption_percentage,
                tier.max_consumption_percentage
            );
            log::info!(
                "Average {} node occupancy is {}, max is {}, min is {}.",
                name,
                tier.avg_occupancy,
                tier.max_occupancy,
                tier.min_occupancy.value()
            );
            log::info!(
                "The system requires {} {} nodes.",
                tier.required_nodes,
                name
            );
        }
        log::info!("Average latency is {}.", self.avg_latency);
        log::info!("Total throughput is {}.", self.total_throughput);
    }
}

/// Combines [`SummaryStats`] operands into one snapshot.
///
/// Combination is not commutative: the node capacity of each tier is taken from the operand,
/// so derived fields depend on the order of the operands.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    /// Consumption threshold of the memory tier used for the required node count.
    pub max_memory_consumption: f64,
    /// Consumption threshold of the disk tier used for the required node count.
    pub max_ebs_consumption: f64,
}

impl Aggregator {
    /// Combines the accumulator with one operand into a new accumulator.
    pub fn aggregate(&self, acc: &SummaryStats, operand: &SummaryStats) -> SummaryStats {
        let key_access_cnt = acc.key_access_cnt + operand.key_access_cnt;
        let total_access = acc.key_access_cnt as f64 * acc.key_access_mean
            + operand.key_access_cnt as f64 * operand.key_access_mean;
        let sum_latency = acc.sum_latency + operand.sum_latency;
        let cnt_latency = acc.cnt_latency + operand.cnt_latency;

        SummaryStats {
            key_access_cnt,
            key_access_mean: ratio(total_access, key_access_cnt as f64),
            key_access_std: (acc.key_access_std.powi(2) + operand.key_access_std.powi(2)).sqrt(),
            memory: aggregate_tier(&acc.memory, &operand.memory, self.max_memory_consumption),
            ebs: aggregate_tier(&acc.ebs, &operand.ebs, self.max_ebs_consumption),
            sum_latency,
            cnt_latency,
            avg_latency: ratio(sum_latency, cnt_latency as f64),
            total_throughput: acc.total_throughput + operand.total_throughput,
        }
    }

    /// Folds the operands, in order, into a cleared snapshot.
    pub fn fold<'a>(&self, operands: impl IntoIterator<Item = &'a SummaryStats>) -> SummaryStats {
        operands
            .into_iter()
            .fold(SummaryStats::default(), |acc, operand| {
                self.aggregate(&acc, operand)
            })
    }
}

/// Merges the statistics of one tier.
///
/// The average consumption is the ratio `total_consumption / (node_count * node_capacity)`
/// rather than a per-node mean of absolute bytes, so it stays comparable with the
/// consumption thresholds in [0, 1]. `node_capacity` is taken from `operand`.
fn aggregate_tier(acc: &TierSummary, operand: &TierSummary, threshold: f64) -> TierSummary {
    let node_count = acc.node_count + operand.node_count;
    let total_consumption = acc.total_consumption + operand.total_consumption;
    let node_capacity = operand.node_capacity;
    let sum_occupancy = acc.sum_occupancy + operand.sum_occupancy;
    let cnt_occupancy = acc.cnt_occupancy + operand.cnt_occupancy;

    let mut min_occupancy = acc.min_occupancy.clone();
    min_occupancy.merge(&operand.min_occupancy);

    TierSummary {
        node_count,
        total_access: acc.total_access + operand.total_access,
        total_consumption,
        max_consumption_percentage: f64::max(
            acc.max_consumption_percentage,
            operand.max_consumption_percentage,
        ),
        avg_consumption_percentage: ratio(
            total_consumption as f64,
            node_count as f64 * node_capacity as f64,
        ),
        node_capacity,
        required_nodes: required_nodes(total_consumption, threshold, node_capacity),
        max_occupancy: f64::max(acc.max_occupancy, operand.max_occupancy),
        min_occupancy,
        avg_occupancy: ratio(sum_occupancy, cnt_occupancy as f64),
        sum_occupancy,
        cnt_occupancy,
    }
}

/// The number of nodes of the given capacity needed to store `total_consumption` bytes while
/// staying below `threshold`.
pub fn required_nodes(total_consumption: u64, threshold: f64, node_capacity: u64) -> usize {
    let limit = threshold * node_capacity as f64;
    if limit <= 0. {
        return 0;
    }
    (total_consumption as f64 / limit).ceil() as usize
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0. {
        numerator / denominator
    } else {
        0.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const AGGREGATOR: Aggregator = Aggregator {
        max_memory_consumption: 0.6,
        max_ebs_consumption: 0.75,
    };

    fn node(i: u8) -> NodeAddress {
        NodeAddress::new(format!("34.0.0.{}", i), format!("10.0.0.{}", i))
    }

    fn access(cnt: usize, mean: f64, std: f64) -> SummaryStats {
        SummaryStats {
            key_access_cnt: cnt,
            key_access_mean: mean,
            key_access_std: std,
            ..Default::default()
        }
    }

    fn memory_node(i: u8, consumption: u64, capacity: u64, occupancy: f64) -> SummaryStats {
        SummaryStats {
            memory: TierSummary {
                node_count: 1,
                total_access: 7,
                total_consumption: consumption,
                max_consumption_percentage: consumption as f64 / capacity as f64,
                node_capacity: capacity,
                max_occupancy: occupancy,
                min_occupancy: TrackedMin::observed(occupancy, node(i)),
                sum_occupancy: occupancy,
                cnt_occupancy: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn empty_operand_keeps_access_mean() {
        let combined = AGGREGATOR.aggregate(&access(10, 5., 0.), &access(0, 0., 0.));
        assert_eq!(combined.key_access_cnt, 10);
        assert_eq!(combined.key_access_mean, 5.);
    }

    #[test]
    fn access_mean_is_weighted() {
        let combined = AGGREGATOR.aggregate(&access(2, 1., 0.), &access(6, 3., 0.));
        assert_eq!(combined.key_access_cnt, 8);
        assert_eq!(combined.key_access_mean, 2.5);

        let zero = AGGREGATOR.aggregate(&access(0, 0., 0.), &access(0, 0., 0.));
        assert_eq!(zero.key_access_mean, 0.);
        assert!(!zero.key_access_mean.is_nan());
    }

    #[test]
    fn access_std_is_root_of_squares() {
        let combined = AGGREGATOR.aggregate(&access(1, 1., 3.), &access(1, 1., 4.));
        assert_eq!(combined.key_access_std, 5.);
    }

    #[test]
    fn cleared_snapshot_plus_operand_is_operand() {
        let mut acc = AGGREGATOR.fold(&[memory_node(1, 10, 100, 0.3)]);
        acc.clear();
        assert_eq!(acc.memory.min_occupancy.value(), 1.);
        assert_eq!(acc.memory.max_occupancy, 0.);

        let operand = memory_node(2, 40, 100, 0.25);
        let combined = AGGREGATOR.aggregate(&acc, &operand);
        assert_eq!(combined.memory.node_count, 1);
        assert_eq!(combined.memory.total_access, 7);
        assert_eq!(combined.memory.total_consumption, 40);
        assert_eq!(combined.memory.max_occupancy, 0.25);
        assert_eq!(combined.memory.min_occupancy, operand.memory.min_occupancy);
        assert_eq!(combined.memory.avg_consumption_percentage, 0.4);
        assert_eq!(combined.memory.required_nodes, 1);
        // the untouched tier keeps its sentinels
        assert_eq!(combined.ebs.min_occupancy.value(), 1.);
        assert_eq!(combined.ebs.min_occupancy.identity(), None);
    }

    #[test]
    fn min_occupancy_keeps_reporting_node() {
        let operands = [
            memory_node(1, 10, 100, 0.4),
            memory_node(2, 10, 100, 0.2),
            memory_node(3, 10, 100, 0.3),
        ];
        let summary = AGGREGATOR.fold(&operands);
        assert_eq!(summary.memory.min_occupancy.value(), 0.2);
        assert_eq!(summary.memory.min_occupancy.identity(), Some(&node(2)));
        assert_eq!(summary.memory.max_occupancy, 0.4);
        assert!((summary.memory.avg_occupancy - 0.3).abs() < 1e-9);

        let mut min = TrackedMin::observed(0.2, node(2));
        min.merge(&TrackedMin::observed(0.2, node(5)));
        assert_eq!(min.identity(), Some(&node(2)));
    }

    #[test]
    fn first_observation_replaces_sentinel() {
        let mut min = TrackedMin::default();
        min.merge(&TrackedMin::observed(1., node(4)));
        assert_eq!(min.identity(), Some(&node(4)));
        min.merge(&TrackedMin::default());
        assert_eq!(min.identity(), Some(&node(4)));
    }

    #[test]
    fn required_nodes_grows_with_consumption() {
        let mut last = 0;
        for consumption in (0..2_000).step_by(37) {
            let required = required_nodes(consumption, 0.6, 100);
            assert!(required >= last);
            last = required;
        }
        assert_eq!(required_nodes(60, 0.6, 100), 1);
        assert_eq!(required_nodes(61, 0.6, 100), 2);
        assert_eq!(required_nodes(1_000, 0.6, 0), 0);
    }

    #[test]
    fn capacity_comes_from_last_operand() {
        let small = memory_node(1, 120, 100, 0.5);
        let large = memory_node(2, 120, 400, 0.5);

        let small_last = AGGREGATOR.fold(&[large.clone(), small.clone()]);
        let large_last = AGGREGATOR.fold(&[small, large]);

        assert_eq!(small_last.memory.node_capacity, 100);
        assert_eq!(large_last.memory.node_capacity, 400);
        assert_eq!(small_last.memory.required_nodes, 4);
        assert_eq!(large_last.memory.required_nodes, 1);
    }

    #[test]
    fn latency_average_is_guarded() {
        let feedback = SummaryStats {
            sum_latency: 30.,
            cnt_latency: 3,
            total_throughput: 12.,
            ..Default::default()
        };
        let summary = AGGREGATOR.fold(&[SummaryStats::default(), feedback]);
        assert_eq!(summary.avg_latency, 10.);
        assert_eq!(summary.total_throughput, 12.);
        assert_eq!(AGGREGATOR.fold(std::iter::empty()).avg_latency, 0.);
    }
}
