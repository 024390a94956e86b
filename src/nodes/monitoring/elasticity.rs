//! Decides when storage tiers grow or shrink.

use super::summary::SummaryStats;
use crate::{
    config::{Monitoring, Policy},
    hash_ring::tier_name,
    messages::Tier,
    topics::NodeAddress,
    ALL_TIERS,
};
use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

/// Minimum memory occupancy above which a latency violation is answered with more nodes
/// instead of more replicas.
pub const LATENCY_SCALE_UP_OCCUPANCY: f64 = 0.15;

/// Progress of the scale action of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElasticityState {
    /// No action is pending.
    Idle,
    /// An action was decided but not yet handed to the transport.
    Triggered,
    /// An action was sent and its effect was not observed yet.
    InFlight,
    /// The effect of the last action was observed.
    Acknowledged,
    /// The last action was abandoned.
    TimedOut,
}

/// An asynchronous scale action. Its effect is only visible in later snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElasticityCommand {
    /// Ask the management node for `number` additional nodes.
    AddNodes {
        /// The tier that should grow.
        tier: Tier,
        /// The number of requested nodes, never more than the batch size.
        number: usize,
    },
    /// Ask `node` to hand off its data and leave the cluster.
    RemoveNode {
        /// The tier of the node.
        tier: Tier,
        /// The departing node.
        node: NodeAddress,
        /// Id of the [`RemovalOperation`] that tracks the departure.
        operation: usize,
    },
}

/// Bookkeeping of one node departure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOperation {
    /// Unique id of the operation.
    pub id: usize,
    /// The tier of the departing node.
    pub tier: Tier,
    /// The departing node.
    pub node: NodeAddress,
    /// The number of threads that have not yet acknowledged their departure.
    pub pending_acks: u32,
    /// When the operation was started.
    pub started: Instant,
}

/// Result of a departure acknowledgement, see [`ElasticityController::depart_done`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepartProgress {
    /// No removal of that node is in progress.
    Unknown,
    /// More acknowledgements are expected.
    Pending(u32),
    /// The last acknowledgement arrived; the node can be released.
    Complete(RemovalOperation),
}

#[derive(Debug, Clone, Copy)]
struct TierLimits {
    max_consumption: f64,
    min_consumption: f64,
    min_size: usize,
    threads: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingAction {
    Addition {
        baseline: usize,
        number: usize,
        issued: Instant,
    },
    Removal {
        operation: usize,
    },
}

#[derive(Debug, Clone)]
struct TierControl {
    state: ElasticityState,
    action: Option<PendingAction>,
    below_min_since: Option<Instant>,
}

impl Default for TierControl {
    fn default() -> Self {
        Self {
            state: ElasticityState::Idle,
            action: None,
            below_min_since: None,
        }
    }
}

/// Input of one [`ElasticityController::evaluate`] call.
#[derive(Debug, Clone, Copy)]
pub struct ElasticityInput<'a> {
    /// The current time.
    pub now: Instant,
    /// The aggregated snapshot of this epoch.
    pub summary: &'a SummaryStats,
    /// The number of ring members per tier.
    pub node_counts: &'a HashMap<Tier, usize>,
    /// Node demand reported by blocked key promotions and demotions.
    pub overflow: &'a BTreeMap<Tier, usize>,
}

/// Per-tier scale-up and scale-down state machine.
#[derive(Debug)]
pub struct ElasticityController {
    enabled: bool,
    tiering: bool,
    batch_size: usize,
    grace_period: Duration,
    action_timeout: Duration,
    slo_worst: f64,
    limits: HashMap<Tier, TierLimits>,
    tiers: HashMap<Tier, TierControl>,
    departing: BTreeMap<usize, RemovalOperation>,
    /// Nodes handed to the management node, with the time of release.
    released: BTreeMap<(Tier, NodeAddress), Instant>,
    next_operation: usize,
}

impl ElasticityController {
    /// Creates an idle controller.
    pub fn new(monitoring: &Monitoring, policy: &Policy, threads: &HashMap<Tier, u32>) -> Self {
        let thread_count = |tier| threads.get(&tier).copied().unwrap_or(1);
        let mut limits = HashMap::new();
        limits.insert(
            Tier::Memory,
            TierLimits {
                max_consumption: monitoring.max_memory_consumption,
                min_consumption: monitoring.min_memory_consumption,
                min_size: monitoring.min_memory_tier_size,
                threads: thread_count(Tier::Memory),
            },
        );
        limits.insert(
            Tier::Disk,
            TierLimits {
                max_consumption: monitoring.max_ebs_consumption,
                min_consumption: monitoring.min_ebs_consumption,
                min_size: monitoring.min_ebs_tier_size,
                threads: thread_count(Tier::Disk),
            },
        );

        Self {
            enabled: policy.elasticity,
            tiering: policy.tiering,
            batch_size: monitoring.node_addition_batch_size,
            grace_period: monitoring.grace_period(),
            action_timeout: monitoring.action_timeout(),
            slo_worst: monitoring.slo_worst_ms,
            limits,
            tiers: ALL_TIERS.iter().map(|&t| (t, TierControl::default())).collect(),
            departing: Default::default(),
            released: Default::default(),
            next_operation: 0,
        }
    }

    /// The state of the given tier.
    pub fn state(&self, tier: Tier) -> ElasticityState {
        self.tiers
            .get(&tier)
            .map(|c| c.state)
            .unwrap_or(ElasticityState::Idle)
    }

    /// The removal operations that wait for acknowledgements.
    pub fn departing(&self) -> impl Iterator<Item = &RemovalOperation> {
        self.departing.values()
    }

    /// Returns true if a removal of the given tier is in progress.
    pub fn is_removing(&self, tier: Tier) -> bool {
        self.departing.values().any(|op| op.tier == tier)
    }

    /// Advances the state machines and returns the scale actions of this epoch.
    pub fn evaluate(&mut self, input: ElasticityInput<'_>) -> Vec<ElasticityCommand> {
        let mut commands = Vec::new();
        if !self.enabled {
            return commands;
        }

        self.expire_released(input.now);
        for &tier in ALL_TIERS {
            if tier == Tier::Disk && !self.tiering {
                continue;
            }
            self.progress(tier, &input);
            if let Some(command) = self.decide(tier, &input) {
                commands.push(command);
            }
        }
        commands
    }

    fn progress(&mut self, tier: Tier, input: &ElasticityInput<'_>) {
        let node_count = self.effective_node_count(tier, input);
        let action_timeout = self.action_timeout;
        let control = self.tiers.entry(tier).or_default();

        match control.state {
            ElasticityState::Acknowledged | ElasticityState::TimedOut => {
                control.state = ElasticityState::Idle;
                control.action = None;
            }
            // never dispatched
            ElasticityState::Triggered => {
                if let Some(PendingAction::Removal { operation }) = control.action.take() {
                    self.departing.remove(&operation);
                }
                control.state = ElasticityState::Idle;
            }
            ElasticityState::Idle => {}
            ElasticityState::InFlight => match control.action.clone() {
                Some(PendingAction::Addition {
                    baseline,
                    number,
                    issued,
                }) => {
                    if node_count >= baseline + number {
                        log::info!(
                            "{} new {} node(s) joined.",
                            number,
                            tier_name(tier)
                        );
                        control.state = ElasticityState::Acknowledged;
                    } else if input.now.saturating_duration_since(issued) >= action_timeout {
                        log::warn!(
                            "Only {} of {} requested {} node(s) joined in time.",
                            node_count.saturating_sub(baseline),
                            number,
                            tier_name(tier)
                        );
                        control.state = ElasticityState::TimedOut;
                    }
                }
                Some(PendingAction::Removal { operation }) => match self.departing.get(&operation) {
                    Some(op)
                        if input.now.saturating_duration_since(op.started) >= action_timeout =>
                    {
                        log::warn!(
                            "Abandoning removal of {} node {}: {} thread(s) never acknowledged.",
                            tier_name(tier),
                            op.node,
                            op.pending_acks
                        );
                        self.departing.remove(&operation);
                        control.state = ElasticityState::TimedOut;
                    }
                    Some(_) => {}
                    None => control.state = ElasticityState::Acknowledged,
                },
                None => control.state = ElasticityState::Idle,
            },
        }

        let limits = self.limits[&tier];
        let below_min = input
            .summary
            .tier(tier)
            .map(|s| s.avg_consumption_percentage < limits.min_consumption)
            .unwrap_or(false);
        if below_min {
            control.below_min_since.get_or_insert(input.now);
        } else {
            control.below_min_since = None;
        }
    }

    fn decide(&mut self, tier: Tier, input: &ElasticityInput<'_>) -> Option<ElasticityCommand> {
        if self.state(tier) != ElasticityState::Idle {
            return None;
        }
        let summary = input.summary.tier(tier)?;
        let limits = self.limits[&tier];
        let node_count = self.effective_node_count(tier, input);

        // scale up on storage pressure, blocked key movements or latency violations
        let mut demand = None;
        if summary.avg_consumption_percentage > limits.max_consumption
            || summary.max_consumption_percentage > limits.max_consumption
        {
            log::info!(
                "{} tier consumption (avg {}, max {}) exceeds {}.",
                tier_name(tier),
                summary.avg_consumption_percentage,
                summary.max_consumption_percentage,
                limits.max_consumption
            );
            demand = Some(summary.required_nodes);
        }
        if let Some(&overflow) = input.overflow.get(&tier) {
            demand = Some(demand.unwrap_or_default().max(overflow));
        }
        if tier == Tier::Memory
            && input.summary.avg_latency > self.slo_worst
            && summary.min_occupancy.value() > LATENCY_SCALE_UP_OCCUPANCY
        {
            log::info!(
                "Observed latency ({}) violates SLO({}).",
                input.summary.avg_latency,
                self.slo_worst
            );
            let wanted = ((input.summary.avg_latency / self.slo_worst - 1.) * node_count as f64)
                .ceil() as usize;
            demand = Some(demand.unwrap_or_default().max(node_count + wanted));
        }

        if let Some(required) = demand {
            let number = required
                .saturating_sub(node_count)
                .clamp(1, self.batch_size.max(1));
            let control = self.tiers.entry(tier).or_default();
            control.state = ElasticityState::Triggered;
            control.action = Some(PendingAction::Addition {
                baseline: node_count,
                number,
                issued: input.now,
            });
            return Some(ElasticityCommand::AddNodes { tier, number });
        }

        // scale down after the grace period of sustained low consumption
        let grace_elapsed = self.tiers[&tier]
            .below_min_since
            .map(|since| input.now.saturating_duration_since(since) >= self.grace_period)
            .unwrap_or(false);
        if !grace_elapsed || node_count <= usize::max(limits.min_size, summary.required_nodes) {
            return None;
        }
        let node = summary.min_occupancy.identity()?.clone();
        if self.released.contains_key(&(tier, node.clone()))
            || self.departing.values().any(|op| op.node == node)
        {
            return None;
        }

        log::info!(
            "{} node {} is underutilized (occupancy {}).",
            tier_name(tier),
            node,
            summary.min_occupancy.value()
        );
        let id = self.next_operation;
        self.next_operation += 1;
        self.departing.insert(
            id,
            RemovalOperation {
                id,
                tier,
                node: node.clone(),
                pending_acks: limits.threads,
                started: input.now,
            },
        );
        let control = self.tiers.entry(tier).or_default();
        control.state = ElasticityState::Triggered;
        control.action = Some(PendingAction::Removal { operation: id });
        control.below_min_since = None;

        Some(ElasticityCommand::RemoveNode {
            tier,
            node,
            operation: id,
        })
    }

    fn effective_node_count(&self, tier: Tier, input: &ElasticityInput<'_>) -> usize {
        let members = input.node_counts.get(&tier).copied().unwrap_or_default();
        let released = self.released.keys().filter(|(t, _)| *t == tier).count();
        members.saturating_sub(released)
    }

    /// Reports whether the command of `tier` was handed to the transport.
    ///
    /// A failed send returns the tier to `Idle`, so that the next epoch re-derives the
    /// trigger from the then-current state.
    pub fn dispatched(&mut self, tier: Tier, ok: bool) {
        let control = self.tiers.entry(tier).or_default();
        if control.state != ElasticityState::Triggered {
            return;
        }
        if ok {
            control.state = ElasticityState::InFlight;
            return;
        }
        if let Some(PendingAction::Removal { operation }) = control.action.take() {
            self.departing.remove(&operation);
        }
        control.state = ElasticityState::Idle;
    }

    fn expire_released(&mut self, now: Instant) {
        let action_timeout = self.action_timeout;
        self.released.retain(|(tier, node), released_at| {
            let waiting = now.saturating_duration_since(*released_at) < action_timeout;
            if !waiting {
                log::warn!(
                    "Released {} node {} never left the hash ring; counting it again.",
                    tier_name(*tier),
                    node
                );
            }
            waiting
        });
    }

    /// Counts one departure acknowledgement of `node` received at `now`.
    ///
    /// A released node stops counting towards its tier until its departure shows in the ring
    /// or the action timeout passes.
    pub fn depart_done(&mut self, node: &NodeAddress, now: Instant) -> DepartProgress {
        let id = match self.departing.values().find(|op| &op.node == node) {
            Some(op) => op.id,
            None => return DepartProgress::Unknown,
        };
        let remaining = match self.departing.get_mut(&id) {
            Some(op) => {
                op.pending_acks = op.pending_acks.saturating_sub(1);
                op.pending_acks
            }
            None => return DepartProgress::Unknown,
        };
        if remaining > 0 {
            return DepartProgress::Pending(remaining);
        }

        match self.departing.remove(&id) {
            Some(op) => {
                let control = self.tiers.entry(op.tier).or_default();
                control.state = ElasticityState::Acknowledged;
                control.below_min_since = None;
                self.released.insert((op.tier, op.node.clone()), now);
                DepartProgress::Complete(op)
            }
            None => DepartProgress::Unknown,
        }
    }

    /// Restarts the grace period of the tier after a membership change.
    pub fn membership_changed(&mut self, tier: Tier) {
        if let Some(control) = self.tiers.get_mut(&tier) {
            control.below_min_since = None;
        }
    }

    /// Forgets a released node once its departure is visible in the ring.
    pub fn node_departed(&mut self, tier: Tier, node: &NodeAddress) {
        self.released.remove(&(tier, node.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::monitoring::summary::{TierSummary, TrackedMin};
    use pretty_assertions::assert_eq;

    fn node(i: usize) -> NodeAddress {
        NodeAddress::new(format!("34.0.0.{}", i), format!("10.0.0.{}", i))
    }

    fn controller() -> ElasticityController {
        let policy = Policy {
            elasticity: true,
            tiering: true,
            selective_rep: false,
        };
        let threads = [(Tier::Memory, 4), (Tier::Disk, 2)].iter().copied().collect();
        ElasticityController::new(&Monitoring::default(), &policy, &threads)
    }

    fn memory_summary(avg: f64, max: f64, required: usize, min_node: usize) -> SummaryStats {
        SummaryStats {
            memory: TierSummary {
                avg_consumption_percentage: avg,
                max_consumption_percentage: max,
                required_nodes: required,
                min_occupancy: TrackedMin::observed(0.1, node(min_node)),
                ..Default::default()
            },
            // keep the disk tier inside its thresholds
            ebs: TierSummary {
                avg_consumption_percentage: 0.6,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn counts(memory: usize) -> HashMap<Tier, usize> {
        [(Tier::Memory, memory), (Tier::Disk, 0)].iter().copied().collect()
    }

    fn evaluate(
        controller: &mut ElasticityController,
        now: Instant,
        summary: &SummaryStats,
        node_counts: &HashMap<Tier, usize>,
    ) -> Vec<ElasticityCommand> {
        let commands = controller.evaluate(ElasticityInput {
            now,
            summary,
            node_counts,
            overflow: &BTreeMap::new(),
        });
        for command in &commands {
            match command {
                ElasticityCommand::AddNodes { tier, .. }
                | ElasticityCommand::RemoveNode { tier, .. } => controller.dispatched(*tier, true),
            }
        }
        commands
    }

    #[test]
    fn scale_up_is_capped_at_batch_size() {
        let mut controller = controller();
        let now = Instant::now();
        let summary = memory_summary(0.65, 0.8, 10, 0);

        let commands = evaluate(&mut controller, now, &summary, &counts(2));
        assert_eq!(
            commands,
            vec![ElasticityCommand::AddNodes {
                tier: Tier::Memory,
                number: 2
            }]
        );
        assert_eq!(controller.state(Tier::Memory), ElasticityState::InFlight);

        // no second request while the first one is in flight
        let later = now + Duration::from_secs(30);
        assert!(evaluate(&mut controller, later, &summary, &counts(3)).is_empty());

        // the new nodes are visible: acknowledged, then a fresh decision
        let later = later + Duration::from_secs(30);
        assert!(evaluate(&mut controller, later, &summary, &counts(4)).is_empty());
        assert_eq!(controller.state(Tier::Memory), ElasticityState::Acknowledged);
        let commands = evaluate(&mut controller, later, &summary, &counts(4));
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn peak_consumption_alone_triggers_scale_up() {
        let mut controller = controller();
        let summary = memory_summary(0.5, 0.8, 3, 0);
        let commands = evaluate(&mut controller, Instant::now(), &summary, &counts(2));
        assert_eq!(
            commands,
            vec![ElasticityCommand::AddNodes {
                tier: Tier::Memory,
                number: 1
            }]
        );
    }

    #[test]
    fn minimum_size_blocks_removal() {
        let mut controller = controller();
        let start = Instant::now();
        let summary = memory_summary(0.01, 0.01, 0, 0);

        for epoch in 0..20 {
            let now = start + Duration::from_secs(30 * epoch);
            assert!(evaluate(&mut controller, now, &summary, &counts(1)).is_empty());
        }
    }

    #[test]
    fn removal_requires_sustained_low_consumption() {
        let mut controller = controller();
        let start = Instant::now();
        let low = memory_summary(0.1, 0.1, 1, 2);
        let normal = memory_summary(0.4, 0.4, 1, 2);
        let at = |secs| start + Duration::from_secs(secs);

        assert!(evaluate(&mut controller, at(0), &low, &counts(3)).is_empty());
        assert!(evaluate(&mut controller, at(90), &low, &counts(3)).is_empty());
        // a single normal epoch restarts the grace period
        assert!(evaluate(&mut controller, at(100), &normal, &counts(3)).is_empty());
        assert!(evaluate(&mut controller, at(130), &low, &counts(3)).is_empty());
        assert!(evaluate(&mut controller, at(200), &low, &counts(3)).is_empty());

        let commands = evaluate(&mut controller, at(250), &low, &counts(3));
        assert_eq!(
            commands,
            vec![ElasticityCommand::RemoveNode {
                tier: Tier::Memory,
                node: node(2),
                operation: 0
            }]
        );
        assert!(controller.is_removing(Tier::Memory));
    }

    #[test]
    fn repeated_removals_stop_at_minimum_size() {
        let mut controller = controller();
        let start = Instant::now();
        let mut members = 4;

        for epoch in 0..40u64 {
            let now = start + Duration::from_secs(60 * epoch);
            let summary = memory_summary(0.01, 0.01, 0, epoch as usize);
            for command in evaluate(&mut controller, now, &summary, &counts(members)) {
                if let ElasticityCommand::RemoveNode { node, .. } = command {
                    for _ in 0..4 {
                        controller.depart_done(&node, now);
                    }
                    // the ring only shrinks a few epochs later
                    assert!(members > 1);
                }
            }
            if epoch % 3 == 0 {
                if let Some((tier, node)) = controller.released.keys().next().cloned() {
                    controller.node_departed(tier, &node);
                    members -= 1;
                }
            }
        }
        assert_eq!(members, 1);
    }

    #[test]
    fn unacknowledged_removal_times_out() {
        let mut controller = controller();
        let start = Instant::now();
        let low = memory_summary(0.1, 0.1, 0, 2);

        evaluate(&mut controller, start, &low, &counts(2));
        let requested = start + Duration::from_secs(121);
        let commands = evaluate(&mut controller, requested, &low, &counts(2));
        assert_eq!(commands.len(), 1);
        assert_eq!(
            controller.depart_done(&node(2), requested),
            DepartProgress::Pending(3)
        );

        let expired = start + Duration::from_secs(121 + 300);
        assert!(evaluate(&mut controller, expired, &low, &counts(2)).is_empty());
        assert_eq!(controller.state(Tier::Memory), ElasticityState::TimedOut);
        assert!(!controller.is_removing(Tier::Memory));
        assert_eq!(
            controller.depart_done(&node(2), expired),
            DepartProgress::Unknown
        );
    }

    #[test]
    fn failed_dispatch_returns_to_idle() {
        let mut controller = controller();
        let summary = memory_summary(0.9, 0.9, 5, 0);
        let commands = controller.evaluate(ElasticityInput {
            now: Instant::now(),
            summary: &summary,
            node_counts: &counts(1),
            overflow: &BTreeMap::new(),
        });
        assert_eq!(commands.len(), 1);
        controller.dispatched(Tier::Memory, false);
        assert_eq!(controller.state(Tier::Memory), ElasticityState::Idle);
    }

    #[test]
    fn overflow_triggers_scale_up_and_disabled_policy_is_silent() {
        let mut controller = controller();
        let summary = memory_summary(0.4, 0.4, 1, 0);
        let overflow = [(Tier::Disk, 3)].iter().cloned().collect();
        let commands = controller.evaluate(ElasticityInput {
            now: Instant::now(),
            summary: &summary,
            node_counts: &counts(2),
            overflow: &overflow,
        });
        assert_eq!(
            commands,
            vec![ElasticityCommand::AddNodes {
                tier: Tier::Disk,
                number: 2
            }]
        );

        let policy = Policy {
            elasticity: false,
            tiering: true,
            selective_rep: true,
        };
        let mut disabled =
            ElasticityController::new(&Monitoring::default(), &policy, &HashMap::new());
        let summary = memory_summary(0.9, 0.9, 10, 0);
        assert!(disabled
            .evaluate(ElasticityInput {
                now: Instant::now(),
                summary: &summary,
                node_counts: &counts(2),
                overflow: &overflow,
            })
            .is_empty());
    }

    #[test]
    fn unreleased_node_counts_again_after_timeout() {
        let mut controller = controller();
        let start = Instant::now();
        let low = memory_summary(0.1, 0.1, 0, 2);
        let at = |secs| start + Duration::from_secs(secs);

        evaluate(&mut controller, at(0), &low, &counts(3));
        let commands = evaluate(&mut controller, at(121), &low, &counts(3));
        assert_eq!(commands.len(), 1);
        for _ in 0..4 {
            controller.depart_done(&node(2), at(121));
        }

        // the management node never removes it from the ring
        for secs in &[150, 300, 400] {
            assert!(evaluate(&mut controller, at(*secs), &low, &counts(3)).is_empty());
        }
        let commands = evaluate(&mut controller, at(450), &low, &counts(3));
        assert_eq!(
            commands,
            vec![ElasticityCommand::RemoveNode {
                tier: Tier::Memory,
                node: node(2),
                operation: 1
            }]
        );
    }

    fn slow_summary(min_occupancy: f64) -> SummaryStats {
        let mut summary = memory_summary(0.4, 0.4, 1, 0);
        summary.memory.min_occupancy = TrackedMin::observed(min_occupancy, node(0));
        summary.avg_latency = 3. * Monitoring::default().slo_worst_ms;
        summary
    }

    #[test]
    fn latency_violation_adds_nodes_to_busy_memory_tier() {
        let mut busy = controller();
        let commands = evaluate(&mut busy, Instant::now(), &slow_summary(0.5), &counts(2));
        assert_eq!(
            commands,
            vec![ElasticityCommand::AddNodes {
                tier: Tier::Memory,
                number: 2
            }]
        );

        let mut mild = controller();
        let mut summary = slow_summary(0.5);
        summary.avg_latency = 1.1 * Monitoring::default().slo_worst_ms;
        let commands = evaluate(&mut mild, Instant::now(), &summary, &counts(2));
        assert_eq!(
            commands,
            vec![ElasticityCommand::AddNodes {
                tier: Tier::Memory,
                number: 1
            }]
        );
    }

    #[test]
    fn latency_violation_on_idle_nodes_adds_nothing() {
        let mut controller = controller();
        let summary = slow_summary(LATENCY_SCALE_UP_OCCUPANCY);
        assert!(evaluate(&mut controller, Instant::now(), &summary, &counts(2)).is_empty());
        assert_eq!(controller.state(Tier::Memory), ElasticityState::Idle);
    }
}
