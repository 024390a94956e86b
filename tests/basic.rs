use anna_monitor::{
    config::{Capacities, Config, Monitoring, Policy, Replication, Threads},
    messages::{Join, Notify, Tier},
    nodes::monitoring::{
        create_new_replication_vector, ElasticityCommand, ElasticityState, EpochReport,
        MonitoringNode,
    },
    simulation::{NodeProfile, SimulatedCluster},
    topics::NodeAddress,
    transport::{ChannelTransport, OutboundMessage},
    ClientKey,
};
use pretty_assertions::assert_eq;
use smol::channel::{Receiver, Sender};

const PREFIX: &str = "anna";

struct Harness {
    node: MonitoringNode<ChannelTransport>,
    cluster: SimulatedCluster,
    outbound: Receiver<OutboundMessage>,
    responses: Sender<String>,
}

impl Harness {
    fn new(config: &Config) -> Self {
        let _ = set_up_logger();

        let (transport, outbound) = ChannelTransport::channel();
        let (responses, responses_rx) = smol::channel::unbounded();
        let node = MonitoringNode::new(
            config,
            "test-monitor".into(),
            transport,
            responses_rx,
            PREFIX.into(),
        );
        Self {
            node,
            cluster: SimulatedCluster::new(PREFIX, config),
            outbound,
            responses,
        }
    }

    fn epoch(&mut self) -> EpochReport {
        self.cluster
            .drive_epoch(&mut self.node, &self.outbound, &self.responses)
            .unwrap()
    }

    fn messages_on(&self, suffix: &str) -> usize {
        self.cluster
            .history()
            .iter()
            .filter(|m| m.topic.contains(suffix))
            .count()
    }
}

fn config() -> Config {
    Config {
        threads: Threads {
            memory: 1,
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
            ebs_cap: 10,
        },
        policy: Policy {
            elasticity: false,
            tiering: false,
            selective_rep: false,
        },
        monitoring: Monitoring {
            grace_period_secs: 0,
            ..Default::default()
        },
    }
}

fn memory_node(load: f64, occupancy: f64) -> NodeProfile {
    let mut profile = NodeProfile::empty(Tier::Memory);
    profile.storage_per_thread = (load * 1_000_000.) as u64;
    profile.occupancy = occupancy;
    profile.accesses_per_thread = 3;
    profile
}

#[test]
fn empty_node_keeps_access_mean() {
    let mut harness = Harness::new(&config());

    let mut busy = memory_node(0.1, 0.1);
    for i in 0..10 {
        busy = busy.with_key(format!("key-{}", i), 5, 10);
    }
    harness.cluster.add_node(busy).unwrap();
    harness.cluster.add_node(memory_node(0.1, 0.1)).unwrap();

    let report = harness.epoch();
    let summary = &report.stats.summary;
    assert_eq!(summary.key_access_cnt, 10);
    assert_eq!(summary.key_access_mean, 5.);
    assert_eq!(summary.key_access_std, 0.);
    assert_eq!(summary.memory.node_count, 2);
    assert_eq!(summary.memory.total_access, 6);
    assert_eq!(report.stats.missing, 0);
    assert_eq!(report.stats.malformed, 0);
}

#[test]
fn scale_up_is_limited_to_batch_size() {
    let mut config = config();
    config.policy.elasticity = true;
    let mut harness = Harness::new(&config);
    harness.cluster.add_node(memory_node(0.8, 0.8)).unwrap();
    harness.cluster.add_node(memory_node(0.5, 0.5)).unwrap();

    let report = harness.epoch();
    assert_eq!(report.stats.summary.memory.max_consumption_percentage, 0.8);
    assert_eq!(
        report.commands,
        vec![ElasticityCommand::AddNodes {
            tier: Tier::Memory,
            number: 1
        }]
    );
    assert_eq!(
        harness.node.elasticity().state(Tier::Memory),
        ElasticityState::InFlight
    );
    assert_eq!(harness.messages_on("management/add_nodes"), 1);

    // the requested node joined between the epochs
    assert_eq!(harness.cluster.tier_nodes(Tier::Memory).len(), 3);
    let report = harness.epoch();
    assert!(report.commands.is_empty());
    assert_eq!(report.stats.summary.memory.node_count, 3);
    assert_eq!(
        harness.node.elasticity().state(Tier::Memory),
        ElasticityState::Acknowledged
    );
}

#[test]
fn heavy_load_requests_at_most_one_batch() {
    let mut config = config();
    config.policy.elasticity = true;
    let mut harness = Harness::new(&config);
    for _ in 0..4 {
        harness.cluster.add_node(memory_node(0.9, 0.9)).unwrap();
    }

    let report = harness.epoch();
    assert_eq!(report.stats.summary.memory.required_nodes, 6);
    assert_eq!(
        report.commands,
        vec![ElasticityCommand::AddNodes {
            tier: Tier::Memory,
            number: config.monitoring.node_addition_batch_size
        }]
    );

    // the epoch that observes the new nodes requests nothing
    let report = harness.epoch();
    assert!(report.commands.is_empty());
    assert_eq!(harness.messages_on("management/add_nodes"), 1);
}

#[test]
fn minimum_tier_size_prevents_removal() {
    let mut config = config();
    config.policy.elasticity = true;
    config.monitoring.min_memory_tier_size = 2;
    let mut harness = Harness::new(&config);
    harness.cluster.add_node(memory_node(0.05, 0.1)).unwrap();
    harness.cluster.add_node(memory_node(0.05, 0.05)).unwrap();

    for _ in 0..3 {
        let report = harness.epoch();
        assert!(report.stats.summary.memory.avg_consumption_percentage < 0.3);
        assert!(report.commands.is_empty());
    }
    assert_eq!(harness.messages_on("self_depart"), 0);
    assert_eq!(harness.cluster.tier_nodes(Tier::Memory).len(), 2);
}

#[test]
fn underutilized_node_departs_once() {
    let mut config = config();
    config.policy.elasticity = true;
    let mut harness = Harness::new(&config);
    let kept = harness.cluster.add_node(memory_node(0.05, 0.1)).unwrap();
    let idle = harness.cluster.add_node(memory_node(0.05, 0.05)).unwrap();

    let report = harness.epoch();
    assert_eq!(
        report.stats.summary.memory.min_occupancy.identity(),
        Some(&idle)
    );
    assert_eq!(
        report.commands,
        vec![ElasticityCommand::RemoveNode {
            tier: Tier::Memory,
            node: idle.clone(),
            operation: 0
        }]
    );

    // the node handed off its data and was released after the epoch
    assert_eq!(harness.cluster.tier_nodes(Tier::Memory), vec![kept]);
    assert_eq!(harness.node.hash_rings().load().node_count(Tier::Memory), 1);
    assert_eq!(harness.node.elasticity().departing().count(), 0);

    for _ in 0..3 {
        assert!(harness.epoch().commands.is_empty());
    }
    assert_eq!(harness.messages_on("self_depart"), 1);
    assert_eq!(harness.messages_on("management/remove_node"), 1);
}

#[test]
fn replication_change_waits_for_every_owner() {
    let mut config = config();
    config.policy.tiering = true;
    config.replication = Replication {
        memory: 0,
        ebs: 1,
        local: 1,
        minimum: 1,
    };
    let mut harness = Harness::new(&config);
    let key = ClientKey::from("hot");

    harness
        .cluster
        .add_node(memory_node(0.01, 0.1).with_key(key.clone(), 5, 100))
        .unwrap();
    let disk = harness
        .cluster
        .add_node(NodeProfile::empty(Tier::Disk))
        .unwrap();
    harness.cluster.add_routing_node("routing-0").unwrap();
    harness.cluster.mute(&disk);

    let old = create_new_replication_vector(0, 1, 1, 1);
    let promoted = create_new_replication_vector(1, 0, 1, 1);

    // the update goes to the disk owner, the new memory owner and the routing node
    let report = harness.epoch();
    assert_eq!(report.replication_requests.get(&key), Some(&promoted));
    assert_eq!(harness.messages_on("replication_change"), 3);
    assert_eq!(harness.node.replication().replication(&key), old);
    assert!(harness.node.replication().is_pending(&key));

    // two acknowledgements arrive, the muted disk node stays silent
    harness.epoch();
    assert_eq!(harness.node.replication().replication(&key), old);
    assert!(harness.node.replication().is_pending(&key));
    assert_eq!(harness.messages_on("server_replication_change"), 3);

    harness.cluster.unmute(&disk);
    harness.epoch();
    assert_eq!(harness.node.replication().replication(&key), old);

    harness.epoch();
    assert_eq!(harness.node.replication().replication(&key), promoted);
    assert!(!harness.node.replication().is_pending(&key));
    assert_eq!(harness.cluster.stored_replication(&key), Some(promoted));
}

#[test]
fn run_loop_applies_membership_until_inputs_close() {
    let _ = set_up_logger();

    let config = config();
    let (transport, _outbound) = ChannelTransport::channel();
    let (_responses, responses_rx) = smol::channel::unbounded();
    let node = MonitoringNode::new(&config, "m".into(), transport, responses_rx, PREFIX.into());
    let rings = node.hash_rings();

    let (notify, notify_rx) = smol::channel::unbounded();
    let (depart_done, depart_done_rx) = smol::channel::unbounded::<String>();
    let (feedback, feedback_rx) = smol::channel::unbounded::<String>();

    let join = Notify::Join(Join {
        tier: Tier::Memory,
        node: NodeAddress::new("34.0.0.1", "10.0.0.1"),
        join_count: 0,
    });
    notify
        .try_send(serde_json::to_string(&join).unwrap())
        .unwrap();
    notify.try_send("not a notification".to_owned()).unwrap();
    drop((notify, depart_done, feedback));

    smol::block_on(node.run(notify_rx, depart_done_rx, feedback_rx)).unwrap();
    assert_eq!(rings.load().node_count(Tier::Memory), 1);
}

fn set_up_logger() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
