use anna_monitor::{
    config::{Capacities, Config, Monitoring, Policy, Replication, Threads},
    messages::Tier,
    nodes::monitoring::MonitoringNode,
    simulation::{NodeProfile, SimulatedCluster},
    transport::ChannelTransport,
};
use argh::FromArgs;
use std::path::PathBuf;

const PREFIX: &str = "anna";

#[derive(FromArgs)]
/// Runs the monitoring node against a simulated cluster
struct Args {
    #[argh(positional)]
    config_file: Option<PathBuf>,
    /// number of monitoring epochs to run
    #[argh(option, default = "10")]
    epochs: usize,
    /// initial number of memory nodes
    #[argh(option, default = "2")]
    memory_nodes: usize,
    /// initial number of disk nodes
    #[argh(option, default = "1")]
    ebs_nodes: usize,
    /// storage consumption of the initial nodes as a fraction of their capacity
    #[argh(option, default = "0.5")]
    load: f64,
}

fn main() -> eyre::Result<()> {
    if let Err(err) = set_up_logger() {
        eprintln!(
            "{:?}",
            eyre::Error::new(err).wrap_err("failed to set up logger")
        );
    }

    let args: Args = argh::from_env();

    let mut config = match &args.config_file {
        Some(path) => Config::from_file(path)?,
        None => default_config(),
    };
    // simulated epochs follow each other without delay
    config.monitoring.grace_period_secs = 0;

    let (transport, outbound) = ChannelTransport::channel();
    let (responses_tx, responses_rx) = smol::channel::unbounded();
    let node_id = format!("monitoring-{}", uuid::Uuid::new_v4());
    let mut node = MonitoringNode::new(
        &config,
        node_id,
        transport,
        responses_rx,
        PREFIX.to_owned(),
    );

    let mut cluster = SimulatedCluster::new(PREFIX, &config);
    for (tier, count, capacity, threads) in [
        (
            Tier::Memory,
            args.memory_nodes,
            config.capacities.memory_cap,
            config.threads.memory,
        ),
        (
            Tier::Disk,
            args.ebs_nodes,
            config.capacities.ebs_cap,
            config.threads.ebs,
        ),
    ] {
        for i in 0..count {
            let mut profile = NodeProfile::empty(tier)
                .with_key(format!("{:?}-hot-{}", tier, i), 10, 1000)
                .with_key(format!("{:?}-cold-{}", tier, i), 0, 1000);
            profile.storage_per_thread =
                (args.load * (capacity * 1_000_000) as f64 / threads.max(1) as f64) as u64;
            profile.occupancy = args.load;
            profile.accesses_per_thread = 10;
            cluster.add_node(profile)?;
        }
    }
    cluster.add_routing_node("routing-0")?;

    for _ in 0..args.epochs {
        let report = cluster.drive_epoch(&mut node, &outbound, &responses_tx)?;
        let summary = &report.stats.summary;
        println!(
            "epoch {}: memory {} node(s) at {:.2} avg / {:.2} max, ebs {} node(s) at {:.2} avg, \
             {} command(s), {} replication change(s), {} missing",
            report.epoch,
            summary.memory.node_count,
            summary.memory.avg_consumption_percentage,
            summary.memory.max_consumption_percentage,
            summary.ebs.node_count,
            summary.ebs.avg_consumption_percentage,
            report.commands.len(),
            report.replication_requests.len(),
            report.stats.missing,
        );
    }

    Ok(())
}

fn default_config() -> Config {
    Config {
        threads: Threads {
            memory: 1,
            ebs: 1,
            routing: 1,
            benchmark: 1,
        },
        replication: Replication {
            memory: 1,
            ebs: 1,
            local: 1,
            minimum: 1,
        },
        capacities: Capacities {
            memory_cap: 1,
            ebs_cap: 10,
        },
        policy: Policy {
            elasticity: true,
            tiering: true,
            selective_rep: true,
        },
        monitoring: Monitoring::default(),
    }
}

fn set_up_logger() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .chain(fern::log_file("monitor.log")?)
        .apply()?;
    Ok(())
}
