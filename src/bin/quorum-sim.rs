use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use quorum_kit::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// quorum-sim: Run a scripted client session against an in-process cluster.
///
/// Writes, overwrites concurrently, resolves and deletes one key, printing
/// every client reply and the object each replica ends up holding.
#[derive(Parser)]
#[command(name = "quorum-sim", version, about, long_about = None)]
struct Cli {
    /// Number of nodes in the cluster.
    #[arg(long, default_value = "5")]
    nodes: usize,

    /// Replicas per key.
    #[arg(short = 'n', long, default_value = "3")]
    n_val: usize,

    /// Read quorum.
    #[arg(short, long, default_value = "2")]
    r: usize,

    /// Write quorum.
    #[arg(short, long, default_value = "2")]
    w: usize,

    /// Key to operate on.
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Node index that fails every request (repeatable).
    #[arg(long = "fail")]
    failing: Vec<usize>,

    /// Node index that never answers (repeatable).
    #[arg(long = "down")]
    unreachable: Vec<usize>,

    /// Base reply delay of healthy nodes, in milliseconds.
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Extra random delay per node, up to this many milliseconds.
    #[arg(long, default_value = "0")]
    jitter_ms: u64,

    /// Seed for the jitter.
    #[arg(long)]
    seed: Option<u64>,

    /// Primary deadline for reads and writes, in milliseconds.
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Log coordinator internals.
    #[arg(short, long)]
    verbose: bool,
}

type SimCoordinator = Coordinator<String, MemoryCluster<String>, MemoryCluster<String>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.nodes == 0 {
        bail!("the cluster needs at least one node");
    }

    let cluster = MemoryCluster::<String>::new(cli.nodes, cli.n_val);
    configure_nodes(&cluster, &cli)?;

    let timeout = Duration::from_millis(cli.timeout_ms);
    let config = CoordinatorConfig::builder()
        .n_val(cli.n_val.min(cli.nodes))
        .read_quorum(Quorum::Exactly(cli.r))
        .write_quorum(Quorum::Exactly(cli.w))
        .read_timeout(timeout)
        .write_timeout(timeout)
        .build()
        .context("invalid quorum configuration")?;
    let coordinator = Coordinator::new(cluster.clone(), cluster.clone(), config)?;

    let replicas = cluster.resolve_replicas(&cli.key);
    println!(
        "key {:?} lives on {}",
        cli.key,
        replicas.iter().map(Location::as_str).collect::<Vec<_>>().join(", ")
    );

    run_session(&coordinator, &cli.key).await?;

    // A last read with repair, waited on until its repairs are sent.
    let handle = coordinator.spawn_read(&cli.key, coordinator.config().read.clone())?;
    handle.finished().await?;

    println!();
    println!("replica state:");
    for location in &replicas {
        match cluster.object_at(location, &cli.key).await {
            Some(obj) => println!("  {location}: context {} siblings {}", obj.context(), obj.sibling_count()),
            None => println!("  {location}: <empty>"),
        }
    }
    Ok(())
}

fn configure_nodes(cluster: &MemoryCluster<String>, cli: &Cli) -> Result<()> {
    let locations = cluster.locations();
    let location = |index: usize| {
        locations
            .get(index)
            .with_context(|| format!("node index {index} out of range (cluster has {})", locations.len()))
    };

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    if cli.delay_ms > 0 || cli.jitter_ms > 0 {
        for loc in locations {
            let jitter = if cli.jitter_ms > 0 {
                rng.gen_range(0..=cli.jitter_ms)
            } else {
                0
            };
            let delay = Duration::from_millis(cli.delay_ms + jitter);
            info!(location = %loc, ?delay, "delaying replies");
            cluster.set_behavior(loc, Behavior::Delayed(delay));
        }
    }

    for &index in &cli.failing {
        cluster.set_behavior(location(index)?, Behavior::Failing);
    }
    for &index in &cli.unreachable {
        cluster.set_behavior(location(index)?, Behavior::Unreachable);
    }
    Ok(())
}

async fn run_session(coordinator: &SimCoordinator, key: &str) -> Result<()> {
    println!();
    println!("put v1 (blind)");
    let reply = coordinator.put(key, "v1".into(), VersionVector::new()).await?;
    println!("  -> {reply:?}");

    let ctx = read(coordinator, key).await?;

    println!("put left and right concurrently, both from {ctx}");
    let (left, right) = tokio::join!(
        coordinator.put(key, "left".into(), ctx.clone()),
        coordinator.put(key, "right".into(), ctx.clone()),
    );
    println!("  -> {:?} / {:?}", left?, right?);

    let ctx = read(coordinator, key).await?;

    println!("put resolved from {ctx}");
    let reply = coordinator.put(key, "resolved".into(), ctx).await?;
    println!("  -> {reply:?}");

    let ctx = read(coordinator, key).await?;

    println!("delete from {ctx}");
    let reply = coordinator.delete(key, ctx).await?;
    println!("  -> {reply:?}");

    read(coordinator, key).await?;
    Ok(())
}

/// Read `key`, print the outcome and return the context for the next write.
async fn read(coordinator: &SimCoordinator, key: &str) -> Result<VersionVector> {
    let reply = coordinator.get(key).await?;
    let ctx = match &reply {
        ReadReply::Ok { values, context } => {
            println!("get -> {values:?} at {context}");
            context.clone()
        }
        ReadReply::NotFound { context } => {
            println!("get -> not found at {context}");
            context.clone()
        }
        ReadReply::Acknowledged => {
            println!("get -> acknowledged");
            VersionVector::new()
        }
        ReadReply::Timeout => {
            println!("get -> timeout");
            VersionVector::new()
        }
    };
    Ok(ctx)
}
