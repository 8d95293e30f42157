//! NUMA locality benchmark driver.
//!
//! For each placement scenario (home node, random placement, remote
//! node) it allocates columns on the chosen node, generates rows
//! through the node-pinned schedulers, runs repeated timed read passes
//! from node 0, and prints the trimmed mean latency plus the slowdown
//! factors relative to the home-node scenario.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{info, warn};

use strata_core::{generate, mmap_factory, node_alloc_factory, read_pass, registry, Column};
use strata_core::{AccessError, ChunkFactory};
use strata_io::{processors_per_node, Platform};

/// Rows in one gigabyte of f64 data.
const ROWS_PER_GIGABYTE: f64 = (1u64 << 27) as f64;

#[derive(Parser, Debug)]
#[command(author, version, about = "NUMA locality benchmark for chunked f64 columns")]
struct Args {
    /// Data size to allocate, in gigabytes.
    #[arg(short, long, default_value_t = 1.0)]
    gigabytes: f64,

    /// Timed read passes per scenario (best and worst are discarded).
    #[arg(short, long, default_value_t = 30)]
    passes: usize,

    /// Target chunk capacity in rows, rounded up to a power of two.
    #[arg(short, long, default_value_t = 1 << 20)]
    chunk_capacity: usize,

    /// Allocation backend.
    #[arg(short, long, value_enum, default_value_t = Backend::Numa)]
    backend: Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Anonymous mapping, placed by the kernel's first-touch policy.
    Mmap,
    /// Node-bound allocation through mbind.
    Numa,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    HomeNode,
    RandomNode,
    RemoteNode,
}

impl Scenario {
    fn label(self) -> &'static str {
        match self {
            Scenario::HomeNode => "home",
            Scenario::RandomNode => "random",
            Scenario::RemoteNode => "remote",
        }
    }

    /// Node columns are allocated on; `None` lets the OS place them.
    fn allocation_node(self, node_count: usize) -> Option<usize> {
        match self {
            Scenario::HomeNode => Some(0),
            Scenario::RandomNode => None,
            Scenario::RemoteNode => Some(node_count / 2),
        }
    }

    /// Reads always run from node 0, so the home scenario is local and
    /// the remote one crosses the interconnect.
    fn read_node(self) -> usize {
        0
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let platform = strata_io::current();
    println!("NUMA available: {}", platform.numa_available());
    if !platform.numa_available() {
        println!("single-node machine, nothing to compare; exiting");
        return;
    }
    println!("NUMA node count: {}", platform.node_count());

    let rows = (ROWS_PER_GIGABYTE * args.gigabytes) as usize;
    info!(
        "benchmark: {} rows, {} passes, chunk capacity {}, backend {:?}",
        rows, args.passes, args.chunk_capacity, args.backend
    );

    if let Err(e) = run(&args, platform, rows) {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args, platform: Arc<dyn Platform>, rows: usize) -> Result<(), AccessError> {
    let random = run_scenario(args, Arc::clone(&platform), Scenario::RandomNode, rows)?;
    let remote = run_scenario(args, Arc::clone(&platform), Scenario::RemoteNode, rows)?;
    let home = run_scenario(args, platform, Scenario::HomeNode, rows)?;

    let factor = |d: Duration| d.as_secs_f64() / home.as_secs_f64();
    println!(
        "home: {home:?} | random: {random:?} (factor {:.2}) | remote: {remote:?} (factor {:.2})",
        factor(random),
        factor(remote),
    );
    Ok(())
}

fn run_scenario(
    args: &Args,
    platform: Arc<dyn Platform>,
    scenario: Scenario,
    rows: usize,
) -> Result<Duration, AccessError> {
    let node_count = platform.node_count();
    let allocation_node = scenario.allocation_node(node_count);
    info!(
        "scenario {}: allocating {} rows on node {:?}",
        scenario.label(),
        rows,
        allocation_node
    );

    let columns = allocate_columns(args, Arc::clone(&platform), allocation_node, rows)?;

    // Placement is only provable for the node-bound backend; with the
    // mmap backend it depends on where first touch actually ran, which
    // best-effort pinning cannot guarantee.
    if let Some(node) = allocation_node {
        for column in &columns {
            match column.verify_node_affinity(Some(node)) {
                Ok(()) => {}
                Err(e @ AccessError::AffinityViolation { .. }) if args.backend == Backend::Mmap => {
                    warn!("scenario {}: {e}", scenario.label());
                }
                Err(e) => return Err(e),
            }
        }
    }

    let reader = registry().scheduler_for(scenario.read_node())?;
    let mut samples = Vec::with_capacity(args.passes);
    for pass in 0..args.passes {
        let start = Instant::now();
        for column in &columns {
            read_pass(column, &reader)?;
        }
        let elapsed = start.elapsed();
        samples.push(elapsed);
        info!("scenario {} pass {pass}: {elapsed:?}", scenario.label());
    }

    let mean = trimmed_mean(&mut samples);
    println!(
        "{}: {} passes, trimmed mean {mean:?}",
        scenario.label(),
        args.passes
    );
    Ok(mean)
}

/// One column per logical processor on the target node (or per
/// processor overall when unconstrained), rows split evenly with the
/// last column absorbing the remainder.
fn allocate_columns(
    args: &Args,
    platform: Arc<dyn Platform>,
    allocation_node: Option<usize>,
    rows: usize,
) -> Result<Vec<Column>, AccessError> {
    let column_count = match allocation_node {
        Some(node) => processors_per_node(platform.as_ref())[node].max(1),
        None => platform.processor_count().max(1),
    };

    let factory: ChunkFactory = match (args.backend, allocation_node) {
        (Backend::Numa, Some(node)) => node_alloc_factory(Arc::clone(&platform), node),
        _ => mmap_factory(Arc::clone(&platform)),
    };

    let scheduler = registry().scheduler(allocation_node)?;
    let rows_per_column = rows.div_ceil(column_count);
    let mut remaining = rows;

    let start = Instant::now();
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let n = rows_per_column.min(remaining);
        remaining -= n;
        let mut column = Column::new(args.chunk_capacity, Arc::clone(&factory));
        generate(&mut column, n, &scheduler)?;
        columns.push(column);
    }
    info!("allocated and generated {rows} rows in {:?}", start.elapsed());

    Ok(columns)
}

/// Mean after dropping the single best and worst samples, when there
/// are enough samples for that to make sense.
fn trimmed_mean(samples: &mut [Duration]) -> Duration {
    samples.sort_unstable();
    let trimmed = if samples.len() > 2 {
        &samples[1..samples.len() - 1]
    } else {
        &samples[..]
    };
    mean(trimmed)
}

fn mean(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = samples.iter().sum();
    total / samples.len() as u32
}
