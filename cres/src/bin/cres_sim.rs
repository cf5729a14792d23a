//! A small demonstration harness for the node-selection engine: builds a
//! cluster from a handful of CLI flags, then either replays a CSV trace of
//! lifecycle operations or places a batch of synthetic single-cpu jobs one
//! at a time, and reports the resulting rollup.

use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use rand::Rng;

use cres::engine::{ClusterConfig, Engine};
use cres::job::NodeReq;
use cres::lifecycle::RmJobMode;
use cres::node::NodeConfig;
use cres::placement::{JobRequest, PlacementMode};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of nodes in the synthetic cluster
    #[arg(short, long, default_value_t = 4)]
    nodes: usize,

    /// Cores per node
    #[arg(short, long, default_value_t = 4)]
    cores: usize,

    /// Memory per node, in MB
    #[arg(short, long, default_value_t = 16_000)]
    memory: u64,

    /// Number of single-cpu jobs to place when no trace is given
    #[arg(short, long, default_value_t = 8)]
    jobs: u32,

    /// Rows (oversubscription factor) for the default partition
    #[arg(long, default_value_t = 1)]
    rows: usize,

    /// Path to a CSV trace of lifecycle operations (header row, then one
    /// op per line); columns: op,job_id,a,b. `op` is one of add/remove/
    /// expand/suspend/resume; `a`/`b` mean: add -> nodes,cpus_per_node;
    /// remove -> mode(0=suspend,1=terminate),_; expand -> to_job_id,_;
    /// suspend/resume -> indf(0/1),_. When omitted, a synthetic
    /// single-cpu-per-job workload is generated instead.
    #[arg(long, value_parser = clap::value_parser!(PathBuf))]
    trace: Option<PathBuf>,
}

enum Op {
    Add { job_id: u32, nodes: usize, cpus_per_node: u32 },
    Remove { job_id: u32, terminate: bool },
    Expand { from: u32, to: u32 },
    Suspend { job_id: u32, indf: bool },
    Resume { job_id: u32 },
}

/// Reads a trace CSV in the `minimalloc`-style layout this crate's own
/// corpus favors: a header line, then one record per line, comma
/// separated, numeric fields only.
fn read_trace(path: &PathBuf) -> Result<Vec<Op>, Box<dyn std::error::Error>> {
    let fd = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(fd);
    let mut ops = Vec::new();
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let op = fields[0];
        let job_id: u32 = fields[1].parse()?;
        let a: i64 = fields.get(2).map(|s| s.parse()).transpose()?.unwrap_or(0);
        let b: i64 = fields.get(3).map(|s| s.parse()).transpose()?.unwrap_or(0);
        ops.push(match op {
            "add" => Op::Add { job_id, nodes: a.max(1) as usize, cpus_per_node: b.max(1) as u32 },
            "remove" => Op::Remove { job_id, terminate: a != 0 },
            "expand" => Op::Expand { from: job_id, to: a as u32 },
            "suspend" => Op::Suspend { job_id, indf: a != 0 },
            "resume" => Op::Resume { job_id },
            other => panic!("unknown trace op {other}"),
        });
    }
    Ok(ops)
}

fn run_trace(engine: &mut Engine, candidate: &cres::bitset::Bitset, ops: Vec<Op>) {
    for op in ops {
        match op {
            Op::Add { job_id, nodes, cpus_per_node } => {
                let req = JobRequest {
                    min_nodes: nodes,
                    max_nodes: nodes,
                    required_nodes: None,
                    cpus_per_node,
                    memory_per_node: 128,
                    node_req: NodeReq::Available,
                    whole_node: false,
                    contiguous: true,
                };
                match engine.job_test(job_id, "default", &req, candidate, PlacementMode::RunNow, &[], None) {
                    Ok(placement) => match engine.add_job_to_res("default", placement.job) {
                        Ok(()) => log::info!("job {job_id}: added"),
                        Err(e) => log::warn!("job {job_id}: placed but failed to commit: {e}"),
                    },
                    Err(e) => log::warn!("job {job_id}: no placement found: {e}"),
                }
            }
            Op::Remove { job_id, terminate } => {
                let mode = if terminate { RmJobMode::Terminate } else { RmJobMode::Suspend };
                if let Err(e) = engine.rm_job_from_res("default", job_id, mode, true) {
                    log::warn!("job {job_id}: remove failed: {e}");
                }
            }
            Op::Expand { from, to } => {
                if let Err(e) = engine.job_expand("default", from, to) {
                    log::warn!("expand job {from} into {to} failed: {e}");
                }
            }
            Op::Suspend { job_id, indf } => {
                if let Err(e) = engine.job_suspend("default", job_id, indf) {
                    log::warn!("job {job_id}: suspend failed: {e}");
                }
            }
            Op::Resume { job_id } => {
                if let Err(e) = engine.job_resume("default", job_id) {
                    log::warn!("job {job_id}: resume failed: {e}");
                }
            }
        }
    }
}

fn run_synthetic(engine: &mut Engine, candidate: &cres::bitset::Bitset, job_count: u32) {
    let mut rng = rand::thread_rng();
    for job_id in 0..job_count {
        // Vary the memory request a little so the demo isn't perfectly
        // uniform -- real workloads never are.
        let memory_per_node = rng.gen_range(64..=256);
        let req = JobRequest {
            min_nodes: 1,
            max_nodes: 1,
            required_nodes: None,
            cpus_per_node: 1,
            memory_per_node,
            node_req: NodeReq::Available,
            whole_node: false,
            contiguous: true,
        };
        match engine.job_test(job_id, "default", &req, candidate, PlacementMode::TestOnly, &[], None) {
            Ok(placement) => {
                let node_bitmap = placement.node_bitmap.clone();
                if let Err(e) = engine.add_job_to_res("default", placement.job) {
                    log::warn!("job {job_id}: placed but failed to commit: {e}");
                } else {
                    log::info!("job {job_id}: placed on nodes {:?}", node_bitmap.iter_set().collect::<Vec<_>>());
                }
            }
            Err(e) => log::warn!("job {job_id}: no placement found: {e}"),
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Args::parse();

    let config = ClusterConfig {
        nodes: (0..cli.nodes)
            .map(|i| NodeConfig::new(format!("node{i}"), cli.cores, cli.memory))
            .collect(),
        partitions: vec![("default".to_string(), cli.rows)],
    };

    let mut engine = Engine::new(&config).expect("cluster config is well-formed");
    let candidate = cres::bitset::Bitset::from_bits(cli.nodes, 0..cli.nodes);

    match &cli.trace {
        Some(path) => {
            let ops = read_trace(path).expect("trace file is well-formed");
            run_trace(&mut engine, &candidate, ops);
        }
        None => run_synthetic(&mut engine, &candidate, cli.jobs),
    }

    let rollup = engine.nodeinfo_set_all();
    for (node, cpus) in rollup.alloc_cpus.iter().enumerate() {
        println!("node{node}: {cpus} cores allocated, {} bytes memory", rollup.alloc_memory[node]);
    }
}
