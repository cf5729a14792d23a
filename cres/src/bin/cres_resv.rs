//! Demonstration harness for the reservation planner: builds a
//! synthetic switch tree over a synthetic cluster and tests a single
//! reservation request against it.

use clap::Parser;
use cres::bitset::Bitset;
use cres::cmi::CoreMapIndex;
use cres::reservation::{resv_test, ReservationFlags, ReservationRequest, SwitchTree};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of nodes in the synthetic cluster
    #[arg(short, long, default_value_t = 8)]
    nodes: usize,

    /// Cores per node
    #[arg(short, long, default_value_t = 4)]
    cores: usize,

    /// Nodes per leaf switch (the cluster is evenly divided into leaves)
    #[arg(long, default_value_t = 4)]
    nodes_per_switch: usize,

    /// Nodes requested by the reservation
    #[arg(long, default_value_t = 2)]
    node_cnt: usize,

    /// Total cores requested (aggregate mode); omit for whole-node reservations
    #[arg(long)]
    core_cnt: Option<usize>,

    /// Use the FIRST_CORES strategy instead of topology-aware best-fit
    #[arg(long, default_value_t = false)]
    first_cores: bool,
}

fn main() {
    env_logger::init();
    let cli = Args::parse();

    let mut cmi = CoreMapIndex::empty();
    cmi.rebuild(&vec![cli.cores; cli.nodes]).expect("node list is well-formed");

    let leaves: Vec<Bitset> = (0..cli.nodes)
        .collect::<Vec<_>>()
        .chunks(cli.nodes_per_switch.max(1))
        .map(|chunk| Bitset::from_bits(cli.nodes, chunk.iter().copied()))
        .collect();
    let tree = SwitchTree { leaves };

    let req = ReservationRequest {
        node_cnt: cli.node_cnt,
        core_cnt: cli.core_cnt.map(|c| vec![c]).unwrap_or_default(),
        flags: ReservationFlags { first_cores: cli.first_cores },
    };
    let avail = Bitset::from_bits(cli.nodes, 0..cli.nodes);
    let excluded = Bitset::new(cmi.total_cores());

    match resv_test(&req, &avail, &cmi, Some(&tree), &excluded) {
        Some(sel) => {
            println!("reserved nodes: {:?}", sel.nodes.iter_set().collect::<Vec<_>>());
            println!("reserved cores (global bit positions): {:?}", sel.cores.iter_set().collect::<Vec<_>>());
        }
        None => println!("no reservation could be satisfied"),
    }
}
