//! Node-Info Rollup (spec.md §4.7): per-node summary of allocated cores,
//! memory and typed devices, derived from the partition row tables and
//! the node usage table rather than tracked independently.
//!
//! Rollup results are cached per node behind a monotonic tick counter
//! (`last_node_update` in [`NodeRollup`]); spec.md §9 leaves "when does a
//! rollup recompute" open, and `cres` resolves it as: the caller bumps
//! the tick whenever it mutates a row table or the node usage table, and
//! a rollup recomputes lazily the next time it's read with a newer tick
//! than the one it was built at (see `Engine::tick` in `engine.rs`).

use rayon::prelude::*;

use crate::bitset::Bitset;
use crate::cmi::CoreMapIndex;
use crate::device::DeviceSubsystem;
use crate::node::{DeviceAllocation, NodeUsageTable};
use crate::row::PartitionRowTable;

/// Rolled-up per-node view, cached until `last_node_update` advances.
#[derive(Debug, Clone)]
pub struct NodeRollup {
    pub alloc_cpus: Vec<u32>,
    pub alloc_memory: Vec<u64>,
    pub alloc_tres: Vec<DeviceAllocation>,
    pub last_node_update: u64,
}

impl NodeRollup {
    pub fn is_stale(&self, current_tick: u64) -> bool {
        current_tick != self.last_node_update
    }
}

/// Computes the rollup for every node, OR-ing every partition's row
/// bitmaps together and converting popcount to cpu units. Per spec.md
/// §4.7 and design note §9 ("thread scaling ambiguity"): the CMI always
/// counts physical cores, but a node whose `threads_per_core` is greater
/// than one reports cpus as hardware threads, so the raw core-bit count
/// is multiplied by `threads_per_core` before being capped at the node's
/// total logical cpu count (`cores * threads_per_core`).
pub fn compute(
    cmi: &CoreMapIndex,
    nut: &NodeUsageTable,
    partitions: &[PartitionRowTable],
    devices: &dyn DeviceSubsystem,
    current_tick: u64,
) -> NodeRollup {
    let node_count = cmi.node_count();
    let mut occupancy = Bitset::new(cmi.total_cores());
    for prt in partitions {
        for row in &prt.rows {
            occupancy.or_with(&row.row_bitmap);
        }
    }

    // Per-node popcounts are independent of one another once `occupancy`
    // is built, so large clusters roll up in parallel the same way the
    // packer's per-job work fans out across `rayon`'s pool.
    let (alloc_cpus, alloc_memory): (Vec<u32>, Vec<u64>) = (0..node_count)
        .into_par_iter()
        .map(|node| {
            let off = cmi.offset(node);
            let cores = cmi.cores(node);
            let used = (0..cores).filter(|&k| occupancy.test(off + k)).count().min(cores) as u32;
            let threads = nut.get(node).threads_per_core.max(1);
            let cpus = used.saturating_mul(threads).min(cores as u32 * threads);
            (cpus, nut.get(node).alloc_memory)
        })
        .unzip();

    let nodes: Vec<usize> = (0..node_count).collect();
    let mut alloc_tres = Vec::new();
    devices.set_node_tres_cnt(&nodes, &mut alloc_tres);

    NodeRollup {
        alloc_cpus,
        alloc_memory,
        alloc_tres,
        last_node_update: current_tick,
    }
}
