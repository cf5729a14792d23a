//! Placement: the "select and test" contract spec.md §4.4 calls a shared
//! "common" routine delegated to by the real scheduler. This module
//! fixes that contract for `cres`: given a request and a candidate node
//! set, pick nodes and cores for a new [`JobResources`].

use crate::bitset::Bitset;
use crate::cmi::CoreMapIndex;
use crate::error::{CresError, Result};
use crate::job::{JobId, JobResources, NodeReq};
use crate::node::NodeUsageTable;
use crate::row::PartitionRowTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    /// May ignore current occupancy, testing against configured capacity.
    TestOnly,
    /// Must select against current row bitmaps.
    RunNow,
    /// Additionally simulates preemption of candidate preemptees.
    WillRun,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub min_nodes: usize,
    pub max_nodes: usize,
    /// Nodes the job must include, if any.
    pub required_nodes: Option<Bitset>,
    pub cpus_per_node: u32,
    pub memory_per_node: u64,
    pub node_req: NodeReq,
    pub whole_node: bool,
    /// Prefer the fewest number of nodes that still satisfy demand.
    pub contiguous: bool,
}

/// Result of a successful placement test: the selected node set and a
/// fully populated [`JobResources`] ready for `add_job_to_res`.
#[derive(Debug, Clone)]
pub struct Placement {
    pub node_bitmap: Bitset,
    pub job: JobResources,
}

/// Implements spec.md §4.4's `job_test`/`select` contract.
#[allow(clippy::too_many_arguments)]
pub fn select_nodes(
    job_id: JobId,
    req: &JobRequest,
    candidate: &Bitset,
    cmi: &CoreMapIndex,
    nut: &NodeUsageTable,
    partition: &PartitionRowTable,
    mode: PlacementMode,
    preemptees: &[JobId],
    preemptee_jobs: &dyn crate::row::JobLookup,
    exclude_cores: &Bitset,
) -> Result<Placement> {
    if req.min_nodes == 0 || req.max_nodes < req.min_nodes {
        return Err(CresError::InvalidInput(
            "min_nodes/max_nodes misconfigured".into(),
        ));
    }

    // A core only blocks a new job once it's already used by every
    // available row (`partition.num_rows`) -- fewer users than that and
    // there is still an oversubscription lane the packer can place the
    // new job into, per spec.md §3's row model. TEST_ONLY ignores
    // current occupancy entirely, testing against configured capacity.
    let mut counts = vec![0u32; cmi.total_cores()];
    if mode != PlacementMode::TestOnly {
        for row in &partition.rows {
            for bit in row.row_bitmap.iter_set() {
                counts[bit] += 1;
            }
        }
    }
    if mode == PlacementMode::WillRun {
        // Simulate freeing the preemptees' cores.
        for &pid in preemptees {
            if let Some(job) = preemptee_jobs.get(pid) {
                for bit in job.project_to_cmi(cmi).iter_set() {
                    counts[bit] = counts[bit].saturating_sub(1);
                }
            }
        }
    }
    let num_rows = partition.num_rows.max(1) as u32;
    for bit in exclude_cores.iter_set() {
        counts[bit] = num_rows;
    }

    let mut selected_nodes = Vec::new();
    if let Some(req_nodes) = &req.required_nodes {
        for n in req_nodes.iter_set() {
            if !candidate.test(n) {
                return Err(CresError::NoFit(format!(
                    "required node {n} not in candidate set"
                )));
            }
            selected_nodes.push(n);
        }
    }

    // Tie-break: lower-index node first. Fewer nodes preferred when
    // `contiguous` -- we stop as soon as demand is met rather than
    // spreading across every eligible node.
    for n in candidate.iter_set() {
        if selected_nodes.len() >= req.max_nodes {
            break;
        }
        if selected_nodes.contains(&n) {
            continue;
        }
        let free_on_node = free_cores_on_node(n, cmi, &counts, num_rows);
        let mem_ok = nut.get(n).available_memory() >= req.memory_per_node;
        let cpu_ok = if req.whole_node {
            free_on_node.len() == cmi.cores(n)
        } else {
            free_on_node.len() as u32 >= req.cpus_per_node
        };
        if mem_ok && cpu_ok {
            selected_nodes.push(n);
            if req.contiguous && selected_nodes.len() >= req.min_nodes {
                break;
            }
        }
    }
    selected_nodes.sort_unstable();

    if selected_nodes.len() < req.min_nodes {
        return Err(CresError::NoFit(format!(
            "only {} of {} required nodes could be placed",
            selected_nodes.len(),
            req.min_nodes
        )));
    }

    let node_bitmap = Bitset::from_bits(cmi.node_count(), selected_nodes.iter().copied());
    let job = build_job_resources(job_id, req, &selected_nodes, cmi, &counts, num_rows)?;

    Ok(Placement { node_bitmap, job })
}

/// Free cores on `node`, ordered least-loaded first so that a new job
/// spreads across distinct physical cores before doubling up on an
/// already-used one -- the packer still decides the actual row, but a
/// good selection here keeps row count low.
fn free_cores_on_node(node: usize, cmi: &CoreMapIndex, counts: &[u32], num_rows: u32) -> Vec<usize> {
    let off = cmi.offset(node);
    let mut free: Vec<usize> = (0..cmi.cores(node)).filter(|&k| counts[off + k] < num_rows).collect();
    free.sort_by_key(|&k| (counts[off + k], k));
    free
}

fn build_job_resources(
    job_id: JobId,
    req: &JobRequest,
    nodes: &[usize],
    cmi: &CoreMapIndex,
    counts: &[u32],
    num_rows: u32,
) -> Result<JobResources> {
    let mut per_node_cores = Vec::with_capacity(nodes.len());
    let mut core_bits: Vec<Vec<usize>> = Vec::with_capacity(nodes.len());
    for &n in nodes {
        let mut free = free_cores_on_node(n, cmi, counts, num_rows);
        let take = if req.whole_node {
            cmi.cores(n)
        } else {
            req.cpus_per_node as usize
        };
        if free.len() < take {
            return Err(CresError::NoFit(format!(
                "node {n} lacks {take} free cores"
            )));
        }
        per_node_cores.push(cmi.cores(n));
        core_bits.push(free.into_iter().take(take).collect());
    }

    let total_core_len: usize = per_node_cores.iter().sum();
    let mut core_bitmap = Bitset::new(total_core_len);
    let mut running = 0usize;
    for (rank, bits) in core_bits.iter().enumerate() {
        for &k in bits {
            core_bitmap.set(running + k);
        }
        running += per_node_cores[rank];
    }

    let ncpus = core_bits.iter().map(|b| b.len() as u32).sum();
    let mut job = JobResources {
        id: job_id,
        node_bitmap: Bitset::from_bits(cmi.node_count(), nodes.iter().copied()),
        cpus: core_bits.iter().map(|b| b.len() as u32).collect(),
        cpus_used: vec![0; nodes.len()],
        memory_allocated: vec![req.memory_per_node; nodes.len()],
        memory_used: vec![0; nodes.len()],
        core_bitmap,
        node_req: req.node_req,
        ncpus,
        whole_node: req.whole_node,
        total_cpus: ncpus,
        local_offset: vec![],
        suspended: false,
    };
    job.retile(&per_node_cores);
    job.validate()?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cmi4x2() -> CoreMapIndex {
        let mut c = CoreMapIndex::empty();
        c.rebuild(&[2, 2, 2, 2]).unwrap();
        c
    }

    #[test]
    fn run_now_avoids_occupied_cores() {
        let cmi = cmi4x2();
        let mut nut = NodeUsageTable::new();
        nut.rebuild(&[
            crate::node::NodeConfig::new("n0", 2, 10_000),
            crate::node::NodeConfig::new("n1", 2, 10_000),
            crate::node::NodeConfig::new("n2", 2, 10_000),
            crate::node::NodeConfig::new("n3", 2, 10_000),
        ]);
        // Both rows already use node 0 / core 0 -- with 2 rows configured,
        // that core is now fully oversubscribed and must be skipped.
        let mut partition = PartitionRowTable::new(2, cmi.total_cores());
        partition.rows[0].row_bitmap.set(0);
        partition.rows[1].row_bitmap.set(0);

        let req = JobRequest {
            min_nodes: 1,
            max_nodes: 1,
            required_nodes: None,
            cpus_per_node: 1,
            memory_per_node: 100,
            node_req: NodeReq::Available,
            whole_node: false,
            contiguous: true,
        };
        let candidate = Bitset::from_bits(4, [0]);
        let empty: HashMap<JobId, JobResources> = HashMap::new();
        let placement = select_nodes(
            1,
            &req,
            &candidate,
            &cmi,
            &nut,
            &partition,
            PlacementMode::RunNow,
            &[],
            &empty,
            &Bitset::new(cmi.total_cores()),
        )
        .unwrap();
        // Must have picked core 1 on node 0, not the occupied core 0.
        assert!(placement.job.core_bitmap.test(1));
        assert!(!placement.job.core_bitmap.test(0));
    }

    #[test]
    fn no_fit_when_insufficient_nodes() {
        let cmi = cmi4x2();
        let mut nut = NodeUsageTable::new();
        nut.rebuild(&[crate::node::NodeConfig::new("n0", 2, 10_000)]);
        let partition = PartitionRowTable::new(2, cmi.total_cores());
        let req = JobRequest {
            min_nodes: 2,
            max_nodes: 2,
            required_nodes: None,
            cpus_per_node: 1,
            memory_per_node: 0,
            node_req: NodeReq::Available,
            whole_node: false,
            contiguous: false,
        };
        let candidate = Bitset::from_bits(4, [0]);
        let empty: HashMap<JobId, JobResources> = HashMap::new();
        let res = select_nodes(
            1,
            &req,
            &candidate,
            &cmi,
            &nut,
            &partition,
            PlacementMode::RunNow,
            &[],
            &empty,
            &Bitset::new(cmi.total_cores()),
        );
        assert!(res.is_err());
    }
}
