//! Job lifecycle operations (spec.md §4.5): committing a placement,
//! releasing a job in full or from a single node, expanding a running
//! job onto another, and suspend/resume.
//!
//! Every operation here either fully commits or leaves its inputs
//! exactly as it found them -- the same "never partially commit"
//! contract the reservation planner and the row packer already follow.

use std::collections::HashMap;

use itertools::Itertools;

use crate::cmi::CoreMapIndex;
use crate::device::DeviceSubsystem;
use crate::error::{CresError, Result};
use crate::job::{JobId, JobResources};
use crate::node::NodeUsageTable;
use crate::row::PartitionRowTable;

/// Whether a full-job release also tears down typed-device state
/// (spec.md §4.5: "mode selects whether typed-device state is also
/// released (suspend vs. terminate)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmJobMode {
    /// The job is being suspended, not terminated; typed-device
    /// allocations are left in place so a later resume can reuse them.
    Suspend,
    /// The job is terminating for good; release its typed-device state
    /// on every node it held.
    Terminate,
}

/// Commits a placement produced by [`crate::placement::select_nodes`]
/// into `prt` and `nut`. Rolls back cleanly if the row table has no room
/// left (can happen between `job_test` and commit under concurrent
/// load).
pub fn add_job_to_res(
    job: JobResources,
    jobs: &mut HashMap<JobId, JobResources>,
    prt: &mut PartitionRowTable,
    nut: &mut NodeUsageTable,
    cmi: &CoreMapIndex,
) -> Result<()> {
    let job_id = job.id;
    let node_req = job.node_req;
    let nodes: Vec<usize> = job.node_bitmap.iter_set().collect();
    let memory: Vec<u64> = job.memory_allocated.clone();

    jobs.insert(job_id, job);
    let placed = {
        let j = jobs.get(&job_id).expect("just inserted");
        prt.insert_first_fit(job_id, j, cmi)
    };
    if placed.is_none() {
        jobs.remove(&job_id);
        return Err(CresError::NoFit(format!(
            "job {job_id}: no row has room in this partition"
        )));
    }

    for (rank, &node) in nodes.iter().enumerate() {
        let usage = nut.get_mut(node);
        usage.acquire(node_req);
        usage.add_memory(memory[rank]);
    }
    Ok(())
}

/// Releases `job_id` in full. `reconstruct` requests a repack of the
/// partition afterwards (spec.md §4.3); skip it when the caller is about
/// to release several jobs back to back and will repack once at the end.
#[allow(clippy::too_many_arguments)]
pub fn rm_job_from_res(
    job_id: JobId,
    jobs: &mut HashMap<JobId, JobResources>,
    prt: &mut PartitionRowTable,
    nut: &mut NodeUsageTable,
    cmi: &CoreMapIndex,
    mode: RmJobMode,
    reconstruct: bool,
    devices: &mut dyn DeviceSubsystem,
) -> Result<JobResources> {
    let job = jobs
        .remove(&job_id)
        .ok_or_else(|| CresError::NotFound { job_id, partition: 0 })?;

    prt.remove_job(job_id);
    for (rank, node) in job.node_bitmap.iter_set().enumerate() {
        let usage = nut.get_mut(node);
        usage.release();
        usage.sub_memory(job.memory_allocated[rank]);
        if mode == RmJobMode::Terminate {
            devices.dealloc(job_id, node, rank);
        }
    }

    if reconstruct {
        prt.repack(jobs, cmi);
    }
    Ok(job)
}

/// Releases `job_id`'s hold on a single node, shrinking its JRR in
/// place. If the node was the job's last one, the job is released in
/// full via [`rm_job_from_res`].
pub fn rm_job_from_one_node(
    job_id: JobId,
    node: usize,
    jobs: &mut HashMap<JobId, JobResources>,
    prt: &mut PartitionRowTable,
    nut: &mut NodeUsageTable,
    cmi: &CoreMapIndex,
    devices: &mut dyn DeviceSubsystem,
) -> Result<()> {
    let nhosts = jobs
        .get(&job_id)
        .ok_or(CresError::NotFound { job_id, partition: 0 })?
        .nhosts();
    if nhosts <= 1 {
        rm_job_from_res(job_id, jobs, prt, nut, cmi, RmJobMode::Terminate, true, devices)?;
        return Ok(());
    }

    let rank = {
        let job = jobs.get(&job_id).expect("checked above");
        job.node_bitmap
            .iter_set()
            .position(|n| n == node)
            .ok_or_else(|| CresError::InvalidInput(format!("job {job_id} not resident on node {node}")))?
    };

    // spec.md §4.5 `rm_job_from_one_node`: the dropped node's typed-device
    // state is released regardless of the job's overall lifecycle mode.
    devices.dealloc(job_id, node, rank);

    let dropped_memory = extract_job_resources_node(job_id, rank, node, jobs, cmi)?;

    let usage = nut.get_mut(node);
    usage.release();
    usage.sub_memory(dropped_memory);

    rebuild_row_for_job(job_id, jobs, prt, cmi);
    Ok(())
}

/// Rewrites `job`'s JRR to drop rank `rank` (the node at `node`),
/// shifting every later rank down by one and rebuilding `local_offset`.
/// Returns the memory that had been allocated to the dropped node.
fn extract_job_resources_node(
    job_id: JobId,
    rank: usize,
    node: usize,
    jobs: &mut HashMap<JobId, JobResources>,
    cmi: &CoreMapIndex,
) -> Result<u64> {
    let job = jobs.get_mut(&job_id).expect("caller checked presence");

    let dropped_memory = job.memory_allocated[rank];
    job.cpus.remove(rank);
    job.cpus_used.remove(rank);
    job.memory_allocated.remove(rank);
    job.memory_used.remove(rank);
    job.node_bitmap.clear_bit(node);

    let mut per_node_cores = Vec::with_capacity(job.nhosts());
    let mut new_bits = Vec::new();
    let mut running = 0usize;
    for (r, n) in job.node_bitmap.iter_set().enumerate() {
        // `local_offset` has not been rebuilt yet, so it is still keyed
        // by the pre-removal rank numbering.
        let old_rank = if r < rank { r } else { r + 1 };
        let old_off = job.local_offset(old_rank);
        let cores = cmi.cores(n);
        for k in 0..cores {
            if job.core_bitmap.test(old_off + k) {
                new_bits.push(running + k);
            }
        }
        per_node_cores.push(cores);
        running += cores;
    }

    let mut new_core_bitmap = crate::bitset::Bitset::new(running);
    for b in new_bits {
        new_core_bitmap.set(b);
    }
    job.core_bitmap = new_core_bitmap;
    job.retile(&per_node_cores);
    job.ncpus = job.cpus.iter().sum();
    job.total_cpus = job.ncpus;
    job.validate()?;
    Ok(dropped_memory)
}

fn rebuild_row_for_job(
    job_id: JobId,
    jobs: &HashMap<JobId, JobResources>,
    prt: &mut PartitionRowTable,
    cmi: &CoreMapIndex,
) {
    for row in prt.rows.iter_mut() {
        if row.job_list.contains(&job_id) {
            row.rebuild_bitmap(jobs, cmi);
            return;
        }
    }
}

/// Merges `from` into `to` (spec.md §4.5 step 5), then removes `from`.
/// Both jobs must currently be resident in `prt`; on any failure neither
/// job is touched.
pub fn job_expand(
    from_id: JobId,
    to_id: JobId,
    jobs: &mut HashMap<JobId, JobResources>,
    prt: &mut PartitionRowTable,
    cmi: &CoreMapIndex,
    devices: &mut dyn DeviceSubsystem,
) -> Result<()> {
    let from = jobs
        .get(&from_id)
        .ok_or(CresError::NotFound { job_id: from_id, partition: 0 })?
        .clone();
    let to = jobs
        .get(&to_id)
        .ok_or(CresError::NotFound { job_id: to_id, partition: 0 })?
        .clone();

    let union_nodes: Vec<usize> = from
        .node_bitmap
        .iter_set()
        .chain(to.node_bitmap.iter_set())
        .sorted()
        .dedup()
        .collect();

    let mut cpus = Vec::with_capacity(union_nodes.len());
    let mut cpus_used = Vec::with_capacity(union_nodes.len());
    let mut memory_allocated = Vec::with_capacity(union_nodes.len());
    let mut memory_used = Vec::with_capacity(union_nodes.len());
    let mut per_node_cores = Vec::with_capacity(union_nodes.len());
    let mut node_bits: Vec<Vec<usize>> = Vec::with_capacity(union_nodes.len());

    for &node in &union_nodes {
        let from_rank = from.node_bitmap.iter_set().position(|n| n == node);
        let to_rank = to.node_bitmap.iter_set().position(|n| n == node);
        let cores = cmi.cores(node);
        per_node_cores.push(cores);

        let mut bits = vec![false; cores];
        let mut from_core_cnt = 0usize;
        let mut to_core_cnt = 0usize;
        let mut mem_sum = 0u64;
        let mut mem_used_sum = 0u64;
        if let Some(r) = from_rank {
            let off = from.local_offset(r);
            for k in 0..cores {
                if from.core_bitmap.test(off + k) {
                    bits[k] = true;
                    from_core_cnt += 1;
                }
            }
            mem_sum += from.memory_allocated[r];
            mem_used_sum += from.memory_used[r];
        }
        if let Some(r) = to_rank {
            let off = to.local_offset(r);
            for k in 0..cores {
                if to.core_bitmap.test(off + k) {
                    bits[k] = true;
                    to_core_cnt += 1;
                }
            }
            mem_sum += to.memory_allocated[r];
            mem_used_sum += to.memory_used[r];
        }
        let merged_core_cnt = bits.iter().filter(|&&b| b).count();

        // spec.md §4.5 step 4: when a node is shared by both jobs, sum
        // their cpu counts but rescale by the actual (OR-ed) core count
        // over the sum of each side's core count, so a node whose cores
        // are reused between `from` and `to` isn't double-counted.
        let (cpu_sum, cpu_used_sum) = match (from_rank, to_rank) {
            (Some(fr), Some(tr)) => {
                let denom = from_core_cnt + to_core_cnt;
                let raw_cpu = from.cpus[fr] + to.cpus[tr];
                let raw_used = from.cpus_used[fr] + to.cpus_used[tr];
                if denom == 0 {
                    (raw_cpu, raw_used)
                } else {
                    (
                        (raw_cpu as usize * merged_core_cnt / denom) as u32,
                        (raw_used as usize * merged_core_cnt / denom) as u32,
                    )
                }
            }
            (Some(fr), None) => (from.cpus[fr], from.cpus_used[fr]),
            (None, Some(tr)) => (to.cpus[tr], to.cpus_used[tr]),
            (None, None) => (0, 0),
        };

        node_bits.push((0..cores).filter(|&k| bits[k]).collect());
        cpus.push(cpu_sum);
        cpus_used.push(cpu_used_sum);
        memory_allocated.push(mem_sum);
        memory_used.push(mem_used_sum);
    }

    let total_cores: usize = per_node_cores.iter().sum();
    let mut core_bitmap = crate::bitset::Bitset::new(total_cores);
    let mut running = 0usize;
    for (rank, bits) in node_bits.iter().enumerate() {
        for &k in bits {
            core_bitmap.set(running + k);
        }
        running += per_node_cores[rank];
    }

    let ncpus: u32 = cpus.iter().sum();
    let mut merged = JobResources {
        id: to_id,
        node_bitmap: crate::bitset::Bitset::from_bits(cmi.node_count(), union_nodes.iter().copied()),
        cpus,
        cpus_used,
        memory_allocated,
        memory_used,
        core_bitmap,
        node_req: to.node_req,
        ncpus,
        whole_node: from.whole_node || to.whole_node,
        total_cpus: ncpus,
        local_offset: vec![],
        suspended: to.suspended,
    };
    merged.retile(&per_node_cores);
    merged.validate()?;

    let rows_snapshot = prt.rows.clone();
    prt.remove_job(from_id);
    prt.remove_job(to_id);

    if prt.insert_first_fit(to_id, &merged, cmi).is_none() {
        prt.rows = rows_snapshot;
        return Err(CresError::NoFit(format!(
            "expanded job {to_id} does not fit any row"
        )));
    }

    devices.merge(from_id, to_id);
    jobs.remove(&from_id);
    jobs.insert(to_id, merged);
    Ok(())
}

/// Suspends `job_id`. `indf_susp=false` models a transient
/// gang-scheduling suspend that leaves cores held and is a no-op here
/// (spec.md §4.5); only an indefinite suspend actually releases row
/// occupancy.
pub fn job_suspend(
    job_id: JobId,
    jobs: &mut HashMap<JobId, JobResources>,
    prt: &mut PartitionRowTable,
    indf_susp: bool,
) -> Result<()> {
    if !indf_susp {
        return Ok(());
    }
    let job = jobs
        .get_mut(&job_id)
        .ok_or(CresError::NotFound { job_id, partition: 0 })?;
    if job.suspended {
        return Ok(());
    }
    job.suspended = true;
    prt.remove_job(job_id);
    Ok(())
}

/// Resumes a previously (indefinitely) suspended job, re-fitting it into
/// the partition. Fails -- leaving the job suspended -- if no row has
/// room, rather than partially restoring it.
pub fn job_resume(
    job_id: JobId,
    jobs: &mut HashMap<JobId, JobResources>,
    prt: &mut PartitionRowTable,
    cmi: &CoreMapIndex,
) -> Result<()> {
    let was_suspended = jobs
        .get(&job_id)
        .ok_or(CresError::NotFound { job_id, partition: 0 })?
        .suspended;
    if !was_suspended {
        return Ok(());
    }

    let placed = {
        let job = jobs.get(&job_id).expect("checked above");
        prt.insert_first_fit(job_id, job, cmi)
    };
    if placed.is_none() {
        return Err(CresError::NoFit(format!(
            "job {job_id}: no row has room to resume into"
        )));
    }
    jobs.get_mut(&job_id).expect("checked above").suspended = false;
    Ok(())
}
