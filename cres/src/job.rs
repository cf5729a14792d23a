//! Job Resources Record: a job's selected nodes, per-node cpu/memory
//! accounting, and its packed core bitmap.

use crate::bitset::Bitset;
use crate::error::{CresError, Result};

pub type JobId = u32;

/// The sharing mode a job imposes on each node it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeReq {
    /// The node may still be shared with other jobs' cores.
    Available,
    /// The job occupies one row; other jobs may use other rows.
    OneRow,
    /// The job reserves the node exclusively.
    Reserved,
}

/// A job's resource selection, as produced by placement and mutated by
/// the lifecycle operations. Per-node arrays are indexed by **rank**
/// within `node_bitmap`, not by absolute node index (spec.md §3).
#[derive(Debug, Clone)]
pub struct JobResources {
    pub id: JobId,
    pub node_bitmap: Bitset,
    pub cpus: Vec<u32>,
    pub cpus_used: Vec<u32>,
    pub memory_allocated: Vec<u64>,
    pub memory_used: Vec<u64>,
    /// Packed against the CMI restricted to this job's selected nodes --
    /// no gaps for unselected nodes. Bit `k` for node rank `r` sits at
    /// `local_offset[r] + k`, see [`JobResources::local_offset`].
    pub core_bitmap: Bitset,
    pub node_req: NodeReq,
    pub ncpus: u32,
    pub whole_node: bool,
    pub total_cpus: u32,
    /// Offset of each rank's slice within `core_bitmap`; rebuilt whenever
    /// the node set changes (placement, expand, remove-one-node).
    pub(crate) local_offset: Vec<usize>,
    pub suspended: bool,
}

impl JobResources {
    pub fn nhosts(&self) -> usize {
        self.node_bitmap.popcount()
    }

    /// Rebuilds `local_offset` from `per_node_core_counts`, one entry per
    /// rank, matching `core_bitmap`'s packing.
    pub fn retile(&mut self, per_node_core_counts: &[usize]) {
        debug_assert_eq!(per_node_core_counts.len(), self.nhosts());
        let mut offsets = Vec::with_capacity(per_node_core_counts.len());
        let mut running = 0usize;
        for &c in per_node_core_counts {
            offsets.push(running);
            running += c;
        }
        self.local_offset = offsets;
        debug_assert_eq!(running, self.core_bitmap.len());
    }

    pub fn local_offset(&self, rank: usize) -> usize {
        self.local_offset[rank]
    }

    /// Validates the invariants spec.md §3 requires of a JRR before it is
    /// handed to `add_job_to_res`.
    pub fn validate(&self) -> Result<()> {
        let nhosts = self.nhosts();
        if nhosts == 0 {
            return Err(CresError::StateInvariant(format!(
                "job {} has empty node_bitmap",
                self.id
            )));
        }
        if self.cpus.len() != nhosts
            || self.memory_allocated.len() != nhosts
            || self.local_offset.len() != nhosts
        {
            return Err(CresError::StateInvariant(format!(
                "job {} per-node arrays do not match nhosts ({})",
                self.id, nhosts
            )));
        }
        if self.core_bitmap.popcount() < self.ncpus as usize {
            return Err(CresError::StateInvariant(format!(
                "job {}: popcount(core_bitmap) {} < ncpus {}",
                self.id,
                self.core_bitmap.popcount(),
                self.ncpus
            )));
        }
        Ok(())
    }

    /// Projects this job's core bitmap (indexed against its own packed
    /// node set) onto the cluster-wide CMI.
    pub fn project_to_cmi(&self, cmi: &crate::cmi::CoreMapIndex) -> Bitset {
        let mut res = Bitset::new(cmi.total_cores());
        let mut rank = 0;
        for node in self.node_bitmap.iter_set() {
            let start = self.local_offset(rank);
            let node_cores = cmi.cores(node);
            for local_k in 0..node_cores {
                if self.core_bitmap.test(start + local_k) {
                    res.set(cmi.global_bit(node, local_k));
                }
            }
            rank += 1;
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmi::CoreMapIndex;

    fn sample_job() -> JobResources {
        // Job on nodes {0, 2} of a 3-node, 2-core-each cluster, using
        // core 0 on node 0 and core 1 on node 2.
        let mut job = JobResources {
            id: 1,
            node_bitmap: Bitset::from_bits(3, [0, 2]),
            cpus: vec![1, 1],
            cpus_used: vec![0, 0],
            memory_allocated: vec![100, 100],
            memory_used: vec![0, 0],
            core_bitmap: Bitset::from_bits(4, [0, 3]),
            node_req: NodeReq::Available,
            ncpus: 2,
            whole_node: false,
            total_cpus: 2,
            local_offset: vec![],
            suspended: false,
        };
        job.retile(&[2, 2]);
        job
    }

    #[test]
    fn validate_accepts_well_formed_job() {
        assert!(sample_job().validate().is_ok());
    }

    #[test]
    fn validate_rejects_mismatched_arrays() {
        let mut job = sample_job();
        job.cpus.pop();
        assert!(job.validate().is_err());
    }

    #[test]
    fn project_to_cmi_places_bits_correctly() {
        let mut cmi = CoreMapIndex::empty();
        cmi.rebuild(&[2, 2, 2]).unwrap();
        let job = sample_job();
        let projected = job.project_to_cmi(&cmi);
        // node 0 core 0 -> global bit 0; node 2 core 1 -> global bit 5.
        assert_eq!(projected.iter_set().collect::<Vec<_>>(), vec![0, 5]);
    }
}
