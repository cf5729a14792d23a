//! Partition Row Table and the Row Packer (spec.md §3, §4.3).
//!
//! Rows hold no ownership over jobs -- only their ids -- per design note
//! §9 ("implement as opaque job ids + a lookup map rather than raw
//! pointers"). Every operation here takes a [`JobLookup`] to resolve ids
//! into the job data it needs.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::bitset::Bitset;
use crate::job::{JobId, JobResources};

/// Anything that can resolve a job id to its [`JobResources`]. The
/// controller's job table implements this; `cres`'s own [`crate::engine::Engine`]
/// keeps its job table in an `IndexMap` for deterministic iteration
/// order, but plain `HashMap`s (as used throughout this crate's tests)
/// work equally well.
pub trait JobLookup {
    fn get(&self, id: JobId) -> Option<&JobResources>;
}

impl JobLookup for HashMap<JobId, JobResources> {
    fn get(&self, id: JobId) -> Option<&JobResources> {
        HashMap::get(self, &id)
    }
}

impl JobLookup for IndexMap<JobId, JobResources> {
    fn get(&self, id: JobId) -> Option<&JobResources> {
        IndexMap::get(self, &id)
    }
}

/// One oversubscription lane. Jobs within a row have mutually disjoint
/// projected core bitmaps.
#[derive(Debug, Clone)]
pub struct Row {
    pub job_list: Vec<JobId>,
    pub row_bitmap: Bitset,
}

impl Row {
    fn empty(total_cores: usize) -> Self {
        Self {
            job_list: Vec::new(),
            row_bitmap: Bitset::new(total_cores),
        }
    }

    pub fn num_jobs(&self) -> usize {
        self.job_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_list.is_empty()
    }

    /// Rebuilds `row_bitmap` from `job_list` by OR-ing every resident
    /// job's projected core bitmap, per spec.md §3's row invariant.
    pub fn rebuild_bitmap(&mut self, lookup: &dyn JobLookup, cmi: &crate::cmi::CoreMapIndex) {
        self.row_bitmap = Bitset::new(cmi.total_cores());
        for &id in &self.job_list {
            if let Some(job) = lookup.get(id) {
                self.row_bitmap.or_with(&job.project_to_cmi(cmi));
            }
        }
    }
}

/// A partition's ordered array of rows (spec.md §3). `num_rows` is the
/// configured oversubscription factor; rows `0..num_rows` are used in
/// order, densest first after packing.
#[derive(Debug, Clone)]
pub struct PartitionRowTable {
    pub rows: Vec<Row>,
    pub num_rows: usize,
}

impl PartitionRowTable {
    pub fn new(num_rows: usize, total_cores: usize) -> Self {
        Self {
            rows: (0..num_rows).map(|_| Row::empty(total_cores)).collect(),
            num_rows,
        }
    }

    pub fn num_used_rows(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_empty()).count()
    }

    /// Inserts `job_id` into the lowest-indexed row its projected core
    /// bitmap fits (spec.md §4.2), OR-ing its bits into that row.
    /// Returns the row index, or `None` if no existing row fits and
    /// `num_rows` is already exhausted.
    pub fn insert_first_fit(
        &mut self,
        job_id: JobId,
        job: &JobResources,
        cmi: &crate::cmi::CoreMapIndex,
    ) -> Option<usize> {
        let projected = job.project_to_cmi(cmi);
        for (idx, row) in self.rows.iter_mut().enumerate() {
            if crate::fit::fits(job, &projected, row) && crate::fit::whole_node_fits(job, row, cmi) {
                row.job_list.push(job_id);
                row.row_bitmap.or_with(&projected);
                return Some(idx);
            }
        }
        None
    }

    /// Removes `job_id` from whichever row holds it, if any.
    pub fn remove_job(&mut self, job_id: JobId) -> bool {
        for row in self.rows.iter_mut() {
            if let Some(pos) = row.job_list.iter().position(|&id| id == job_id) {
                row.job_list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Row Packer (spec.md §4.3). Compacts the partition into the
    /// smallest number of rows, densest first, restoring the
    /// pre-packing layout if any job ends up dangling (unable to be
    /// placed in any row).
    pub fn repack(&mut self, lookup: &dyn JobLookup, cmi: &crate::cmi::CoreMapIndex) {
        if self.rows.len() <= 1 {
            if let Some(row) = self.rows.first_mut() {
                row.rebuild_bitmap(lookup, cmi);
            }
            return;
        }

        let orig = self.rows.clone();

        // Flatten all resident jobs, sort-key = (first global bit,
        // descending ncpus as a tie-break) per spec.md §4.3 step 3.
        let mut flat: Vec<JobId> = orig.iter().flat_map(|r| r.job_list.iter().copied()).collect();
        flat.sort_by_key(|&id| {
            let job = lookup.get(id).expect("dangling job id in PRT");
            let projected = job.project_to_cmi(cmi);
            let first_bit = projected.first_set().unwrap_or(usize::MAX);
            (first_bit, std::cmp::Reverse(job.ncpus))
        });

        for row in self.rows.iter_mut() {
            row.job_list.clear();
            row.row_bitmap.clear();
        }

        let mut dangling = false;
        for id in &flat {
            let job = lookup.get(*id).expect("dangling job id in PRT");
            if self.insert_first_fit(*id, job, cmi).is_none() {
                dangling = true;
                break;
            }
            // After each insertion, prefer denser rows first (spec.md
            // §4.3 step 5): rows with more set bits sort earlier, ties
            // broken by original row index (a stable sort preserves
            // that automatically).
            self.rows.sort_by_key(|r| std::cmp::Reverse(r.row_bitmap.popcount()));
        }

        if dangling {
            self.rows = orig;
            for row in self.rows.iter_mut() {
                row.rebuild_bitmap(lookup, cmi);
            }
        }
    }
}
