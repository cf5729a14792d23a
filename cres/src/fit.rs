//! Job-Fit Test (spec.md §4.2): does a job's projected core bitmap fit
//! into a row without colliding with the row's current occupants?

use crate::bitset::Bitset;
use crate::cmi::CoreMapIndex;
use crate::job::JobResources;
use crate::row::Row;

/// `true` if a job (already projected through the CMI as `projected`)
/// can be added to `row` without any core conflict. An empty row always
/// fits. Whole-node jobs need the additional node-granularity re-check
/// in [`whole_node_fits`].
pub fn fits(_job: &JobResources, projected: &Bitset, row: &Row) -> bool {
    if row.is_empty() {
        return true;
    }
    if !projected.disjoint(&row.row_bitmap) {
        return false;
    }
    true
}

/// Node-granularity variant of the whole-node re-check, used where the
/// caller has a CMI handy and wants the belt-and-braces form spelled out
/// in spec.md §4.2 rather than relying solely on bitmap disjointness.
pub fn whole_node_fits(job: &JobResources, row: &Row, cmi: &CoreMapIndex) -> bool {
    if !job.whole_node {
        return true;
    }
    if row.is_empty() {
        return true;
    }
    job.node_bitmap.iter_set().all(|node| {
        let off = cmi.offset(node);
        (0..cmi.cores(node)).all(|k| !row.row_bitmap.test(off + k))
    })
}
