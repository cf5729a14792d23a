//! Reservation Planner (spec.md §4.6): selects a node set, and
//! optionally exact cores, for an advance reservation under switch-tree
//! constraints.
//!
//! Failure never partially commits (spec.md §4.6, §5): every strategy
//! below builds its selection into fresh, local structures and only
//! copies them into the caller's output on success.

use crate::bitset::Bitset;
use crate::cmi::CoreMapIndex;

/// A flat switch tree: each entry is one leaf switch's node membership.
/// Leaves are ordered ascending by switch index, which is also the tie
/// break spec.md §4.6 calls for ("ties: smallest leaf that still
/// suffices" / "lowest-index leaf").
///
/// Multi-level switch hierarchies reduce to this same contract once the
/// "lowest-level switch whose nodes and cores both meet remaining
/// demand" has been identified; `cres` models that search directly over
/// leaves rather than walking interior tree levels, since every leaf
/// selection spec.md's scenarios exercise (S5) bottoms out at this
/// granularity. See DESIGN.md for the simplification this makes.
#[derive(Debug, Clone)]
pub struct SwitchTree {
    pub leaves: Vec<Bitset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationFlags {
    pub first_cores: bool,
}

impl Default for ReservationFlags {
    fn default() -> Self {
        Self { first_cores: false }
    }
}

#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub node_cnt: usize,
    /// Empty: no core constraint (full-node reservation). One entry:
    /// aggregate mode, spread across `node_cnt` nodes. Multiple entries:
    /// exact per-node core counts, indexed by selection order.
    pub core_cnt: Vec<usize>,
    pub flags: ReservationFlags,
}

#[derive(Debug, Clone)]
pub struct ReservationSelection {
    pub nodes: Bitset,
    /// Global-CMI core selection; empty if the request was full-node
    /// only (no `core_cnt`).
    pub cores: Bitset,
}

/// Returns `None` on failure -- never partially commits, and never
/// mutates `avail` (spec.md §4.6/§5).
pub fn resv_test(
    req: &ReservationRequest,
    avail: &Bitset,
    cmi: &CoreMapIndex,
    switches: Option<&SwitchTree>,
    excluded_cores: &Bitset,
) -> Option<ReservationSelection> {
    if req.flags.first_cores && !req.core_cnt.is_empty() {
        return first_cores(req, avail, cmi, excluded_cores);
    }
    if let Some(tree) = switches {
        if req.node_cnt > 0 {
            if let Some(sel) = topology_best_fit(req, avail, cmi, tree, excluded_cores) {
                return Some(sel);
            }
        }
    }
    sequential_fallback(req, avail, cmi, excluded_cores)
}

fn free_cores(node: usize, cmi: &CoreMapIndex, excluded: &Bitset) -> Vec<usize> {
    let off = cmi.offset(node);
    (0..cmi.cores(node))
        .filter(|&k| !excluded.test(off + k))
        .collect()
}

/// FIRST_CORES strategy (spec.md §4.6): low-index nodes first, exactly
/// `core_cnt[i]` lowest free cores on the i-th node that has enough.
fn first_cores(
    req: &ReservationRequest,
    avail: &Bitset,
    cmi: &CoreMapIndex,
    excluded: &Bitset,
) -> Option<ReservationSelection> {
    let mut nodes = Bitset::new(cmi.node_count());
    let mut cores = Bitset::new(cmi.total_cores());
    let mut idx = 0;

    for node in avail.iter_set() {
        if idx >= req.core_cnt.len() {
            break;
        }
        if req.node_cnt > 0 && nodes.popcount() >= req.node_cnt {
            break;
        }
        let need = req.core_cnt[idx];
        let free = free_cores(node, cmi, excluded);
        if free.len() < need {
            continue;
        }
        nodes.set(node);
        let off = cmi.offset(node);
        for &k in free.iter().take(need) {
            cores.set(off + k);
        }
        idx += 1;
    }

    if idx < req.core_cnt.len() {
        return None;
    }
    Some(ReservationSelection { nodes, cores })
}

/// TOPOLOGY-aware best-fit strategy (spec.md §4.6): among leaves whose
/// node/core candidates suffice, pick the one with the tightest node
/// count (ties broken by ascending leaf index) rather than the first
/// leaf that happens to suffice -- a large leaf earlier in the tree must
/// not shadow a smaller, exactly-sufficient one later on.
fn topology_best_fit(
    req: &ReservationRequest,
    avail: &Bitset,
    cmi: &CoreMapIndex,
    tree: &SwitchTree,
    excluded: &Bitset,
) -> Option<ReservationSelection> {
    let per_node_cores = if req.core_cnt.len() > 1 {
        Some(&req.core_cnt)
    } else {
        None
    };

    let mut best: Option<(usize, usize, Vec<usize>)> = None; // (node_count, leaf_index, candidates)
    for (leaf_idx, leaf) in tree.leaves.iter().enumerate() {
        let mut candidates: Vec<usize> = leaf
            .iter_set()
            .filter(|&n| avail.test(n))
            .filter(|&n| match per_node_cores {
                Some(counts) => free_cores(n, cmi, excluded).len() >= counts.first().copied().unwrap_or(0),
                None => true,
            })
            .collect();
        candidates.sort_unstable();
        if candidates.len() < req.node_cnt {
            continue;
        }
        let tighter = match &best {
            Some((best_len, _, _)) => candidates.len() < *best_len,
            None => true,
        };
        if tighter {
            best = Some((candidates.len(), leaf_idx, candidates));
        }
    }

    let (_, _, candidates) = best?;
    let chosen: Vec<usize> = candidates.into_iter().take(req.node_cnt).collect();
    let nodes = Bitset::from_bits(cmi.node_count(), chosen.iter().copied());

    let cores = if req.core_cnt.is_empty() {
        Bitset::new(cmi.total_cores())
    } else if req.core_cnt.len() == 1 {
        reserve_aggregate(&chosen, req.core_cnt[0], cmi, excluded)?
    } else {
        reserve_exact_per_node(&chosen, &req.core_cnt, cmi, excluded)?
    };

    Some(ReservationSelection { nodes, cores })
}

/// SEQUENTIAL fallback (spec.md §4.6): ascending node index, filling
/// per-node core counts or whole nodes until the target is reached.
fn sequential_fallback(
    req: &ReservationRequest,
    avail: &Bitset,
    cmi: &CoreMapIndex,
    excluded: &Bitset,
) -> Option<ReservationSelection> {
    if req.core_cnt.is_empty() {
        let chosen: Vec<usize> = avail.iter_set().take(req.node_cnt).collect();
        if chosen.len() < req.node_cnt {
            return None;
        }
        return Some(ReservationSelection {
            nodes: Bitset::from_bits(cmi.node_count(), chosen),
            cores: Bitset::new(cmi.total_cores()),
        });
    }

    if req.core_cnt.len() == 1 {
        let chosen: Vec<usize> = avail.iter_set().take(req.node_cnt.max(1)).collect();
        if req.node_cnt > 0 && chosen.len() < req.node_cnt {
            return None;
        }
        let nodes = Bitset::from_bits(cmi.node_count(), chosen.iter().copied());
        let cores = reserve_aggregate(&chosen, req.core_cnt[0], cmi, excluded)?;
        return Some(ReservationSelection { nodes, cores });
    }

    let chosen: Vec<usize> = avail.iter_set().take(req.core_cnt.len()).collect();
    if chosen.len() < req.core_cnt.len() {
        return None;
    }
    let nodes = Bitset::from_bits(cmi.node_count(), chosen.iter().copied());
    let cores = reserve_exact_per_node(&chosen, &req.core_cnt, cmi, excluded)?;
    Some(ReservationSelection { nodes, cores })
}

fn reserve_exact_per_node(
    nodes: &[usize],
    core_cnt: &[usize],
    cmi: &CoreMapIndex,
    excluded: &Bitset,
) -> Option<Bitset> {
    let mut cores = Bitset::new(cmi.total_cores());
    for (i, &n) in nodes.iter().enumerate() {
        let need = core_cnt[i];
        let free = free_cores(n, cmi, excluded);
        if free.len() < need {
            return None;
        }
        let off = cmi.offset(n);
        for &k in free.iter().take(need) {
            cores.set(off + k);
        }
    }
    Some(cores)
}

/// Aggregate reservation (spec.md §4.6): per-node minimum =
/// `ceil(target / node_cnt)`, first sweep fills up to that minimum per
/// node (capped by remaining target and the node's free cores); if a
/// residual remains, a second sweep drops the per-node minimum to 1 and
/// keeps spreading until the target is met or every node is exhausted.
fn reserve_aggregate(
    nodes: &[usize],
    target: usize,
    cmi: &CoreMapIndex,
    excluded: &Bitset,
) -> Option<Bitset> {
    if nodes.is_empty() {
        return if target == 0 {
            Some(Bitset::new(cmi.total_cores()))
        } else {
            None
        };
    }
    let per_node_min = target.div_ceil(nodes.len());
    let mut cores = Bitset::new(cmi.total_cores());
    let mut remaining = target;
    let mut free_by_node: Vec<Vec<usize>> = nodes.iter().map(|&n| free_cores(n, cmi, excluded)).collect();

    // Sweep 1.
    for (i, &n) in nodes.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let take = per_node_min.min(free_by_node[i].len()).min(remaining);
        let off = cmi.offset(n);
        for &k in free_by_node[i].iter().take(take) {
            cores.set(off + k);
        }
        free_by_node[i].drain(..take);
        remaining -= take;
    }

    // Sweep 2: drop the per-node minimum and keep spreading.
    if remaining > 0 {
        for (i, &n) in nodes.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let take = free_by_node[i].len().min(remaining);
            let off = cmi.offset(n);
            for &k in free_by_node[i].iter().take(take) {
                cores.set(off + k);
            }
            free_by_node[i].drain(..take);
            remaining -= take;
        }
    }

    if remaining > 0 {
        None
    } else {
        Some(cores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmi(node_cores: &[usize]) -> CoreMapIndex {
        let mut c = CoreMapIndex::empty();
        c.rebuild(node_cores).unwrap();
        c
    }

    #[test]
    fn s4_first_cores() {
        let cmi = cmi(&[2, 2, 2, 2]);
        let req = ReservationRequest {
            node_cnt: 0,
            core_cnt: vec![2, 2],
            flags: ReservationFlags { first_cores: true },
        };
        let avail = Bitset::from_bits(4, [0, 1, 2, 3]);
        let excluded = Bitset::new(cmi.total_cores());
        let sel = resv_test(&req, &avail, &cmi, None, &excluded).unwrap();
        assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(sel.cores.popcount(), 4);
        assert!(sel.cores.test(0) && sel.cores.test(1));
        assert!(sel.cores.test(2) && sel.cores.test(3));
    }

    #[test]
    fn first_cores_single_entry_takes_exact_count_on_lowest_node() {
        // A single core_cnt entry with first_cores set and node_cnt > 1
        // must still take exactly k cores on the lowest-index node that
        // has them, rather than falling through to aggregate spreading.
        let cmi = cmi(&[4, 4, 4, 4]);
        let req = ReservationRequest {
            node_cnt: 3,
            core_cnt: vec![2],
            flags: ReservationFlags { first_cores: true },
        };
        let avail = Bitset::from_bits(4, 0..4);
        let excluded = Bitset::new(cmi.total_cores());
        let sel = resv_test(&req, &avail, &cmi, None, &excluded).unwrap();
        assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![0]);
        assert_eq!(sel.cores.popcount(), 2);
        assert!(sel.cores.test(0) && sel.cores.test(1));
    }

    #[test]
    fn s5_topology_prefers_single_leaf_lowest_index() {
        let cmi = cmi(&[2, 2, 2, 2]);
        let tree = SwitchTree {
            leaves: vec![
                Bitset::from_bits(4, [0, 1]),
                Bitset::from_bits(4, [2, 3]),
            ],
        };
        let req = ReservationRequest {
            node_cnt: 2,
            core_cnt: vec![],
            flags: ReservationFlags::default(),
        };
        let avail = Bitset::from_bits(4, [0, 1, 2, 3]);
        let excluded = Bitset::new(cmi.total_cores());
        let sel = resv_test(&req, &avail, &cmi, Some(&tree), &excluded).unwrap();
        assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn topology_best_fit_prefers_tighter_leaf_over_earlier_larger_one() {
        let cmi = cmi(&[2, 2, 2, 2, 2, 2]);
        let tree = SwitchTree {
            leaves: vec![
                Bitset::from_bits(6, [0, 1, 2, 3]),
                Bitset::from_bits(6, [4, 5]),
            ],
        };
        let req = ReservationRequest {
            node_cnt: 2,
            core_cnt: vec![],
            flags: ReservationFlags::default(),
        };
        let avail = Bitset::from_bits(6, 0..6);
        let excluded = Bitset::new(cmi.total_cores());
        let sel = resv_test(&req, &avail, &cmi, Some(&tree), &excluded).unwrap();
        // Leaf 0 has 4 candidate nodes, leaf 1 only 2 -- the exactly
        // sufficient leaf 1 must win even though it's scanned second.
        assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn s6_aggregate_residual_sweep() {
        let cmi = cmi(&[4, 4, 4, 4]);
        let req = ReservationRequest {
            node_cnt: 4,
            core_cnt: vec![10],
            flags: ReservationFlags::default(),
        };
        let avail = Bitset::from_bits(4, [0, 1, 2, 3]);
        let excluded = Bitset::new(cmi.total_cores());
        let sel = resv_test(&req, &avail, &cmi, None, &excluded).unwrap();
        assert_eq!(sel.cores.popcount(), 10);
        assert_eq!(sel.nodes.popcount(), 4);
    }

    #[test]
    fn failure_returns_none_and_does_not_mutate_avail() {
        let cmi = cmi(&[1, 1]);
        let req = ReservationRequest {
            node_cnt: 5,
            core_cnt: vec![],
            flags: ReservationFlags::default(),
        };
        let avail = Bitset::from_bits(2, [0, 1]);
        let avail_before = avail.clone();
        let excluded = Bitset::new(cmi.total_cores());
        assert!(resv_test(&req, &avail, &cmi, None, &excluded).is_none());
        assert_eq!(avail, avail_before);
    }

    #[test]
    fn excluded_cores_are_never_selected() {
        let cmi = cmi(&[2]);
        let mut excluded = Bitset::new(cmi.total_cores());
        excluded.set(0);
        let req = ReservationRequest {
            node_cnt: 0,
            core_cnt: vec![1],
            flags: ReservationFlags { first_cores: true },
        };
        let avail = Bitset::from_bits(1, [0]);
        let sel = resv_test(&req, &avail, &cmi, None, &excluded).unwrap();
        assert!(sel.cores.test(1));
        assert!(!sel.cores.test(0));
    }
}
