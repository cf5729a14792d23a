//! End-to-end scenarios against the assembled [`cres::Engine`], and the
//! cross-cutting invariants every partition row table must uphold
//! regardless of which operations produced it.

use cres::bitset::Bitset;
use cres::engine::{ClusterConfig, Engine};
use cres::job::NodeReq;
use cres::lifecycle::RmJobMode;
use cres::node::NodeConfig;
use cres::placement::{JobRequest, PlacementMode};
use cres::reservation::{ReservationFlags, ReservationRequest, SwitchTree};

fn cluster(nodes: usize, cores: usize, memory: u64, rows: usize) -> Engine {
    let config = ClusterConfig {
        nodes: (0..nodes)
            .map(|i| NodeConfig::new(format!("n{i}"), cores, memory))
            .collect(),
        partitions: vec![("debug".to_string(), rows)],
    };
    Engine::new(&config).unwrap()
}

fn whole_node_req(min_nodes: usize, max_nodes: usize) -> JobRequest {
    JobRequest {
        min_nodes,
        max_nodes,
        required_nodes: None,
        cpus_per_node: 0,
        memory_per_node: 0,
        node_req: NodeReq::Reserved,
        whole_node: true,
        contiguous: true,
    }
}

fn single_cpu_req(nodes: usize) -> JobRequest {
    JobRequest {
        min_nodes: nodes,
        max_nodes: nodes,
        required_nodes: None,
        cpus_per_node: 1,
        memory_per_node: 100,
        node_req: NodeReq::Available,
        whole_node: false,
        contiguous: false,
    }
}

/// S1: nodes n0..n3, 2 cores each. j1 takes all 4 nodes at 1 cpu each,
/// j2 takes n0..n2 at 1 cpu each, j3 takes n3 at 1 cpu, j4 takes n0..n2
/// at 1 cpu each. Each lands on a distinct physical core from whatever
/// it already shares a node with, so j1/j2/j3 pack disjointly into row
/// 0 while j4 collides with j1 and needs row 1. Terminating j1 frees
/// its cores; what remains resident (j2, j3, j4) is exactly what the
/// rollup reports afterwards.
#[test]
fn s1_pack_four_jobs_and_repack_after_release() {
    let mut engine = cluster(4, 2, 10_000, 2);

    let all_nodes = Bitset::from_bits(4, 0..4);
    let n0_n2 = Bitset::from_bits(4, [0, 1, 2]);
    let n3 = Bitset::from_bits(4, [3]);

    let p1 = engine.job_test(1, "debug", &single_cpu_req(4), &all_nodes, PlacementMode::RunNow, &[], None).unwrap();
    engine.add_job_to_res("debug", p1.job).unwrap();
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, vec![1, 1, 1, 1]);

    let p2 = engine.job_test(2, "debug", &single_cpu_req(3), &n0_n2, PlacementMode::RunNow, &[], None).unwrap();
    engine.add_job_to_res("debug", p2.job).unwrap();
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, vec![2, 2, 2, 1]);

    let p3 = engine.job_test(3, "debug", &single_cpu_req(1), &n3, PlacementMode::RunNow, &[], None).unwrap();
    engine.add_job_to_res("debug", p3.job).unwrap();
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, vec![2, 2, 2, 2]);

    // j4 collides with j1 on every node it shares (both cores on
    // n0..n2 are now resident), so it needs a second row -- but since
    // those nodes were already fully occupied, the rollup can't see
    // the extra row; it still reports full occupancy.
    let p4 = engine.job_test(4, "debug", &single_cpu_req(3), &n0_n2, PlacementMode::RunNow, &[], None).unwrap();
    engine.add_job_to_res("debug", p4.job).unwrap();
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, vec![2, 2, 2, 2]);

    engine.rm_job_from_res("debug", 1, RmJobMode::Terminate, true).unwrap();
    // j1's cores are gone; j2/j3/j4 (now packed into one row) remain,
    // still fully covering n0..n2 between them but leaving n3 at 1.
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, vec![2, 2, 2, 1]);
}

/// S2: removing one node from a two-node job shrinks it in place rather
/// than releasing it entirely, and the dropped node's memory is freed.
#[test]
fn s2_remove_one_node_shrinks_job_in_place() {
    let mut engine = cluster(2, 2, 10_000, 1);
    let candidate = Bitset::from_bits(2, 0..2);

    let req = JobRequest {
        min_nodes: 2,
        max_nodes: 2,
        required_nodes: None,
        cpus_per_node: 2,
        memory_per_node: 500,
        node_req: NodeReq::Available,
        whole_node: false,
        contiguous: true,
    };
    let placed = engine.job_test(1, "debug", &req, &candidate, PlacementMode::TestOnly, &[], None).unwrap();
    engine.add_job_to_res("debug", placed.job).unwrap();

    engine.rm_job_from_one_node("debug", 1, 0).unwrap();

    let rollup = engine.nodeinfo_set_all();
    assert_eq!(rollup.alloc_cpus, vec![0, 2]);
    assert_eq!(rollup.alloc_memory[0], 0);
    assert_eq!(rollup.alloc_memory[1], 500);
}

/// S3: expanding one job into another merges their node sets, sums
/// per-shared-node resources, and removes the absorbed job entirely.
#[test]
fn s3_expand_merges_nodes_and_removes_source() {
    let mut engine = cluster(3, 2, 10_000, 2);

    let from_req = JobRequest {
        min_nodes: 2,
        max_nodes: 2,
        required_nodes: Some(Bitset::from_bits(3, [0, 1])),
        cpus_per_node: 1,
        memory_per_node: 200,
        node_req: NodeReq::Available,
        whole_node: false,
        contiguous: true,
    };
    let candidate = Bitset::from_bits(3, 0..3);
    // RunNow so the second job_test sees job 1's already-committed row
    // and picks a physically disjoint core on the node they share.
    let from = engine.job_test(1, "debug", &from_req, &candidate, PlacementMode::RunNow, &[], None).unwrap();
    engine.add_job_to_res("debug", from.job).unwrap();

    let to_req = JobRequest {
        min_nodes: 2,
        max_nodes: 2,
        required_nodes: Some(Bitset::from_bits(3, [1, 2])),
        cpus_per_node: 1,
        memory_per_node: 200,
        node_req: NodeReq::Available,
        whole_node: false,
        contiguous: true,
    };
    let to = engine.job_test(2, "debug", &to_req, &candidate, PlacementMode::RunNow, &[], None).unwrap();
    engine.add_job_to_res("debug", to.job).unwrap();

    engine.job_expand("debug", 1, 2).unwrap();

    let rollup = engine.nodeinfo_set_all();
    // n0: from-only (1 cpu), n1: from+to (2 cpus), n2: to-only (1 cpu).
    assert_eq!(rollup.alloc_cpus, vec![1, 2, 1]);
    assert_eq!(rollup.alloc_memory, vec![200, 400, 200]);
}

/// Suspending and resuming a job restores its exact prior occupancy,
/// and a job that cannot be placed is reported as a failure rather than
/// silently partially committed.
#[test]
fn suspend_resume_roundtrip_and_no_partial_commit() {
    let mut engine = cluster(1, 2, 10_000, 1);
    let candidate = Bitset::from_bits(1, [0]);
    let req = JobRequest {
        min_nodes: 1,
        max_nodes: 1,
        required_nodes: None,
        cpus_per_node: 2,
        memory_per_node: 0,
        node_req: NodeReq::Available,
        whole_node: false,
        contiguous: true,
    };
    let placed = engine.job_test(1, "debug", &req, &candidate, PlacementMode::TestOnly, &[], None).unwrap();
    engine.add_job_to_res("debug", placed.job).unwrap();

    let before = engine.nodeinfo_set_all().alloc_cpus.clone();
    engine.job_suspend("debug", 1, true).unwrap();
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, vec![0]);
    engine.job_resume("debug", 1).unwrap();
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, before);

    // A second job asking for the same two cores cannot fit -- single
    // row, fully occupied.
    let req2 = JobRequest {
        min_nodes: 1,
        max_nodes: 1,
        required_nodes: None,
        cpus_per_node: 1,
        memory_per_node: 0,
        node_req: NodeReq::Available,
        whole_node: false,
        contiguous: true,
    };
    let res = engine.job_test(2, "debug", &req2, &candidate, PlacementMode::RunNow, &[], None);
    assert!(res.is_err());
    // Occupancy is unchanged by the failed attempt.
    assert_eq!(engine.nodeinfo_set_all().alloc_cpus, before);
}

/// A whole-node job must never share a node with any other resident
/// job, even one needing only a single core.
#[test]
fn whole_node_job_excludes_sharing() {
    let mut engine = cluster(2, 2, 10_000, 2);
    let candidate = Bitset::from_bits(2, 0..2);

    let partial = JobRequest {
        min_nodes: 1,
        max_nodes: 1,
        required_nodes: None,
        cpus_per_node: 1,
        memory_per_node: 50,
        node_req: NodeReq::Available,
        whole_node: false,
        contiguous: true,
    };
    let p1 = engine.job_test(1, "debug", &partial, &candidate, PlacementMode::TestOnly, &[], None).unwrap();
    engine.add_job_to_res("debug", p1.job).unwrap();

    let whole = whole_node_req(1, 1);
    let placed_node = engine
        .job_test(2, "debug", &whole, &candidate, PlacementMode::RunNow, &[], None)
        .unwrap();
    // Must land on the other node, not the one job 1 already occupies.
    assert_eq!(placed_node.node_bitmap.iter_set().collect::<Vec<_>>(), vec![1]);
}

/// S4: the FIRST_CORES reservation strategy takes low-index nodes in
/// order, each exactly its requested core count.
#[test]
fn s4_reservation_first_cores() {
    let engine = cluster(4, 2, 10_000, 1);
    let req = ReservationRequest {
        node_cnt: 0,
        core_cnt: vec![2, 2],
        flags: ReservationFlags { first_cores: true },
    };
    let avail = Bitset::from_bits(4, 0..4);
    let excluded = Bitset::new(engine.cmi().total_cores());
    let sel = engine.resv_test(&req, &avail, None, &excluded).unwrap();
    assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(sel.cores.popcount(), 4);
}

/// S5: topology-aware best-fit prefers the lowest-index leaf switch that
/// alone satisfies the node count, over spreading across leaves.
#[test]
fn s5_reservation_topology_best_fit() {
    let engine = cluster(4, 2, 10_000, 1);
    let tree = SwitchTree {
        leaves: vec![Bitset::from_bits(4, [0, 1]), Bitset::from_bits(4, [2, 3])],
    };
    let req = ReservationRequest {
        node_cnt: 2,
        core_cnt: vec![],
        flags: ReservationFlags::default(),
    };
    let avail = Bitset::from_bits(4, 0..4);
    let excluded = Bitset::new(engine.cmi().total_cores());
    let sel = engine.resv_test(&req, &avail, Some(&tree), &excluded).unwrap();
    assert_eq!(sel.nodes.iter_set().collect::<Vec<_>>(), vec![0, 1]);
}

/// S6: aggregate reservation mode spreads a total core count across the
/// requested node count, converging via the residual sweep.
#[test]
fn s6_reservation_aggregate_residual_sweep() {
    let engine = cluster(4, 4, 10_000, 1);
    let req = ReservationRequest {
        node_cnt: 4,
        core_cnt: vec![10],
        flags: ReservationFlags::default(),
    };
    let avail = Bitset::from_bits(4, 0..4);
    let excluded = Bitset::new(engine.cmi().total_cores());
    let sel = engine.resv_test(&req, &avail, None, &excluded).unwrap();
    assert_eq!(sel.cores.popcount(), 10);
    assert_eq!(sel.nodes.popcount(), 4);
}

/// Cross-cutting invariant: a reservation's selected nodes are always a
/// subset of `avail`, and its cores never overlap an exclude set.
#[test]
fn reservation_selection_respects_avail_and_exclusions() {
    let engine = cluster(4, 2, 10_000, 1);
    let mut excluded = Bitset::new(engine.cmi().total_cores());
    excluded.set(0); // node 0 core 0 held by something else

    let req = ReservationRequest {
        node_cnt: 0,
        core_cnt: vec![2],
        flags: ReservationFlags { first_cores: true },
    };
    let avail = Bitset::from_bits(4, [0]);
    let sel = engine.resv_test(&req, &avail, None, &excluded);
    // Node 0 only has 1 free core once core 0 is excluded; 2 are
    // requested, so no selection should be produced.
    assert!(sel.is_none());
}
