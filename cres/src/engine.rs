//! `Engine`: the top-level façade bundling the core-map index, node
//! usage table, partition row tables and job table into the single
//! entry point spec.md §6 describes.
//!
//! Since this crate has no surrounding controller of its own, `Engine`
//! plays that role for the purposes of the job table PRT rows reference
//! by id (design note §9) -- callers that already run their own
//! controller can instead hold the job table themselves and drive
//! `row`, `fit`, `placement`, `lifecycle` and `reservation` directly.

use std::collections::HashMap;

use crate::cmi::CoreMapIndex;
use crate::device::{DeviceSubsystem, NullDeviceSubsystem};
use crate::error::{CresError, Result};
use crate::job::{JobId, JobResources, NodeReq};
use crate::lifecycle::{self, RmJobMode};
use crate::node::{NodeConfig, NodeUsageTable};
use crate::placement::{self, JobRequest, Placement, PlacementMode};
use crate::reservation::{self, ReservationRequest, ReservationSelection, SwitchTree};
use crate::row::PartitionRowTable;
use crate::rollup::{self, NodeRollup};

/// Static, engine-wide configuration supplied at construction and
/// refreshed by [`Engine::reconfigure`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    /// Row count (oversubscription factor) per partition, keyed by name.
    pub partitions: Vec<(String, usize)>,
}

pub struct Engine {
    cmi: CoreMapIndex,
    nut: NodeUsageTable,
    jobs: HashMap<JobId, JobResources>,
    partitions: HashMap<String, PartitionRowTable>,
    devices: Box<dyn DeviceSubsystem>,
    tick: u64,
    rollup_cache: Option<NodeRollup>,
}

impl Engine {
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let mut engine = Self {
            cmi: CoreMapIndex::empty(),
            nut: NodeUsageTable::new(),
            jobs: HashMap::new(),
            partitions: HashMap::new(),
            devices: Box::new(NullDeviceSubsystem),
            tick: 0,
            rollup_cache: None,
        };
        engine.node_init(config)?;
        Ok(engine)
    }

    pub fn with_device_subsystem(config: &ClusterConfig, devices: Box<dyn DeviceSubsystem>) -> Result<Self> {
        let mut engine = Self::new(config)?;
        engine.devices = devices;
        Ok(engine)
    }

    /// (Re)initializes node-level state from `config` (spec.md §6
    /// `node_init`). Invalidates every partition's rows -- callers must
    /// not hold row indices across this call.
    pub fn node_init(&mut self, config: &ClusterConfig) -> Result<()> {
        let node_cores: Vec<usize> = config.nodes.iter().map(|n| n.cores).collect();
        self.cmi.rebuild(&node_cores)?;
        self.nut.rebuild(&config.nodes);
        self.partitions = config
            .partitions
            .iter()
            .map(|(name, rows)| (name.clone(), PartitionRowTable::new(*rows, self.cmi.total_cores())))
            .collect();
        self.jobs.clear();
        self.bump_tick();
        Ok(())
    }

    /// Reconfigures the cluster without discarding resident jobs --
    /// rebuilds the CMI and re-fits every job through a full repack of
    /// each partition. Jobs that no longer fit are reported but not
    /// silently dropped.
    pub fn reconfigure(&mut self, config: &ClusterConfig) -> Result<Vec<JobId>> {
        let node_cores: Vec<usize> = config.nodes.iter().map(|n| n.cores).collect();
        self.cmi.rebuild(&node_cores)?;
        self.nut.rebuild(&config.nodes);

        let mut orphaned = Vec::new();
        let mut new_partitions = HashMap::new();
        for (name, rows) in &config.partitions {
            let mut prt = PartitionRowTable::new(*rows, self.cmi.total_cores());
            if let Some(old) = self.partitions.get(name) {
                for row in &old.rows {
                    for &job_id in &row.job_list {
                        if let Some(job) = self.jobs.get(&job_id) {
                            if prt.insert_first_fit(job_id, job, &self.cmi).is_none() {
                                orphaned.push(job_id);
                            }
                        }
                    }
                }
            }
            new_partitions.insert(name.clone(), prt);
        }
        self.partitions = new_partitions;
        self.bump_tick();
        Ok(orphaned)
    }

    pub fn update_node_config(&mut self, node: usize, config: &NodeConfig) -> Result<()> {
        if node >= self.cmi.node_count() {
            return Err(CresError::InvalidInput(format!("node {node} out of range")));
        }
        let usage = self.nut.get_mut(node);
        usage.real_memory = config.real_memory;
        usage.mem_spec_limit = config.mem_spec_limit;
        self.bump_tick();
        Ok(())
    }

    pub fn update_node_state(&mut self, node: usize, req: NodeReq) -> Result<()> {
        if node >= self.cmi.node_count() {
            return Err(CresError::InvalidInput(format!("node {node} out of range")));
        }
        self.nut.get_mut(node).acquire(req);
        self.bump_tick();
        Ok(())
    }

    fn partition(&self, partition: &str) -> Result<&PartitionRowTable> {
        self.partitions
            .get(partition)
            .ok_or_else(|| CresError::InvalidInput(format!("unknown partition {partition}")))
    }

    /// Tests (or commits, per `mode`) a job placement (spec.md §6
    /// `job_test`). `RunNow`/`WillRun` require the job to already exist
    /// in the caller's chosen `job_id` space; callers wanting a dry run
    /// only should use `PlacementMode::TestOnly`.
    #[allow(clippy::too_many_arguments)]
    pub fn job_test(
        &self,
        job_id: JobId,
        partition: &str,
        req: &JobRequest,
        candidate: &crate::bitset::Bitset,
        mode: PlacementMode,
        preemptees: &[JobId],
        exclude_cores: Option<&crate::bitset::Bitset>,
    ) -> Result<Placement> {
        let prt = self.partition(partition)?;
        let owned_exclude;
        let exclude_cores = match exclude_cores {
            Some(b) => b,
            None => {
                owned_exclude = crate::bitset::Bitset::new(self.cmi.total_cores());
                &owned_exclude
            }
        };
        placement::select_nodes(
            job_id,
            req,
            candidate,
            &self.cmi,
            &self.nut,
            prt,
            mode,
            preemptees,
            &self.jobs,
            exclude_cores,
        )
    }

    pub fn add_job_to_res(&mut self, partition: &str, job: JobResources) -> Result<()> {
        let prt = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| CresError::InvalidInput(format!("unknown partition {partition}")))?;
        lifecycle::add_job_to_res(job, &mut self.jobs, prt, &mut self.nut, &self.cmi)?;
        self.bump_tick();
        Ok(())
    }

    pub fn rm_job_from_res(
        &mut self,
        partition: &str,
        job_id: JobId,
        mode: RmJobMode,
        reconstruct: bool,
    ) -> Result<JobResources> {
        // Projected directly off `self.partitions` rather than through a
        // helper: this call also borrows `self.jobs`/`self.nut`/`self.devices`
        // simultaneously, which only typechecks if each borrow is visibly
        // tied to its own field rather than to a method call on `self`.
        let prt = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| CresError::InvalidInput(format!("unknown partition {partition}")))?;
        let removed = lifecycle::rm_job_from_res(
            job_id,
            &mut self.jobs,
            prt,
            &mut self.nut,
            &self.cmi,
            mode,
            reconstruct,
            self.devices.as_mut(),
        )?;
        self.bump_tick();
        Ok(removed)
    }

    pub fn rm_job_from_one_node(&mut self, partition: &str, job_id: JobId, node: usize) -> Result<()> {
        let prt = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| CresError::InvalidInput(format!("unknown partition {partition}")))?;
        lifecycle::rm_job_from_one_node(
            job_id,
            node,
            &mut self.jobs,
            prt,
            &mut self.nut,
            &self.cmi,
            self.devices.as_mut(),
        )?;
        self.bump_tick();
        Ok(())
    }

    pub fn job_expand(&mut self, partition: &str, from: JobId, to: JobId) -> Result<()> {
        let prt = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| CresError::InvalidInput(format!("unknown partition {partition}")))?;
        lifecycle::job_expand(from, to, &mut self.jobs, prt, &self.cmi, self.devices.as_mut())?;
        self.bump_tick();
        Ok(())
    }

    pub fn job_suspend(&mut self, partition: &str, job_id: JobId, indf_susp: bool) -> Result<()> {
        let prt = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| CresError::InvalidInput(format!("unknown partition {partition}")))?;
        lifecycle::job_suspend(job_id, &mut self.jobs, prt, indf_susp)?;
        self.bump_tick();
        Ok(())
    }

    pub fn job_resume(&mut self, partition: &str, job_id: JobId) -> Result<()> {
        let prt = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| CresError::InvalidInput(format!("unknown partition {partition}")))?;
        lifecycle::job_resume(job_id, &mut self.jobs, prt, &self.cmi)?;
        self.bump_tick();
        Ok(())
    }

    /// Tests a reservation request (spec.md §6 `resv_test`). Never
    /// mutates engine state -- committing a reservation's node/core hold
    /// is the caller's responsibility (spec.md §4.6 scopes reservation
    /// bookkeeping out of the engine).
    pub fn resv_test(
        &self,
        req: &ReservationRequest,
        avail: &crate::bitset::Bitset,
        switches: Option<&SwitchTree>,
        excluded_cores: &crate::bitset::Bitset,
    ) -> Option<ReservationSelection> {
        reservation::resv_test(req, avail, &self.cmi, switches, excluded_cores)
    }

    /// Rolls up every node's allocated cpus/memory/devices across every
    /// configured partition (spec.md §4.7 `nodeinfo_set_all`). Cached
    /// until the engine's internal tick advances.
    pub fn nodeinfo_set_all(&mut self) -> &NodeRollup {
        let stale = match &self.rollup_cache {
            Some(r) => r.is_stale(self.tick),
            None => true,
        };
        if stale {
            let partitions: Vec<PartitionRowTable> = self.partitions.values().cloned().collect();
            self.rollup_cache = Some(rollup::compute(
                &self.cmi,
                &self.nut,
                &partitions,
                self.devices.as_ref(),
                self.tick,
            ));
        }
        self.rollup_cache.as_ref().expect("just computed")
    }

    pub fn node_count(&self) -> usize {
        self.cmi.node_count()
    }

    pub fn cmi(&self) -> &CoreMapIndex {
        &self.cmi
    }

    fn bump_tick(&mut self) {
        self.tick += 1;
        self.rollup_cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::Bitset;

    fn config() -> ClusterConfig {
        ClusterConfig {
            nodes: vec![
                NodeConfig::new("n0", 2, 10_000),
                NodeConfig::new("n1", 2, 10_000),
            ],
            partitions: vec![("debug".to_string(), 2)],
        }
    }

    #[test]
    fn end_to_end_add_rollup_remove() {
        let mut engine = Engine::new(&config()).unwrap();
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
        let candidate = Bitset::from_bits(2, [0, 1]);
        let placement = engine
            .job_test(1, "debug", &req, &candidate, PlacementMode::TestOnly, &[], None)
            .unwrap();
        engine.add_job_to_res("debug", placement.job).unwrap();

        let rollup = engine.nodeinfo_set_all();
        assert_eq!(rollup.alloc_cpus[0], 1);

        engine.rm_job_from_res("debug", 1, RmJobMode::Terminate, true).unwrap();
        let rollup = engine.nodeinfo_set_all();
        assert_eq!(rollup.alloc_cpus[0], 0);
    }

    #[test]
    fn unknown_partition_is_invalid_input() {
        let mut engine = Engine::new(&config()).unwrap();
        let err = engine.rm_job_from_res("nonexistent", 1, RmJobMode::Terminate, true).unwrap_err();
        assert!(matches!(err, CresError::InvalidInput(_)));
    }
}
