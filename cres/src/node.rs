//! Node Usage Table: per-node allocated memory, sharing state and typed
//! device bookkeeping.

use indexmap::IndexMap;
use log::warn;

/// The sharing mode a node has been placed into by its resident jobs.
/// Mirrors the `node_req` a job itself requests (see [`crate::job::NodeReq`])
/// but tracked per node since multiple jobs can layer shareable requests
/// onto the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Available,
    OneJobNoShare,
    Shared,
}

/// Per-node occupancy bookkeeping outside the core bitmap: memory and a
/// share counter tracking how many resident jobs imposed a sharing mode
/// on the node.
#[derive(Debug, Clone)]
pub struct NodeUsage {
    pub alloc_memory: u64,
    pub real_memory: u64,
    pub mem_spec_limit: u64,
    pub state: NodeState,
    share_count: u32,
    pub typed_device_state: Option<DeviceAllocation>,
    /// Hardware threads per physical core, carried from [`NodeConfig`] for
    /// the rollup's cpu/core scaling (spec.md §4.7, §9 "thread scaling
    /// ambiguity").
    pub threads_per_core: u32,
}

/// Opaque handle to whatever the typed-device subsystem allocated for a
/// job on this node; passed through to [`DeviceSubsystem`] unexamined.
#[derive(Debug, Clone, Default)]
pub struct DeviceAllocation {
    pub counts: Vec<(String, u64)>,
}

impl NodeUsage {
    pub fn new(real_memory: u64, mem_spec_limit: u64) -> Self {
        Self::with_threads(real_memory, mem_spec_limit, 1)
    }

    pub fn with_threads(real_memory: u64, mem_spec_limit: u64, threads_per_core: u32) -> Self {
        Self {
            alloc_memory: 0,
            real_memory,
            mem_spec_limit,
            state: NodeState::Available,
            share_count: 0,
            typed_device_state: None,
            threads_per_core: threads_per_core.max(1),
        }
    }

    pub fn available_memory(&self) -> u64 {
        self.real_memory
            .saturating_sub(self.mem_spec_limit)
            .saturating_sub(self.alloc_memory)
    }

    pub fn add_memory(&mut self, amount: u64) {
        self.alloc_memory += amount;
    }

    /// Subtracts `amount`, clamping to zero on underflow. Spec.md §7:
    /// underflow is logged and repaired in place, never returned as an
    /// error.
    pub fn sub_memory(&mut self, amount: u64) {
        match self.alloc_memory.checked_sub(amount) {
            Some(v) => self.alloc_memory = v,
            None => {
                warn!(
                    "memory underflow: tried to release {amount} but only {} allocated; clamping to 0",
                    self.alloc_memory
                );
                self.alloc_memory = 0;
            }
        }
    }

    /// Raises the node's sharing state to at least `req`.
    pub fn acquire(&mut self, req: super::job::NodeReq) {
        self.share_count += 1;
        self.state = match req {
            super::job::NodeReq::Available => NodeState::Shared,
            super::job::NodeReq::OneRow => {
                if self.state == NodeState::Available {
                    NodeState::OneJobNoShare
                } else {
                    self.state
                }
            }
            super::job::NodeReq::Reserved => NodeState::OneJobNoShare,
        };
    }

    /// Releases one job's hold on the node, clamping to `Available` with
    /// a logged inconsistency on underflow (spec.md §4.5,
    /// `rm_job_from_one_node`).
    pub fn release(&mut self) {
        match self.share_count.checked_sub(1) {
            Some(v) => self.share_count = v,
            None => {
                warn!("node_state share counter underflowed; clamping to 0");
                self.share_count = 0;
            }
        }
        if self.share_count == 0 {
            self.state = NodeState::Available;
        }
    }
}

/// Node-wide occupancy state, keyed by node index. Owned by [`crate::engine::Engine`]
/// for the lifetime of the node table.
#[derive(Debug, Clone, Default)]
pub struct NodeUsageTable {
    // Indexed map rather than a plain hash map: node iteration order
    // (e.g. in the rollup) should match ascending node index, which
    // insertion order from `rebuild` already gives for free.
    nodes: IndexMap<usize, NodeUsage>,
}

impl NodeUsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&mut self, configs: &[NodeConfig]) {
        self.nodes = configs
            .iter()
            .enumerate()
            .map(|(i, c)| (i, NodeUsage::with_threads(c.real_memory, c.mem_spec_limit, c.threads_per_core)))
            .collect();
    }

    pub fn get(&self, node: usize) -> &NodeUsage {
        self.nodes.get(&node).expect("node index out of range")
    }

    pub fn get_mut(&mut self, node: usize) -> &mut NodeUsage {
        self.nodes.get_mut(&node).expect("node index out of range")
    }
}

/// Static per-node configuration the controller supplies at `node_init`
/// time. Parsing this from whatever config-file format the cluster uses
/// is explicitly out of the engine's scope (spec.md §1); this struct is
/// the parsed result the caller hands in.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub cores: usize,
    pub threads_per_core: u32,
    pub real_memory: u64,
    pub mem_spec_limit: u64,
    /// Index of the leaf switch this node hangs off, if a switch tree is
    /// configured (used by the topology-aware reservation planner, §4.6).
    pub switch: Option<usize>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, cores: usize, real_memory: u64) -> Self {
        Self {
            name: name.into(),
            cores,
            threads_per_core: 1,
            real_memory,
            mem_spec_limit: 0,
            switch: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NodeReq;

    #[test]
    fn memory_add_sub_roundtrip() {
        let mut usage = NodeUsage::new(1000, 0);
        usage.add_memory(400);
        assert_eq!(usage.alloc_memory, 400);
        assert_eq!(usage.available_memory(), 600);
        usage.sub_memory(400);
        assert_eq!(usage.alloc_memory, 0);
    }

    #[test]
    fn memory_sub_underflow_clamps() {
        let mut usage = NodeUsage::new(1000, 0);
        usage.add_memory(100);
        usage.sub_memory(500);
        assert_eq!(usage.alloc_memory, 0);
    }

    #[test]
    fn share_state_transitions() {
        let mut usage = NodeUsage::new(1000, 0);
        usage.acquire(NodeReq::OneRow);
        assert_eq!(usage.state, NodeState::OneJobNoShare);
        usage.acquire(NodeReq::Available);
        assert_eq!(usage.state, NodeState::Shared);
        usage.release();
        assert_eq!(usage.state, NodeState::Shared);
        usage.release();
        assert_eq!(usage.state, NodeState::Available);
    }

    #[test]
    fn release_underflow_clamps_to_available() {
        let mut usage = NodeUsage::new(1000, 0);
        usage.release();
        assert_eq!(usage.state, NodeState::Available);
    }
}
