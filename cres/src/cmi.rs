//! Core-Map Index: flat numbering of every core in the cluster.
//!
//! A prefix sum over per-node core counts gives each node's offset into
//! the global bit space. All other components (row bitmaps, job core
//! bitmaps, reservation masks) express themselves as positions through
//! this single table.

use crate::error::{CresError, Result};

#[derive(Debug, Clone, Default)]
pub struct CoreMapIndex {
    /// `offset[n]` = sum of cores on nodes `0..n`.
    offset: Vec<usize>,
    cores: Vec<usize>,
    total: usize,
}

impl CoreMapIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rebuilds the index from a per-node core-count table. Per spec.md
    /// §4.1, every bitmap derived from the previous index (row bitmaps,
    /// reservation masks) is invalidated by this call; callers must
    /// reconstruct them before use -- `Engine::reconfigure` does so.
    pub fn rebuild(&mut self, node_cores: &[usize]) -> Result<()> {
        if node_cores.iter().any(|&c| c == 0) {
            return Err(CresError::InvalidInput(
                "node with zero cores in core-map rebuild".into(),
            ));
        }
        let mut offset = Vec::with_capacity(node_cores.len());
        let mut running = 0usize;
        for &c in node_cores {
            offset.push(running);
            running += c;
        }
        self.offset = offset;
        self.cores = node_cores.to_vec();
        self.total = running;
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.cores.len()
    }

    pub fn offset(&self, node: usize) -> usize {
        self.offset[node]
    }

    pub fn cores(&self, node: usize) -> usize {
        self.cores[node]
    }

    pub fn total_cores(&self) -> usize {
        self.total
    }

    /// Projects a local core index on `node` to its global CMI bit
    /// position.
    pub fn global_bit(&self, node: usize, local_core: usize) -> usize {
        debug_assert!(local_core < self.cores[node]);
        self.offset[node] + local_core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_computes_prefix_sums() {
        let mut cmi = CoreMapIndex::empty();
        cmi.rebuild(&[2, 4, 1]).unwrap();
        assert_eq!(cmi.offset(0), 0);
        assert_eq!(cmi.offset(1), 2);
        assert_eq!(cmi.offset(2), 6);
        assert_eq!(cmi.total_cores(), 7);
        assert_eq!(cmi.global_bit(2, 0), 6);
    }

    #[test]
    fn rejects_zero_core_node() {
        let mut cmi = CoreMapIndex::empty();
        assert!(cmi.rebuild(&[2, 0, 1]).is_err());
    }
}
