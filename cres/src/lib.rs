//! `cres`: a consumable-resource node-selection engine for cluster
//! workload managers -- bitmap-packed core accounting, per-partition
//! oversubscription rows, job placement and lifecycle, and a
//! topology-aware reservation planner.

pub mod bitset;
pub mod cmi;
pub mod device;
pub mod engine;
pub mod error;
pub mod fit;
pub mod job;
pub mod lifecycle;
pub mod node;
pub mod placement;
pub mod reservation;
pub mod rollup;
pub mod row;

pub use crate::engine::{ClusterConfig, Engine};
pub use crate::error::{CresError, Result};
