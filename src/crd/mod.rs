//! Custom Resource Definitions
//!
//! The LvmCluster resource carries the desired device classes for every node;
//! the agent only ever reads the slice addressed to its own node.

pub mod lvm_cluster;

pub use lvm_cluster::*;
