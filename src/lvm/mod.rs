//! LVM Command Adapter
//!
//! Physical-volume and volume-group operations, executed through the
//! host-namespace command executor.

pub mod adapter;

pub use adapter::*;
