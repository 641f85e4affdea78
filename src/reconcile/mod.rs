//! Volume-Group Reconciliation
//!
//! The per-pass state machine converging the node's LVM state to the
//! declared device classes.

pub mod engine;

pub use engine::*;
