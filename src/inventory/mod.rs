//! Device Inventory
//!
//! Enumerates block devices on the node and decides which of them are
//! available to join a volume group.

pub mod disk;
pub mod scanner;

pub use disk::*;
pub use scanner::*;
