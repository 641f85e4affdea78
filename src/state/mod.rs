//! Persisted State
//!
//! The status document types, the keyed success/failure class collections,
//! and the derived lvmd configuration.

pub mod class_sets;
pub mod lvmd;
pub mod status;

pub use class_sets::*;
pub use lvmd::*;
pub use status::*;
