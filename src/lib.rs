//! LVM Node Operator
//!
//! Provisions and continuously reconciles local LVM volume groups on a
//! cluster node so a CSI layer can carve logical volumes out of them.
//! Administrators declare device classes (a volume group name plus the block
//! devices backing it) on the LvmCluster resource; a scheduled one-shot run
//! of this agent converges the node's actual LVM state and publishes the
//! outcome as a per-node ConfigMap.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     One reconciliation pass                       │
//! │                                                                   │
//! │  LvmCluster spec ──┐                                              │
//! │                    ▼                                              │
//! │  ┌──────────────┐  ┌────────────────────────┐  ┌──────────────┐   │
//! │  │ Loop Device  │─▶│  Reconciliation Engine │◀─│   Device     │   │
//! │  │   Manager    │  │  (create/expand/shrink │  │   Scanner    │   │
//! │  └──────────────┘  │   /delete per class)   │  └──────────────┘   │
//! │                    └───────────┬────────────┘                     │
//! │                                │ LVM Adapter (pv*/vg* via nsenter)│
//! │                                ▼                                  │
//! │          ConfigMap { status.json, lvmd.yaml }  (atomic replace)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`reconcile`]: the per-class state machine
//! - [`inventory`]: block device enumeration and availability rules
//! - [`lvm`]: the LVM command adapter
//! - [`loopdev`]: file-backed loop device management
//! - [`state`]: persisted status types and the derived lvmd configuration
//! - [`persist`]: the ConfigMap persistence boundary
//! - [`crd`]: the LvmCluster custom resource
//! - [`exec`]: host-namespace command execution
//! - [`error`]: error types and handling

pub mod config;
pub mod crd;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod loopdev;
pub mod lvm;
pub mod persist;
pub mod reconcile;
pub mod state;

// Re-export commonly used types
pub use config::AgentConfig;
pub use crd::{DeviceClassSpec, DiskRef, LvmCluster, LvmClusterSpec, NodeDeviceClasses};
pub use error::{Error, Result};
pub use exec::{CommandExecutor, HostExecutor};
pub use inventory::{DeviceScanner, Disk, DiskType};
pub use loopdev::LoopDeviceManager;
pub use lvm::{LvmAdapter, PhysicalVolume, VolumeGroup};
pub use persist::ConfigMapStore;
pub use reconcile::{ReconcileEngine, ReconcileOutcome};
pub use state::{
    ClassSets, ClassState, ClassStatus, DeviceState, DeviceStatus, FailureReason, LoopState,
    LoopStatus, LvmdConfig, LvmdDeviceClass, NodePhase, NodeStorageState, Outcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
