//! Node Storage Status Document
//!
//! The sole persisted artifact of a reconciliation pass: the engine's memory
//! of prior outcomes and the payload the cluster controller reads. Serialized
//! as `status.json` inside the per-node ConfigMap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Failure Reasons
// =============================================================================

/// Closed set of per-class failure reasons.
///
/// Consumers branch on this instead of string-matching the free-text
/// `message`, which only carries tool output for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A declared device is filesystem-bearing, mounted, too small, or absent
    DeviceUnavailable,
    /// pvcreate/vgcreate failed
    CreateFailed,
    /// vgextend failed after some PVs were already added
    ExpandWarning,
    /// pvcreate/vgextend failed before the group changed
    ExpandError,
    /// vgreduce refused or failed
    ShrinkError,
    /// vgremove refused or failed
    DeleteError,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::DeviceUnavailable => write!(f, "DeviceUnavailable"),
            FailureReason::CreateFailed => write!(f, "CreateFailed"),
            FailureReason::ExpandWarning => write!(f, "ExpandWarning"),
            FailureReason::ExpandError => write!(f, "ExpandError"),
            FailureReason::ShrinkError => write!(f, "ShrinkError"),
            FailureReason::DeleteError => write!(f, "DeleteError"),
        }
    }
}

// =============================================================================
// Device State
// =============================================================================

/// Availability of one declared device at the last pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Last known state of one physical/loop device belonging to a class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub name: String,
    pub state: DeviceStatus,
    #[serde(default)]
    pub message: String,
}

impl DeviceState {
    pub fn online(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: DeviceStatus::Online,
            message: String::new(),
        }
    }

    pub fn offline(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: DeviceStatus::Offline,
            message: message.into(),
        }
    }
}

// =============================================================================
// Class State
// =============================================================================

/// Outcome state of one device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassStatus {
    Ready,
    UnReady,
}

/// Persisted outcome of one device class, keyed by its volume group name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassState {
    pub name: String,
    pub vg_name: String,
    pub state: ClassStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub device_states: Vec<DeviceState>,
}

impl ClassState {
    /// A Ready class with every device online
    pub fn ready(name: &str, vg_name: &str, devices: Vec<DeviceState>) -> Self {
        Self {
            name: name.to_string(),
            vg_name: vg_name.to_string(),
            state: ClassStatus::Ready,
            reason: None,
            message: String::new(),
            device_states: devices,
        }
    }

    /// An UnReady class with a reason and tool message
    pub fn failed(
        name: &str,
        vg_name: &str,
        reason: FailureReason,
        message: impl Into<String>,
        devices: Vec<DeviceState>,
    ) -> Self {
        Self {
            name: name.to_string(),
            vg_name: vg_name.to_string(),
            state: ClassStatus::UnReady,
            reason: Some(reason),
            message: message.into(),
            device_states: devices,
        }
    }

    /// Flag a warning on an otherwise Ready class (expand/shrink/delete
    /// trouble that does not demote it)
    pub fn flag(&mut self, reason: FailureReason, message: impl Into<String>) {
        self.reason = Some(reason);
        self.message = message.into();
    }

    /// Clear any prior flag after a clean pass
    pub fn clear_flag(&mut self) {
        self.reason = None;
        self.message.clear();
    }
}

// =============================================================================
// Loop State
// =============================================================================

/// Outcome of provisioning one auto loop device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStatus {
    Succeeded,
    Failed,
}

/// Stable logical-name → loop-device binding, persisted across runs.
///
/// Keyed by `name` (the logical id in the spec); `device_name` is refreshed
/// whenever the kernel renumbers loop devices, but a successful binding is
/// never silently replaced by a new backing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub name: String,
    pub file: String,
    pub device_name: String,
    pub status: LoopStatus,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Node Storage State
// =============================================================================

/// Overall node phase derived from the class sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    Pending,
    Ready,
    Degraded,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Pending => write!(f, "Pending"),
            NodePhase::Ready => write!(f, "Ready"),
            NodePhase::Degraded => write!(f, "Degraded"),
        }
    }
}

/// The full status document for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStorageState {
    pub node: String,
    #[serde(default)]
    pub phase: NodePhase,
    #[serde(default)]
    pub success_classes: Vec<ClassState>,
    #[serde(default)]
    pub fail_classes: Vec<ClassState>,
    #[serde(default)]
    pub loops: Vec<LoopState>,
    /// Completion time of the last pass. Refreshed even when nothing else
    /// changed, so consumers must not treat a change here alone as a
    /// semantic update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

impl NodeStorageState {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    /// Look up the persisted loop binding for a logical name
    pub fn loop_by_name(&self, name: &str) -> Option<&LoopState> {
        self.loops.iter().find(|l| l.name == name)
    }

    /// Ready when nothing is failing and at least one pass completed
    pub fn compute_phase(&mut self) {
        self.phase = if !self.fail_classes.is_empty() {
            NodePhase::Degraded
        } else {
            NodePhase::Ready
        };
    }
}
