//! Block Device Model
//!
//! A [`Disk`] is produced fresh on every scan and never persisted. The
//! availability rules here are the single source of truth for whether a
//! device may join a volume group.

use crate::config::MIN_DEVICE_SIZE_BYTES;
use serde::{Deserialize, Serialize};

// =============================================================================
// Disk Type
// =============================================================================

/// Block device type as reported by the discovery tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Disk,
    Loop,
    Partition,
    Other,
}

impl DiskType {
    pub fn parse(s: &str) -> Self {
        match s {
            "disk" => DiskType::Disk,
            "loop" => DiskType::Loop,
            "part" | "partition" => DiskType::Partition,
            _ => DiskType::Other,
        }
    }

    /// Only whole disks and loop devices may join a volume group
    pub fn supported(&self) -> bool {
        matches!(self, DiskType::Disk | DiskType::Loop)
    }
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskType::Disk => write!(f, "disk"),
            DiskType::Loop => write!(f, "loop"),
            DiskType::Partition => write!(f, "partition"),
            DiskType::Other => write!(f, "other"),
        }
    }
}

// =============================================================================
// Disk
// =============================================================================

/// One block device observed on the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    /// Device path (e.g., /dev/sdb, /dev/loop3)
    pub name: String,
    /// Device type
    pub disk_type: DiskType,
    /// Size in bytes
    pub size: u64,
    /// Filesystem signature, empty if none
    pub filesystem: String,
    /// Mount point, empty if unmounted
    pub mount_point: String,
    /// Parent device path, empty for top-level devices
    pub parent: String,
    /// Whether any other device lists this one as its parent
    pub has_children: bool,
}

impl Disk {
    /// Why this disk cannot join a volume group, or `None` if it can.
    pub fn unavailable_reason(&self) -> Option<String> {
        if !self.disk_type.supported() {
            return Some(format!("unsupported device type {}", self.disk_type));
        }
        if !self.filesystem.is_empty() {
            return Some(format!("device carries a {} filesystem", self.filesystem));
        }
        if !self.mount_point.is_empty() {
            return Some(format!("device is mounted at {}", self.mount_point));
        }
        if self.has_children {
            return Some("device has child block devices".to_string());
        }
        if self.size < MIN_DEVICE_SIZE_BYTES {
            return Some(format!(
                "device size {} below minimum {} bytes",
                self.size, MIN_DEVICE_SIZE_BYTES
            ));
        }
        None
    }

    pub fn is_available(&self) -> bool {
        self.unavailable_reason().is_none()
    }
}
