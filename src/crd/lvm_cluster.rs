//! LvmCluster CRD
//!
//! Declares, per node, the device classes to aggregate into LVM volume
//! groups. A global `storage` list acts as a fallback when every node shares
//! the same classes. The cluster-level controller owns this resource and its
//! status; the node agent treats it as read-only desired state.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// LvmCluster CRD
// =============================================================================

/// LvmCluster declares the desired LVM volume groups across the cluster.
/// Each device class names a volume group and the block devices backing it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "LvmCluster",
    plural = "lvmclusters",
    shortname = "lc",
    status = "LvmClusterStatus",
    printcolumn = r#"{"name": "Nodes", "type": "integer", "jsonPath": ".status.nodeCount"}"#,
    printcolumn = r#"{"name": "Degraded", "type": "integer", "jsonPath": ".status.degradedCount"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LvmClusterSpec {
    /// Per-node device class declarations
    #[serde(default)]
    pub device_classes: Vec<NodeDeviceClasses>,

    /// Fallback classes applied to every node without an explicit entry
    #[serde(default)]
    pub storage: Vec<DeviceClassSpec>,
}

/// Device classes declared for one node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeviceClasses {
    /// Name of the Kubernetes node
    pub node_name: String,

    /// Classes to reconcile on that node
    #[serde(default)]
    pub classes: Vec<DeviceClassSpec>,
}

// =============================================================================
// Device Class Spec
// =============================================================================

/// One named grouping of block devices aggregated into a volume group
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClassSpec {
    /// Class name exposed to the CSI layer
    pub class_name: String,

    /// Volume group name; the natural key, at most one class per vg per node
    pub vg_name: String,

    /// Devices to aggregate
    #[serde(default)]
    pub devices: Vec<DiskRef>,

    /// Whether this class is the node's default
    #[serde(default)]
    pub default: bool,

    /// Spare capacity in GiB kept unallocated by the LVM daemon
    #[serde(default)]
    pub spare_gb: Option<u64>,

    /// Number of stripes for logical volumes carved from this class
    #[serde(default)]
    pub stripe: Option<u64>,

    /// Stripe size (e.g., "64k")
    #[serde(default)]
    pub stripe_size: Option<String>,
}

/// Reference to one declared block device
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskRef {
    /// Device path for real hardware, or the stable logical name for an
    /// auto-provisioned loop device
    pub name: String,

    /// Declared device type hint
    #[serde(default, rename = "type")]
    pub disk_type: Option<String>,

    /// Auto-provision a file-backed loop device for this entry
    #[serde(default)]
    pub auto: bool,

    /// Backing-file path override for auto devices
    #[serde(default)]
    pub path: Option<String>,

    /// Backing-file size in whole GiB for auto devices
    #[serde(default)]
    pub size: Option<u64>,
}

impl DiskRef {
    /// Default backing size when an auto entry omits it
    pub fn size_gib(&self) -> u64 {
        self.size.unwrap_or(10)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Cluster-level rollup written by the external controller
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LvmClusterStatus {
    /// Number of nodes with a published status document
    #[serde(default)]
    pub node_count: u32,

    /// Number of nodes with at least one failing class
    #[serde(default)]
    pub degraded_count: u32,

    /// Nodes currently degraded
    #[serde(default)]
    pub degraded_nodes: Vec<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl LvmCluster {
    /// Device classes addressed to the given node.
    ///
    /// A per-node entry wins; otherwise the global `storage` list applies.
    /// Duplicate vg names are dropped (first declaration wins) so the engine
    /// only ever sees one spec per volume group.
    pub fn device_classes_for(&self, node: &str) -> Vec<DeviceClassSpec> {
        let classes = self
            .spec
            .device_classes
            .iter()
            .find(|entry| entry.node_name == node)
            .map(|entry| entry.classes.clone())
            .unwrap_or_else(|| self.spec.storage.clone());

        dedup_by_vg(classes)
    }
}

fn dedup_by_vg(classes: Vec<DeviceClassSpec>) -> Vec<DeviceClassSpec> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::with_capacity(classes.len());
    for class in classes {
        if seen.insert(class.vg_name.clone()) {
            out.push(class);
        } else {
            warn!(
                "Duplicate device class for vg {} ignored (class {})",
                class.vg_name, class.class_name
            );
        }
    }
    out
}
