//! Agent Configuration
//!
//! One explicit configuration struct constructed at process start and passed
//! by reference into the scanner, adapter, and engine. There is no ambient
//! package-level state anywhere in the crate.

use std::path::PathBuf;

// =============================================================================
// Constants
// =============================================================================

/// Minimum usable size for a device joining a volume group (2 GiB).
pub const MIN_DEVICE_SIZE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Prefix for the per-node status/config ConfigMap name.
pub const CONFIGMAP_PREFIX: &str = "lvm-node";

/// Annotation recording which node a status/config ConfigMap belongs to.
pub const NODE_ANNOTATION: &str = "storage.billyronks.io/node";

// =============================================================================
// Agent Configuration
// =============================================================================

/// Configuration for one reconciliation run
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name of the Kubernetes node this agent reconciles
    pub node_name: String,
    /// Namespace holding the cluster resource and the status ConfigMap
    pub namespace: String,
    /// Name of the LvmCluster resource carrying the desired device classes
    pub cluster_name: String,
    /// Unix socket path written into the generated lvmd configuration
    pub lvmd_socket: String,
    /// Directory for auto-provisioned loop backing files
    pub loop_dir: PathBuf,
    /// PID whose mount/PID namespaces host commands are entered into
    pub host_pid: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            namespace: "lvm-system".to_string(),
            cluster_name: "lvmcluster".to_string(),
            lvmd_socket: "/run/lvmd/lvmd.sock".to_string(),
            loop_dir: PathBuf::from("/var/lib/lvm-node-operator/loop"),
            host_pid: 1,
        }
    }
}

impl AgentConfig {
    /// Validate fields that have no usable default
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.node_name.is_empty() {
            return Err(crate::error::Error::Configuration(
                "node name must not be empty".into(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(crate::error::Error::Configuration(
                "namespace must not be empty".into(),
            ));
        }
        Ok(())
    }
}
