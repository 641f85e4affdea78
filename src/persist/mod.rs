//! Status/Config Persistence Boundary
//!
//! One ConfigMap per node holds the whole output of a pass: `status.json`
//! (the serialized [`NodeStorageState`]) and `lvmd.yaml` (the derived LVM
//! daemon configuration). Reads tolerate a missing document (first run);
//! writes replace the full data map in one server-side apply, so observers
//! never see a status that disagrees with the config next to it.

use crate::config::{AgentConfig, CONFIGMAP_PREFIX, NODE_ANNOTATION};
use crate::error::Result;
use crate::state::{LvmdConfig, NodeStorageState};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::Api;
use std::collections::BTreeMap;
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

/// Data key holding the serialized NodeStorageState
pub const STATUS_KEY: &str = "status.json";

/// Data key holding the serialized lvmd configuration
pub const LVMD_KEY: &str = "lvmd.yaml";

/// Kubernetes object-name ceiling we stay under when deriving the name
const MAX_NAME_LEN: usize = 63;

const FIELD_MANAGER: &str = "lvm-node-operator";

// =============================================================================
// Store
// =============================================================================

/// Reads and atomically replaces the per-node status/config ConfigMap
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    node_name: String,
    namespace: String,
}

impl ConfigMapStore {
    pub fn new(client: kube::Client, config: &AgentConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            node_name: config.node_name.clone(),
            namespace: config.namespace.clone(),
        }
    }

    /// Load the previously persisted status document.
    ///
    /// A missing ConfigMap, or one without a status portion yet, yields the
    /// empty first-run state; the engine then takes the full first-time path.
    pub async fn load(&self) -> Result<NodeStorageState> {
        let name = configmap_name(&self.node_name);
        match self.api.get_opt(&name).await? {
            None => {
                debug!("No status ConfigMap {} yet, first run", name);
                Ok(NodeStorageState::new(&self.node_name))
            }
            Some(cm) => {
                let data = cm.data.unwrap_or_default();
                match data.get(STATUS_KEY) {
                    None => {
                        debug!("ConfigMap {} has no {} yet", name, STATUS_KEY);
                        Ok(NodeStorageState::new(&self.node_name))
                    }
                    Some(raw) => Ok(serde_json::from_str(raw)?),
                }
            }
        }
    }

    /// Replace the whole document (status + lvmd config) in one operation.
    pub async fn store(&self, state: &NodeStorageState, lvmd: &LvmdConfig) -> Result<()> {
        let name = configmap_name(&self.node_name);
        let cm = build_configmap(&name, &self.namespace, &self.node_name, state, lvmd)?;

        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await?;

        info!("Persisted status/config ConfigMap {}", name);
        Ok(())
    }
}

// =============================================================================
// Document Construction
// =============================================================================

/// Build the full ConfigMap object for one pass's output
pub fn build_configmap(
    name: &str,
    namespace: &str,
    node: &str,
    state: &NodeStorageState,
    lvmd: &LvmdConfig,
) -> Result<ConfigMap> {
    let mut data = BTreeMap::new();
    data.insert(STATUS_KEY.to_string(), serde_json::to_string(state)?);
    data.insert(LVMD_KEY.to_string(), serde_yaml::to_string(lvmd)?);

    let mut annotations = BTreeMap::new();
    annotations.insert(NODE_ANNOTATION.to_string(), node.to_string());

    Ok(ConfigMap {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Derive the per-node ConfigMap name.
///
/// Node names can exceed what fits in an object name together with the
/// prefix; long names are truncated and suffixed with a stable hash. The
/// authoritative node name always lives in the annotation, so consumers
/// never parse the object name.
pub fn configmap_name(node: &str) -> String {
    let sanitized: String = node
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let full = format!("{}-{}", CONFIGMAP_PREFIX, sanitized);
    if full.len() <= MAX_NAME_LEN {
        return full.trim_end_matches(['-', '.']).to_string();
    }

    let digest = format!("{:016x}", fnv1a(node));
    let budget = MAX_NAME_LEN - CONFIGMAP_PREFIX.len() - digest.len() - 2;
    let head: String = sanitized.chars().take(budget).collect();
    format!(
        "{}-{}-{}",
        CONFIGMAP_PREFIX,
        head.trim_end_matches(['-', '.']),
        digest
    )
}

/// FNV-1a, chosen over the stdlib hasher for stability across builds
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
