//! LVM Daemon Configuration
//!
//! The consumer-facing document listing which volume groups exist and their
//! policy attributes, derived from the success set after every pass and
//! serialized as `lvmd.yaml` inside the per-node ConfigMap. The cluster
//! controller redeploys the node-local LVM daemon whenever its content
//! changes.

use crate::crd::DeviceClassSpec;
use crate::state::status::ClassState;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// One runtime device class handed to the LVM daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LvmdDeviceClass {
    pub name: String,
    pub volume_group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spare_gb: Option<u64>,
    #[serde(default)]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_size: Option<String>,
}

/// The full lvmd configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LvmdConfig {
    pub socket_name: String,
    #[serde(default)]
    pub device_classes: Vec<LvmdDeviceClass>,
}

// =============================================================================
// Derivation
// =============================================================================

impl LvmdConfig {
    /// Derive the daemon configuration from the final success set.
    ///
    /// Policy attributes (default flag, spare, striping) always come from the
    /// desired spec, so an untouched Ready class still picks up a changed
    /// `default` flag. A class lingering in the success set without a spec
    /// entry (a flagged, pending delete) keeps its group exposed with
    /// neutral policy.
    pub fn derive<'a>(
        socket_name: &str,
        successes: impl Iterator<Item = &'a ClassState>,
        desired: &[DeviceClassSpec],
    ) -> Self {
        let device_classes = successes
            .map(|class| {
                let spec = desired.iter().find(|s| s.vg_name == class.vg_name);
                LvmdDeviceClass {
                    name: class.name.clone(),
                    volume_group: class.vg_name.clone(),
                    spare_gb: spec.and_then(|s| s.spare_gb),
                    default: spec.map(|s| s.default).unwrap_or(false),
                    stripe: spec.and_then(|s| s.stripe),
                    stripe_size: spec.and_then(|s| s.stripe_size.clone()),
                }
            })
            .collect();

        Self {
            socket_name: socket_name.to_string(),
            device_classes,
        }
    }
}
