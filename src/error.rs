//! Error types for the LVM node operator
//!
//! Provides structured error types for all components: device inventory,
//! the LVM command adapter, loop device management, reconciliation, and
//! the ConfigMap persistence boundary.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    #[error("Command failed to start: {program}: {reason}")]
    CommandSpawn { program: String, reason: String },

    #[error("Command exited non-zero: {program} {args}: {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        stderr: String,
    },

    // =========================================================================
    // Device Inventory Errors
    // =========================================================================
    #[error("Device discovery failed: {0}")]
    DeviceDiscovery(String),

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Device not usable: {device}: {reason}")]
    DeviceNotUsable { device: String, reason: String },

    // =========================================================================
    // LVM Errors
    // =========================================================================
    #[error("Volume group {vg} still hosts logical volumes")]
    VolumeGroupBusy { vg: String },

    #[error("Physical volume {pv} still backs a logical volume")]
    PhysicalVolumeBusy { pv: String },

    #[error("LVM report parse error: {0}")]
    LvmReportParse(String),

    // =========================================================================
    // Loop Device Errors
    // =========================================================================
    #[error("Loop attach failed for {file}: {reason}")]
    LoopAttach { file: String, reason: String },

    #[error("Loop backing file error: {file}: {source}")]
    LoopBackingFile {
        file: String,
        source: std::io::Error,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that abort the whole reconciliation pass.
    ///
    /// Per-class LVM/loop failures are recorded in the status document and
    /// never abort the pass; inventory and persistence failures do.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DeviceDiscovery(_)
                | Error::Kube(_)
                | Error::Configuration(_)
                | Error::Internal(_)
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
