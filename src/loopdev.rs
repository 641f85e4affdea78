//! Loop Device Manager
//!
//! Lets a device class reference a file-backed block device instead of real
//! hardware. Backing files live on a hostPath-mounted directory and are
//! created sparse; attachment happens through the host-namespace executor so
//! the resulting `/dev/loopN` is visible to the node, not just the agent.
//!
//! Auto-provisioned classes are keyed by the logical name in the spec, never
//! by the kernel-assigned loop number, so restarts (which renumber loop
//! devices) re-resolve rather than re-provision.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Creates, resolves, and re-attaches file-backed loop devices
pub struct LoopDeviceManager {
    executor: Arc<dyn CommandExecutor>,
    loop_dir: PathBuf,
}

impl LoopDeviceManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &AgentConfig) -> Self {
        Self {
            executor,
            loop_dir: config.loop_dir.clone(),
        }
    }

    /// Backing-file path for a logical loop name from the spec
    pub fn backing_file_for(&self, logical_name: &str) -> PathBuf {
        self.loop_dir.join(format!("{}.img", logical_name))
    }

    /// Create a sparse backing file of `size_gib` and attach the first free
    /// loop device to it. On attach failure the backing file is removed, so
    /// a failed class leaves no orphaned files behind.
    pub fn create_loop(&self, file: &Path, size_gib: u64) -> Result<String> {
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::LoopBackingFile {
                file: file.display().to_string(),
                source: e,
            })?;
        }

        let backing = OpenOptions::new()
            .create(true)
            .write(true)
            .open(file)
            .map_err(|e| Error::LoopBackingFile {
                file: file.display().to_string(),
                source: e,
            })?;
        backing
            .set_len(size_gib * GIB)
            .map_err(|e| Error::LoopBackingFile {
                file: file.display().to_string(),
                source: e,
            })?;

        let path = file.display().to_string();
        match self.executor.run("losetup", &["-f", "--show", &path]) {
            Ok(device) if !device.is_empty() => {
                info!("Attached loop device {} for {}", device, path);
                Ok(device)
            }
            Ok(_) => {
                self.discard_backing_file(file);
                Err(Error::LoopAttach {
                    file: path,
                    reason: "losetup returned no device".into(),
                })
            }
            Err(e) => {
                self.discard_backing_file(file);
                Err(Error::LoopAttach {
                    file: path,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Idempotently ensure the backing file is attached, returning the live
    /// device name. If a device already exposes this file, nothing changes.
    /// Otherwise the previously recorded device is tried first; when that
    /// number has been taken by something else since the restart, the first
    /// free device is used instead.
    pub fn reattach(&self, file: &Path, expected_device: &str) -> Result<String> {
        let path = file.display().to_string();

        if let Some(device) = self.find_attached(file)? {
            debug!("Loop device {} already exposes {}", device, path);
            return Ok(device);
        }

        if !file.exists() {
            return Err(Error::LoopAttach {
                file: path,
                reason: "backing file missing".into(),
            });
        }

        if !expected_device.is_empty() {
            match self.executor.run("losetup", &[expected_device, &path]) {
                Ok(_) => {
                    info!("Re-attached {} as {}", path, expected_device);
                    return Ok(expected_device.to_string());
                }
                Err(e) => {
                    warn!(
                        "Explicit re-attach of {} as {} failed ({}), using first free device",
                        path, expected_device, e
                    );
                }
            }
        }

        let device = self
            .executor
            .run("losetup", &["-f", "--show", &path])
            .map_err(|e| Error::LoopAttach {
                file: path.clone(),
                reason: e.to_string(),
            })?;
        info!("Re-attached {} as {}", path, device);
        Ok(device)
    }

    /// Which loop device currently exposes this backing file, if any.
    ///
    /// `losetup -j` prints `/dev/loopN: [maj:min]:inode (/path)` per match.
    fn find_attached(&self, file: &Path) -> Result<Option<String>> {
        let path = file.display().to_string();
        let output = self.executor.run("losetup", &["-j", &path])?;
        Ok(output
            .lines()
            .next()
            .and_then(|line| line.split(':').next())
            .map(|device| device.trim().to_string())
            .filter(|device| !device.is_empty()))
    }

    fn discard_backing_file(&self, file: &Path) {
        if let Err(e) = std::fs::remove_file(file) {
            warn!(
                "Failed to remove orphaned backing file {}: {}",
                file.display(),
                e
            );
        }
    }
}
