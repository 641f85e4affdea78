//! Volume-Group Reconciliation Engine
//!
//! One pass takes the desired device classes, the previously persisted
//! status, and the live inventory, then executes the minimal set of
//! create/expand/shrink/delete/retry actions. Failures are isolated per
//! volume group: one class's trouble never aborts the others.
//!
//! Per-class state machine:
//! `Absent → Creating → {Ready, Failed}`;
//! `Ready → {Ready, Expanding→Ready|Failed, Shrinking→Ready|Deleted}`;
//! `Failed → (retried next pass) → {Ready, Failed}`.
//!
//! A pass with unchanged inputs is a no-op on the live system: only queries
//! run, and the emitted documents are identical.

use crate::config::AgentConfig;
use crate::crd::{DeviceClassSpec, DiskRef};
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use crate::inventory::{DeviceScanner, Disk};
use crate::loopdev::LoopDeviceManager;
use crate::lvm::LvmAdapter;
use crate::state::{
    ClassSets, ClassState, ClassStatus, DeviceState, FailureReason, LoopState, LoopStatus,
    LvmdConfig, NodeStorageState, Outcome,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Outcome
// =============================================================================

/// Result of one reconciliation pass: the two documents to persist
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub state: NodeStorageState,
    pub lvmd: LvmdConfig,
}

// =============================================================================
// Device Resolution
// =============================================================================

/// A declared device after loop resolution
enum ResolvedDevice {
    /// Usable device path on the node
    Path(String),
    /// Could not be resolved this pass (loop provisioning failed)
    Unresolved {
        message: String,
        /// Device path from the recorded binding, if one exists. A PV behind
        /// a failed re-attach is still declared; shrink must not treat it as
        /// removable.
        prior_device: Option<String>,
    },
}

// =============================================================================
// Engine
// =============================================================================

/// Executes one reconciliation pass for the local node
pub struct ReconcileEngine {
    node_name: String,
    lvmd_socket: String,
    scanner: DeviceScanner,
    lvm: LvmAdapter,
    loops: LoopDeviceManager,
}

impl ReconcileEngine {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &AgentConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            lvmd_socket: config.lvmd_socket.clone(),
            scanner: DeviceScanner::new(executor.clone()),
            lvm: LvmAdapter::new(executor.clone()),
            loops: LoopDeviceManager::new(executor, config),
        }
    }

    /// Run one pass and emit the documents to persist.
    ///
    /// Only inventory failures abort; everything else lands in the status
    /// document.
    pub fn reconcile(
        &self,
        desired: &[DeviceClassSpec],
        prior: &NodeStorageState,
    ) -> Result<ReconcileOutcome> {
        info!(
            "Reconciling {} device classes on {}",
            desired.len(),
            self.node_name
        );

        // Loop devices first, then scan, so freshly created devices are
        // visible to the availability checks.
        let (loop_states, loop_devices, loop_errors) = self.resolve_loops(desired, prior);
        let inventory = self.scanner.scan()?;

        let mut sets = ClassSets::from_state(prior);

        for class in desired {
            let devices = self.resolve_class_devices(class, prior, &loop_devices, &loop_errors);
            match sets.outcome_of(&class.vg_name) {
                Some(Outcome::Success) => {
                    self.sync_existing_class(class, &devices, &inventory, &mut sets)
                }
                // Failed classes retry full creation, new classes attempt it
                Some(Outcome::Failure) | None => {
                    self.create_class(class, &devices, &inventory, &mut sets)
                }
            }
        }

        self.remove_stale_classes(desired, &mut sets);

        let mut state = NodeStorageState::new(&self.node_name);
        state.loops = loop_states;
        sets.apply_to(&mut state);
        state.compute_phase();
        state.last_reconcile_time = Some(chrono::Utc::now());

        let lvmd = LvmdConfig::derive(&self.lvmd_socket, sets.successes(), desired);

        Ok(ReconcileOutcome { state, lvmd })
    }

    // =========================================================================
    // Loop Resolution
    // =========================================================================

    /// Resolve or create every auto loop device referenced by the spec.
    ///
    /// Returns the updated persisted loop list, logical-name → device-path
    /// bindings for successful loops, and per-name messages for failed ones.
    /// A binding recorded successful is never re-provisioned; it is only
    /// re-attached (loop numbers change across reboots).
    fn resolve_loops(
        &self,
        desired: &[DeviceClassSpec],
        prior: &NodeStorageState,
    ) -> (Vec<LoopState>, BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut states: Vec<LoopState> = prior.loops.clone();
        let mut devices = BTreeMap::new();
        let mut errors = BTreeMap::new();

        for spec in desired {
            for disk in spec.devices.iter().filter(|d| d.auto) {
                if devices.contains_key(&disk.name) || errors.contains_key(&disk.name) {
                    continue;
                }

                let existing = prior.loop_by_name(&disk.name).cloned();
                let resolved = match existing {
                    Some(ref rec) if rec.status == LoopStatus::Succeeded => {
                        let file = std::path::PathBuf::from(&rec.file);
                        self.loops
                            .reattach(&file, &rec.device_name)
                            .map(|device| (rec.file.clone(), device))
                    }
                    _ => {
                        let file = disk
                            .path
                            .as_ref()
                            .map(std::path::PathBuf::from)
                            .unwrap_or_else(|| self.loops.backing_file_for(&disk.name));
                        self.loops
                            .create_loop(&file, disk.size_gib())
                            .map(|device| (file.display().to_string(), device))
                    }
                };

                let new_state = match resolved {
                    Ok((file, device)) => {
                        devices.insert(disk.name.clone(), device.clone());
                        LoopState {
                            name: disk.name.clone(),
                            file,
                            device_name: device,
                            status: LoopStatus::Succeeded,
                            message: String::new(),
                        }
                    }
                    Err(e) => {
                        warn!("Loop device {} unavailable: {}", disk.name, e);
                        errors.insert(disk.name.clone(), e.to_string());
                        // Keep the recorded file and device so the next pass
                        // (and this pass's shrink decision) still sees the
                        // binding.
                        LoopState {
                            name: disk.name.clone(),
                            file: existing
                                .as_ref()
                                .map(|r| r.file.clone())
                                .unwrap_or_default(),
                            device_name: existing
                                .as_ref()
                                .map(|r| r.device_name.clone())
                                .unwrap_or_default(),
                            status: LoopStatus::Failed,
                            message: e.to_string(),
                        }
                    }
                };

                match states.iter_mut().find(|s| s.name == disk.name) {
                    Some(slot) => *slot = new_state,
                    None => states.push(new_state),
                }
            }
        }

        (states, devices, errors)
    }

    /// Map each declared device to a node device path (or a failure message)
    fn resolve_class_devices(
        &self,
        class: &DeviceClassSpec,
        prior: &NodeStorageState,
        loop_devices: &BTreeMap<String, String>,
        loop_errors: &BTreeMap<String, String>,
    ) -> Vec<(DiskRef, ResolvedDevice)> {
        class
            .devices
            .iter()
            .map(|disk| {
                let resolved = if disk.auto {
                    match loop_devices.get(&disk.name) {
                        Some(device) => ResolvedDevice::Path(device.clone()),
                        None => ResolvedDevice::Unresolved {
                            message: loop_errors
                                .get(&disk.name)
                                .cloned()
                                .unwrap_or_else(|| "loop device not provisioned".into()),
                            prior_device: prior
                                .loop_by_name(&disk.name)
                                .filter(|rec| !rec.device_name.is_empty())
                                .map(|rec| rec.device_name.clone()),
                        },
                    }
                } else {
                    ResolvedDevice::Path(disk.name.clone())
                };
                (disk.clone(), resolved)
            })
            .collect()
    }

    // =========================================================================
    // Full Creation (new classes and failed-class retries)
    // =========================================================================

    /// Attempt full creation of a class's volume group.
    ///
    /// Atomic: if even one declared device is unavailable, no physical volume
    /// or volume group is created and the class lands in the failure set with
    /// per-device messages.
    fn create_class(
        &self,
        class: &DeviceClassSpec,
        devices: &[(DiskRef, ResolvedDevice)],
        inventory: &BTreeMap<String, Disk>,
        sets: &mut ClassSets,
    ) {
        let mut device_states = Vec::new();
        let mut paths = Vec::new();
        let mut unavailable = false;

        for (disk, resolved) in devices {
            match resolved {
                ResolvedDevice::Path(path) => match availability(inventory, path) {
                    Ok(()) => {
                        device_states.push(DeviceState::online(path.clone()));
                        paths.push(path.clone());
                    }
                    Err(e) => {
                        device_states.push(DeviceState::offline(path.clone(), e.to_string()));
                        unavailable = true;
                    }
                },
                ResolvedDevice::Unresolved { message, .. } => {
                    device_states.push(DeviceState::offline(disk.name.clone(), message.clone()));
                    unavailable = true;
                }
            }
        }

        if unavailable || paths.is_empty() {
            let message = if paths.is_empty() && !unavailable {
                "no devices declared for class".to_string()
            } else {
                "one or more declared devices are not raw or not present".to_string()
            };
            debug!("Class {} not created: {}", class.class_name, message);
            sets.put(
                Outcome::Failure,
                ClassState::failed(
                    &class.class_name,
                    &class.vg_name,
                    FailureReason::DeviceUnavailable,
                    message,
                    device_states,
                ),
            );
            return;
        }

        for path in &paths {
            if let Err(e) = self.lvm.create_physical_volume(path) {
                sets.put(
                    Outcome::Failure,
                    ClassState::failed(
                        &class.class_name,
                        &class.vg_name,
                        FailureReason::CreateFailed,
                        e.to_string(),
                        device_states,
                    ),
                );
                return;
            }
        }

        match self.lvm.create_volume_group(&class.vg_name, &paths) {
            Ok(()) => {
                info!("Volume group {} ready", class.vg_name);
                sets.put(
                    Outcome::Success,
                    ClassState::ready(&class.class_name, &class.vg_name, device_states),
                );
            }
            Err(e) => {
                sets.put(
                    Outcome::Failure,
                    ClassState::failed(
                        &class.class_name,
                        &class.vg_name,
                        FailureReason::CreateFailed,
                        e.to_string(),
                        device_states,
                    ),
                );
            }
        }
    }

    // =========================================================================
    // Expand / Shrink (classes already in the success set)
    // =========================================================================

    /// Converge an already-Ready class: add newly declared devices, shrink
    /// out no-longer-declared physical volumes. Expansion failure flags the
    /// class but never demotes it out of the success set.
    fn sync_existing_class(
        &self,
        class: &DeviceClassSpec,
        devices: &[(DiskRef, ResolvedDevice)],
        inventory: &BTreeMap<String, Disk>,
        sets: &mut ClassSets,
    ) {
        let current = match self.lvm.list_physical_volumes(&class.vg_name) {
            Ok(pvs) => pvs,
            Err(e) => {
                if let Some(state) = sets.get_mut(&class.vg_name) {
                    state.flag(FailureReason::ExpandError, e.to_string());
                }
                return;
            }
        };
        let member = |path: &str| current.iter().any(|pv| pv.name == path);

        let mut device_states = Vec::new();
        let mut declared = Vec::new();
        let mut to_add = Vec::new();
        let mut flag: Option<(FailureReason, String)> = None;

        for (disk, resolved) in devices {
            match resolved {
                ResolvedDevice::Path(path) => {
                    declared.push(path.clone());
                    if member(path) {
                        device_states.push(DeviceState::online(path.clone()));
                    } else {
                        match availability(inventory, path) {
                            Ok(()) => {
                                device_states.push(DeviceState::online(path.clone()));
                                to_add.push(path.clone());
                            }
                            Err(e) => {
                                let reason = e.to_string();
                                device_states
                                    .push(DeviceState::offline(path.clone(), reason.clone()));
                                flag = Some((FailureReason::ExpandError, reason));
                            }
                        }
                    }
                }
                ResolvedDevice::Unresolved {
                    message,
                    prior_device,
                } => {
                    device_states.push(DeviceState::offline(disk.name.clone(), message.clone()));
                    flag = Some((FailureReason::ExpandError, message.clone()));
                    // The recorded binding still owns its PV; keep it out of
                    // the shrink set until resolution succeeds again.
                    if let Some(device) = prior_device {
                        declared.push(device.clone());
                    }
                }
            }
        }

        // Expansion: initialize new PVs, then extend the group once.
        let mut added = Vec::new();
        for path in &to_add {
            match self.lvm.create_physical_volume(path) {
                Ok(()) => added.push(path.clone()),
                Err(e) => {
                    flag = Some((FailureReason::ExpandError, e.to_string()));
                    mark_offline(&mut device_states, path, &e.to_string());
                }
            }
        }
        if !added.is_empty() {
            if let Err(e) = self.lvm.expand_volume_group(&class.vg_name, &added) {
                // PVs exist but never joined the group
                flag = Some((FailureReason::ExpandWarning, e.to_string()));
                for path in &added {
                    mark_offline(&mut device_states, path, &e.to_string());
                }
            }
        }

        // Shrink: re-read membership after expansion so the decision sees
        // this pass's writes.
        let current = match self.lvm.list_physical_volumes(&class.vg_name) {
            Ok(pvs) => pvs,
            Err(e) => {
                if let Some(state) = sets.get_mut(&class.vg_name) {
                    state.device_states = device_states;
                    state.flag(FailureReason::ShrinkError, e.to_string());
                }
                return;
            }
        };
        let to_remove: Vec<String> = current
            .iter()
            .filter(|pv| !declared.contains(&pv.name))
            .map(|pv| pv.name.clone())
            .collect();

        if !to_remove.is_empty() && to_remove.len() == current.len() {
            // Nothing declared would remain: delete the whole group rather
            // than reducing it to zero physical volumes.
            match self.lvm.remove_volume_group(&class.vg_name) {
                Ok(()) => {
                    info!(
                        "Volume group {} removed (no declared devices remained)",
                        class.vg_name
                    );
                    sets.put(
                        Outcome::Failure,
                        ClassState::failed(
                            &class.class_name,
                            &class.vg_name,
                            FailureReason::DeviceUnavailable,
                            "no declared device is part of the volume group; group removed",
                            device_states,
                        ),
                    );
                    return;
                }
                Err(e) => flag = Some((FailureReason::ShrinkError, e.to_string())),
            }
        } else if !to_remove.is_empty() {
            if let Err(e) = self.lvm.shrink_volume_group(&class.vg_name, &to_remove) {
                flag = Some((FailureReason::ShrinkError, e.to_string()));
            }
        }

        if let Some(state) = sets.get_mut(&class.vg_name) {
            state.name = class.class_name.clone();
            state.state = ClassStatus::Ready;
            state.device_states = device_states;
            match flag {
                Some((reason, message)) => state.flag(reason, message),
                None => state.clear_flag(),
            }
        }
    }

    // =========================================================================
    // Stale Classes
    // =========================================================================

    /// Drop classes whose vg name is no longer desired. A successful class's
    /// group is deleted only when it hosts no logical volumes; otherwise it
    /// stays, flagged, until the volumes are gone. Failed classes have
    /// nothing to undo.
    fn remove_stale_classes(&self, desired: &[DeviceClassSpec], sets: &mut ClassSets) {
        let stale: Vec<String> = sets
            .vg_names()
            .into_iter()
            .filter(|vg| !desired.iter().any(|c| &c.vg_name == vg))
            .collect();

        for vg in stale {
            match sets.outcome_of(&vg) {
                Some(Outcome::Failure) => {
                    debug!("Dropping undeclared failed class for {}", vg);
                    sets.remove(&vg);
                }
                Some(Outcome::Success) => match self.lvm.remove_volume_group(&vg) {
                    Ok(()) => {
                        info!("Removed undeclared volume group {}", vg);
                        sets.remove(&vg);
                    }
                    Err(e) => {
                        warn!("Cannot remove volume group {}: {}", vg, e);
                        if let Some(state) = sets.get_mut(&vg) {
                            state.flag(FailureReason::DeleteError, e.to_string());
                        }
                    }
                },
                None => {}
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Whether a device path is present and available in the inventory
fn availability(inventory: &BTreeMap<String, Disk>, path: &str) -> Result<()> {
    match inventory.get(path) {
        None => Err(Error::DeviceNotFound {
            device: path.to_string(),
        }),
        Some(disk) => match disk.unavailable_reason() {
            None => Ok(()),
            Some(reason) => Err(Error::DeviceNotUsable {
                device: path.to_string(),
                reason,
            }),
        },
    }
}

fn mark_offline(states: &mut [DeviceState], path: &str, message: &str) {
    if let Some(state) = states.iter_mut().find(|s| s.name == path) {
        *state = DeviceState::offline(path, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;
    use crate::state::DeviceStatus;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    // -------------------------------------------------------------------------
    // Fixture
    // -------------------------------------------------------------------------

    struct Fixture {
        exec: Arc<FakeExecutor>,
        engine: ReconcileEngine,
        _loop_dir: TempDir,
    }

    fn fixture() -> Fixture {
        let loop_dir = TempDir::new().unwrap();
        let exec = Arc::new(FakeExecutor::new());
        let config = AgentConfig {
            node_name: "node-1".into(),
            loop_dir: loop_dir.path().to_path_buf(),
            ..Default::default()
        };
        let engine = ReconcileEngine::new(exec.clone(), &config);
        Fixture {
            exec,
            engine,
            _loop_dir: loop_dir,
        }
    }

    fn lsblk_args() -> Vec<&'static str> {
        vec!["-P", "-b", "-p", "-o", "NAME,TYPE,SIZE,FSTYPE,MOUNTPOINT,PKNAME"]
    }

    fn report_args(fields: &'static str) -> Vec<&'static str> {
        vec![
            "--noheadings",
            "--nameprefixes",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            fields,
        ]
    }

    fn lsblk_row(name: &str, fstype: &str) -> String {
        format!(
            "NAME=\"{}\" TYPE=\"disk\" SIZE=\"{}\" FSTYPE=\"{}\" MOUNTPOINT=\"\" PKNAME=\"\"",
            name,
            10 * GIB,
            fstype
        )
    }

    fn pvs_row(pv: &str, vg: &str) -> String {
        format!(
            "LVM2_PV_NAME='{}' LVM2_VG_NAME='{}' LVM2_PV_SIZE='{}'",
            pv,
            vg,
            10 * GIB
        )
    }

    fn class(name: &str, vg: &str, devices: &[&str]) -> DeviceClassSpec {
        DeviceClassSpec {
            class_name: name.into(),
            vg_name: vg.into(),
            devices: devices
                .iter()
                .map(|d| DiskRef {
                    name: d.to_string(),
                    ..Default::default()
                })
                .collect(),
            default: true,
            spare_gb: None,
            stripe: None,
            stripe_size: None,
        }
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    #[test]
    fn test_first_run_creates_group() {
        let f = fixture();
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdb", ""));

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let prior = NodeStorageState::new("node-1");

        let outcome = f.engine.reconcile(&desired, &prior).unwrap();

        assert_eq!(outcome.state.success_classes.len(), 1);
        let ready = &outcome.state.success_classes[0];
        assert_eq!(ready.vg_name, "vg1");
        assert_eq!(ready.device_states.len(), 1);
        assert_eq!(ready.device_states[0].name, "/dev/sdb");
        assert_eq!(ready.device_states[0].state, DeviceStatus::Online);
        assert!(outcome.state.fail_classes.is_empty());
        assert_eq!(outcome.state.phase, crate::state::NodePhase::Ready);

        // lvmd.yaml exposes the class
        assert_eq!(outcome.lvmd.device_classes.len(), 1);
        assert_eq!(outcome.lvmd.device_classes[0].name, "hdd1");
        assert_eq!(outcome.lvmd.device_classes[0].volume_group, "vg1");

        let calls = f.exec.call_log();
        assert!(calls.contains(&"pvcreate /dev/sdb".to_string()));
        assert!(calls.contains(&"vgcreate vg1 /dev/sdb".to_string()));
    }

    #[test]
    fn test_atomic_creation_no_partial_group() {
        let f = fixture();
        // sdb is raw but sdc carries a filesystem
        let inventory = format!(
            "{}\n{}",
            lsblk_row("/dev/sdb", ""),
            lsblk_row("/dev/sdc", "ext4")
        );
        f.exec.on_success("lsblk", &lsblk_args(), &inventory);

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb", "/dev/sdc"])];
        let outcome = f
            .engine
            .reconcile(&desired, &NodeStorageState::new("node-1"))
            .unwrap();

        assert!(outcome.state.success_classes.is_empty());
        let failed = &outcome.state.fail_classes[0];
        assert_eq!(failed.state, ClassStatus::UnReady);
        assert_eq!(failed.reason, Some(FailureReason::DeviceUnavailable));
        // per-device messages: sdb online, sdc offline with the reason
        assert_eq!(failed.device_states[0].state, DeviceStatus::Online);
        assert_eq!(failed.device_states[1].state, DeviceStatus::Offline);
        assert!(failed.device_states[1].message.contains("ext4"));

        // no PV or VG was created for the class
        assert!(f.exec.mutation_calls().is_empty());
        assert!(outcome.lvmd.device_classes.is_empty());
    }

    #[test]
    fn test_vgcreate_failure_lands_in_failure_set() {
        let f = fixture();
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdb", ""));
        f.exec
            .on_failure("vgcreate", &["vg1", "/dev/sdb"], "vg1 already exists");

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let outcome = f
            .engine
            .reconcile(&desired, &NodeStorageState::new("node-1"))
            .unwrap();

        let failed = &outcome.state.fail_classes[0];
        assert_eq!(failed.reason, Some(FailureReason::CreateFailed));
        assert!(failed.message.contains("already exists"));
        assert_eq!(outcome.state.phase, crate::state::NodePhase::Degraded);
    }

    #[test]
    fn test_failed_class_retry_moves_to_success() {
        let f = fixture();
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdb", ""));

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let mut prior = NodeStorageState::new("node-1");
        prior.fail_classes.push(ClassState::failed(
            "hdd1",
            "vg1",
            FailureReason::DeviceUnavailable,
            "device carried a filesystem",
            vec![DeviceState::offline("/dev/sdb", "not raw")],
        ));

        let outcome = f.engine.reconcile(&desired, &prior).unwrap();

        assert!(outcome.state.fail_classes.is_empty());
        assert_eq!(outcome.state.success_classes[0].vg_name, "vg1");
    }

    // -------------------------------------------------------------------------
    // Idempotence
    // -------------------------------------------------------------------------

    #[test]
    fn test_second_run_is_noop() {
        let f = fixture();
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdb", ""));

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let first = f
            .engine
            .reconcile(&desired, &NodeStorageState::new("node-1"))
            .unwrap();

        // second pass sees the group that the first pass created
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/sdb", "vg1"),
        );
        let mutations_before = f.exec.mutation_calls().len();

        let second = f.engine.reconcile(&desired, &first.state).unwrap();

        assert_eq!(f.exec.mutation_calls().len(), mutations_before);
        assert_eq!(second.state.success_classes, first.state.success_classes);
        assert_eq!(second.state.fail_classes, first.state.fail_classes);
        assert_eq!(second.lvmd, first.lvmd);
    }

    // -------------------------------------------------------------------------
    // Expand / Shrink
    // -------------------------------------------------------------------------

    fn ready_prior() -> NodeStorageState {
        let mut prior = NodeStorageState::new("node-1");
        prior.success_classes.push(ClassState::ready(
            "hdd1",
            "vg1",
            vec![DeviceState::online("/dev/sdb")],
        ));
        prior
    }

    #[test]
    fn test_expand_adds_new_device() {
        let f = fixture();
        let inventory = format!(
            "{}\n{}",
            lsblk_row("/dev/sdb", "LVM2_member"),
            lsblk_row("/dev/sdc", "")
        );
        f.exec.on_success("lsblk", &lsblk_args(), &inventory);
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/sdb", "vg1"),
        );

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb", "/dev/sdc"])];
        let outcome = f.engine.reconcile(&desired, &ready_prior()).unwrap();

        let ready = &outcome.state.success_classes[0];
        assert_eq!(ready.device_states.len(), 2);
        assert!(ready
            .device_states
            .iter()
            .all(|d| d.state == DeviceStatus::Online));
        assert!(ready.reason.is_none());

        let calls = f.exec.call_log();
        assert!(calls.contains(&"pvcreate /dev/sdc".to_string()));
        assert!(calls.contains(&"vgextend vg1 /dev/sdc".to_string()));
    }

    #[test]
    fn test_expand_failure_keeps_class_ready() {
        let f = fixture();
        let inventory = format!(
            "{}\n{}",
            lsblk_row("/dev/sdb", "LVM2_member"),
            lsblk_row("/dev/sdc", "")
        );
        f.exec.on_success("lsblk", &lsblk_args(), &inventory);
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/sdb", "vg1"),
        );
        f.exec
            .on_failure("pvcreate", &["/dev/sdc"], "device excluded by a filter");

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb", "/dev/sdc"])];
        let outcome = f.engine.reconcile(&desired, &ready_prior()).unwrap();

        // expansion failure does not demote the class
        let ready = &outcome.state.success_classes[0];
        assert_eq!(ready.state, ClassStatus::Ready);
        assert_eq!(ready.reason, Some(FailureReason::ExpandError));
        assert!(ready.message.contains("filter"));
        assert!(outcome.state.fail_classes.is_empty());
        // the group is still published to lvmd
        assert_eq!(outcome.lvmd.device_classes.len(), 1);
    }

    #[test]
    fn test_vgextend_failure_flags_expand_warning() {
        let f = fixture();
        let inventory = format!(
            "{}\n{}",
            lsblk_row("/dev/sdb", "LVM2_member"),
            lsblk_row("/dev/sdc", "")
        );
        f.exec.on_success("lsblk", &lsblk_args(), &inventory);
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/sdb", "vg1"),
        );
        f.exec
            .on_failure("vgextend", &["vg1", "/dev/sdc"], "insufficient free extents");

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb", "/dev/sdc"])];
        let outcome = f.engine.reconcile(&desired, &ready_prior()).unwrap();

        let ready = &outcome.state.success_classes[0];
        assert_eq!(ready.reason, Some(FailureReason::ExpandWarning));
    }

    #[test]
    fn test_shrink_releases_undeclared_pv() {
        let f = fixture();
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdb", "LVM2_member"));
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &format!("{}\n{}", pvs_row("/dev/sdb", "vg1"), pvs_row("/dev/sdc", "vg1")),
        );

        // sdc was dropped from the spec and hosts no LV
        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let outcome = f.engine.reconcile(&desired, &ready_prior()).unwrap();

        let ready = &outcome.state.success_classes[0];
        assert_eq!(ready.device_states.len(), 1);
        assert_eq!(ready.device_states[0].name, "/dev/sdb");
        assert!(ready.reason.is_none());

        let calls = f.exec.call_log();
        assert!(calls.contains(&"vgreduce vg1 /dev/sdc".to_string()));
        assert!(calls.contains(&"pvremove /dev/sdc".to_string()));
    }

    #[test]
    fn test_shrink_refused_when_pv_hosts_lv() {
        let f = fixture();
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdb", "LVM2_member"));
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &format!("{}\n{}", pvs_row("/dev/sdb", "vg1"), pvs_row("/dev/sdc", "vg1")),
        );
        f.exec.on_success(
            "lvs",
            &report_args("lv_name,devices"),
            "LVM2_LV_NAME='lv0' LVM2_DEVICES='/dev/sdc(0)'",
        );

        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let outcome = f.engine.reconcile(&desired, &ready_prior()).unwrap();

        let ready = &outcome.state.success_classes[0];
        assert_eq!(ready.state, ClassStatus::Ready);
        assert_eq!(ready.reason, Some(FailureReason::ShrinkError));

        // membership untouched
        let calls = f.exec.call_log();
        assert!(calls.iter().all(|c| !c.starts_with("vgreduce")));
        assert!(calls.iter().all(|c| !c.starts_with("pvremove")));
    }

    #[test]
    fn test_exhaustive_shrink_deletes_group() {
        let f = fixture();
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdd", "ext4"));
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/sdb", "vg1"),
        );

        // the only declared device (sdd) is unavailable and not a member, so
        // removing the undeclared sdb would empty the group
        let desired = vec![class("hdd1", "vg1", &["/dev/sdd"])];
        let outcome = f.engine.reconcile(&desired, &ready_prior()).unwrap();

        let calls = f.exec.call_log();
        assert!(calls.contains(&"vgremove vg1".to_string()));
        assert!(calls.iter().all(|c| !c.starts_with("vgreduce")));

        // the class is desired but its group is gone: failure set
        assert!(outcome.state.success_classes.is_empty());
        assert_eq!(outcome.state.fail_classes[0].vg_name, "vg1");
    }

    // -------------------------------------------------------------------------
    // Stale Class Removal
    // -------------------------------------------------------------------------

    #[test]
    fn test_undeclared_group_removed_when_lv_free() {
        let f = fixture();
        f.exec.on_success("lsblk", &lsblk_args(), "");
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/sdb", "vg1"),
        );

        let outcome = f.engine.reconcile(&[], &ready_prior()).unwrap();

        assert!(outcome.state.success_classes.is_empty());
        assert!(outcome.state.fail_classes.is_empty());
        assert!(f.exec.call_log().contains(&"vgremove vg1".to_string()));
        assert!(f.exec.call_log().contains(&"pvremove /dev/sdb".to_string()));
    }

    #[test]
    fn test_undeclared_group_with_lvs_stays_flagged() {
        let f = fixture();
        f.exec.on_success("lsblk", &lsblk_args(), "");
        f.exec.on_success(
            "vgs",
            &report_args("vg_name,vg_size,lv_count"),
            "LVM2_VG_NAME='vg1' LVM2_VG_SIZE='10737418240' LVM2_LV_COUNT='2'",
        );

        let outcome = f.engine.reconcile(&[], &ready_prior()).unwrap();

        let kept = &outcome.state.success_classes[0];
        assert_eq!(kept.vg_name, "vg1");
        assert_eq!(kept.reason, Some(FailureReason::DeleteError));
        assert!(kept.message.contains("logical volumes"));
        assert!(f.exec.call_log().iter().all(|c| !c.starts_with("vgremove")));
    }

    #[test]
    fn test_undeclared_failed_class_simply_dropped() {
        let f = fixture();
        f.exec.on_success("lsblk", &lsblk_args(), "");

        let mut prior = NodeStorageState::new("node-1");
        prior.fail_classes.push(ClassState::failed(
            "hdd2",
            "vg2",
            FailureReason::CreateFailed,
            "boom",
            vec![],
        ));

        let outcome = f.engine.reconcile(&[], &prior).unwrap();

        assert!(outcome.state.fail_classes.is_empty());
        assert!(f.exec.mutation_calls().is_empty());
    }

    // -------------------------------------------------------------------------
    // Loop Devices
    // -------------------------------------------------------------------------

    fn loop_class(name: &str, vg: &str, logical: &str) -> DeviceClassSpec {
        DeviceClassSpec {
            class_name: name.into(),
            vg_name: vg.into(),
            devices: vec![DiskRef {
                name: logical.into(),
                disk_type: Some("loop".into()),
                auto: true,
                path: None,
                size: Some(10),
            }],
            default: false,
            spare_gb: None,
            stripe: None,
            stripe_size: None,
        }
    }

    #[test]
    fn test_auto_loop_provisioned_then_stable() {
        let f = fixture();
        let backing = f.engine.loops.backing_file_for("loop-hdd1");
        let path = backing.display().to_string();

        f.exec
            .on_success("losetup", &["-f", "--show", &path], "/dev/loop5");
        f.exec.on_success("lsblk", &lsblk_args(), &{
            format!(
                "NAME=\"/dev/loop5\" TYPE=\"loop\" SIZE=\"{}\" FSTYPE=\"\" MOUNTPOINT=\"\" PKNAME=\"\"",
                10 * GIB
            )
        });

        let desired = vec![loop_class("hdd1", "vg1", "loop-hdd1")];
        let first = f
            .engine
            .reconcile(&desired, &NodeStorageState::new("node-1"))
            .unwrap();

        assert_eq!(first.state.loops.len(), 1);
        let rec = &first.state.loops[0];
        assert_eq!(rec.name, "loop-hdd1");
        assert_eq!(rec.device_name, "/dev/loop5");
        assert_eq!(rec.status, LoopStatus::Succeeded);
        assert_eq!(first.state.success_classes[0].device_states[0].name, "/dev/loop5");

        // Second run: the binding resolves via losetup -j; no new file, no
        // second attachment.
        f.exec.on_success(
            "losetup",
            &["-j", &path],
            &format!("/dev/loop5: [0049]:17 ({})", path),
        );
        let attach_calls_before = f
            .exec
            .call_log()
            .iter()
            .filter(|c| c.starts_with("losetup -f"))
            .count();

        let second = f.engine.reconcile(&desired, &first.state).unwrap();

        let attach_calls_after = f
            .exec
            .call_log()
            .iter()
            .filter(|c| c.starts_with("losetup -f"))
            .count();
        assert_eq!(attach_calls_after, attach_calls_before);
        assert_eq!(second.state.loops, first.state.loops);
    }

    #[test]
    fn test_loop_failure_keeps_class_unready() {
        let f = fixture();
        let backing = f.engine.loops.backing_file_for("loop-hdd1");
        let path = backing.display().to_string();
        f.exec
            .on_failure("losetup", &["-f", "--show", &path], "no free loop devices");
        f.exec.on_success("lsblk", &lsblk_args(), "");

        let desired = vec![loop_class("hdd1", "vg1", "loop-hdd1")];
        let outcome = f
            .engine
            .reconcile(&desired, &NodeStorageState::new("node-1"))
            .unwrap();

        assert_eq!(outcome.state.loops[0].status, LoopStatus::Failed);
        let failed = &outcome.state.fail_classes[0];
        assert_eq!(failed.reason, Some(FailureReason::DeviceUnavailable));
        assert_eq!(failed.device_states[0].name, "loop-hdd1");
        assert_eq!(failed.device_states[0].state, DeviceStatus::Offline);
    }

    #[test]
    fn test_loop_resolution_failure_preserves_group() {
        let f = fixture();
        let backing = f.engine.loops.backing_file_for("loop-hdd1");

        // Backing file never created in this fixture, so re-attach fails.
        // The group's PV is still attached on the node.
        f.exec.on_success("lsblk", &lsblk_args(), "");
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/loop5", "vg1"),
        );

        let mut prior = NodeStorageState::new("node-1");
        prior.success_classes.push(ClassState::ready(
            "hdd1",
            "vg1",
            vec![DeviceState::online("/dev/loop5")],
        ));
        prior.loops.push(LoopState {
            name: "loop-hdd1".into(),
            file: backing.display().to_string(),
            device_name: "/dev/loop5".into(),
            status: LoopStatus::Succeeded,
            message: String::new(),
        });

        let desired = vec![loop_class("hdd1", "vg1", "loop-hdd1")];
        let outcome = f.engine.reconcile(&desired, &prior).unwrap();

        // the still-declared group survives the failed re-attach untouched
        let calls = f.exec.call_log();
        assert!(calls.iter().all(|c| !c.starts_with("vgremove")));
        assert!(calls.iter().all(|c| !c.starts_with("vgreduce")));
        assert!(calls.iter().all(|c| !c.starts_with("pvremove")));

        let kept = &outcome.state.success_classes[0];
        assert_eq!(kept.vg_name, "vg1");
        assert_eq!(kept.state, ClassStatus::Ready);
        assert_eq!(kept.reason, Some(FailureReason::ExpandError));

        // the binding record keeps its device for the next pass
        let rec = &outcome.state.loops[0];
        assert_eq!(rec.status, LoopStatus::Failed);
        assert_eq!(rec.device_name, "/dev/loop5");
        assert_eq!(rec.file, backing.display().to_string());
    }

    #[test]
    fn test_missing_device_reported_not_found() {
        let f = fixture();
        f.exec.on_success("lsblk", &lsblk_args(), "");

        let desired = vec![class("hdd1", "vg1", &["/dev/sdz"])];
        let outcome = f
            .engine
            .reconcile(&desired, &NodeStorageState::new("node-1"))
            .unwrap();

        let failed = &outcome.state.fail_classes[0];
        assert_eq!(failed.reason, Some(FailureReason::DeviceUnavailable));
        assert!(failed.device_states[0].message.contains("not found"));
        assert!(f.exec.mutation_calls().is_empty());
    }

    // -------------------------------------------------------------------------
    // Concrete three-run scenario
    // -------------------------------------------------------------------------

    #[test]
    fn test_grow_then_shrink_scenario() {
        let f = fixture();

        // Run 1: one class, one free 10GiB device.
        f.exec
            .on_success("lsblk", &lsblk_args(), &lsblk_row("/dev/sdb", ""));
        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let run1 = f
            .engine
            .reconcile(&desired, &NodeStorageState::new("node-1"))
            .unwrap();

        assert_eq!(run1.state.success_classes[0].vg_name, "vg1");
        assert_eq!(run1.state.success_classes[0].device_states.len(), 1);
        assert_eq!(run1.lvmd.device_classes.len(), 1);
        assert_eq!(run1.lvmd.device_classes[0].name, "hdd1");

        // Run 2: /dev/sdc added to the spec.
        let inventory = format!(
            "{}\n{}",
            lsblk_row("/dev/sdb", "LVM2_member"),
            lsblk_row("/dev/sdc", "")
        );
        f.exec.on_success("lsblk", &lsblk_args(), &inventory);
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &pvs_row("/dev/sdb", "vg1"),
        );
        let desired = vec![class("hdd1", "vg1", &["/dev/sdb", "/dev/sdc"])];
        let run2 = f.engine.reconcile(&desired, &run1.state).unwrap();

        let ready = &run2.state.success_classes[0];
        assert_eq!(ready.device_states.len(), 2);
        assert!(f.exec.call_log().contains(&"vgextend vg1 /dev/sdc".to_string()));

        // Run 3: /dev/sdc dropped again, carries no LV.
        f.exec.on_success(
            "pvs",
            &report_args("pv_name,vg_name,pv_size"),
            &format!("{}\n{}", pvs_row("/dev/sdb", "vg1"), pvs_row("/dev/sdc", "vg1")),
        );
        let desired = vec![class("hdd1", "vg1", &["/dev/sdb"])];
        let run3 = f.engine.reconcile(&desired, &run2.state).unwrap();

        let ready = &run3.state.success_classes[0];
        assert_eq!(ready.device_states.len(), 1);
        assert_eq!(ready.device_states[0].name, "/dev/sdb");
        assert!(f.exec.call_log().contains(&"vgreduce vg1 /dev/sdc".to_string()));
        assert!(f.exec.call_log().contains(&"pvremove /dev/sdc".to_string()));
    }

    // -------------------------------------------------------------------------
    // Exclusivity
    // -------------------------------------------------------------------------

    #[test]
    fn test_no_vg_in_both_sets() {
        let f = fixture();
        // vg1 creation will fail at vgcreate; vg2 succeeds
        let inventory = format!(
            "{}\n{}",
            lsblk_row("/dev/sdb", ""),
            lsblk_row("/dev/sdc", "")
        );
        f.exec.on_success("lsblk", &lsblk_args(), &inventory);
        f.exec.on_failure("vgcreate", &["vg1", "/dev/sdb"], "boom");

        let desired = vec![
            class("hdd1", "vg1", &["/dev/sdb"]),
            class("hdd2", "vg2", &["/dev/sdc"]),
        ];
        let mut prior = NodeStorageState::new("node-1");
        // vg1 previously succeeded somewhere else's history: exercise the move
        prior.fail_classes.push(ClassState::failed(
            "hdd1",
            "vg1",
            FailureReason::CreateFailed,
            "old",
            vec![],
        ));

        let outcome = f.engine.reconcile(&desired, &prior).unwrap();

        let success: Vec<_> = outcome
            .state
            .success_classes
            .iter()
            .map(|c| c.vg_name.clone())
            .collect();
        let failure: Vec<_> = outcome
            .state
            .fail_classes
            .iter()
            .map(|c| c.vg_name.clone())
            .collect();
        assert_eq!(success, vec!["vg2"]);
        assert_eq!(failure, vec!["vg1"]);
        assert!(success.iter().all(|vg| !failure.contains(vg)));
    }
}
