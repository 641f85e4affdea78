//! LVM Adapter
//!
//! Thin, testable wrapper over the LVM command suite. All queries use the
//! `--nameprefixes` report format; all mutations are sequenced by the caller
//! (the engine reads after every write before deciding the next step).
//!
//! Safety invariant: `shrink_volume_group` and `remove_volume_group` refuse
//! to touch a physical volume or group that still hosts a logical volume.

use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

/// Prefix LVM puts on every report key when `--nameprefixes` is set
const REPORT_KEY_PREFIX: &str = "lvm2_";

const REPORT_ARGS: &[&str] = &[
    "--noheadings",
    "--nameprefixes",
    "--units",
    "b",
    "--nosuffix",
];

// =============================================================================
// LVM Entities
// =============================================================================

/// A live volume group, queried on demand and never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    pub name: String,
    pub size: u64,
    pub lv_count: u64,
}

/// A live physical volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalVolume {
    pub name: String,
    pub vg_name: String,
    pub size: u64,
}

// =============================================================================
// Adapter
// =============================================================================

/// Executes LVM queries and mutations on the node
pub struct LvmAdapter {
    executor: Arc<dyn CommandExecutor>,
}

impl LvmAdapter {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn report(&self, program: &str, fields: &str) -> Result<Vec<BTreeMap<String, String>>> {
        let mut args = REPORT_ARGS.to_vec();
        args.extend_from_slice(&["-o", fields]);
        let output = self.executor.run(program, &args)?;
        Ok(parse_report(&output))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// List all volume groups on the node
    pub fn list_volume_groups(&self) -> Result<Vec<VolumeGroup>> {
        let rows = self.report("vgs", "vg_name,vg_size,lv_count")?;
        let mut groups = Vec::new();
        for row in rows {
            let name = match row.get("vg_name") {
                Some(n) if !n.is_empty() => n.clone(),
                _ => continue,
            };
            groups.push(VolumeGroup {
                name,
                size: parse_u64(&row, "vg_size")?,
                lv_count: parse_u64(&row, "lv_count")?,
            });
        }
        Ok(groups)
    }

    /// List the physical volumes belonging to one volume group
    pub fn list_physical_volumes(&self, vg: &str) -> Result<Vec<PhysicalVolume>> {
        let rows = self.report("pvs", "pv_name,vg_name,pv_size")?;
        let mut pvs = Vec::new();
        for row in rows {
            if row.get("vg_name").map(String::as_str) != Some(vg) {
                continue;
            }
            let name = match row.get("pv_name") {
                Some(n) if !n.is_empty() => n.clone(),
                _ => continue,
            };
            pvs.push(PhysicalVolume {
                name,
                vg_name: vg.to_string(),
                size: parse_u64(&row, "pv_size")?,
            });
        }
        Ok(pvs)
    }

    /// Whether the volume group still hosts any logical volume
    pub fn volume_group_has_logical_volumes(&self, vg: &str) -> Result<bool> {
        let groups = self.list_volume_groups()?;
        Ok(groups.iter().any(|g| g.name == vg && g.lv_count > 0))
    }

    /// Whether any logical volume has extents on this physical volume.
    ///
    /// The `devices` report field lists segment locations like
    /// `/dev/sdb(0)`, so a plain prefix match against the PV path suffices.
    pub fn physical_volume_has_logical_volume(&self, pv: &str) -> Result<bool> {
        let rows = self.report("lvs", "lv_name,devices")?;
        let needle = format!("{}(", pv);
        Ok(rows
            .iter()
            .filter_map(|row| row.get("devices"))
            .any(|devices| devices.split(',').any(|d| d.trim().starts_with(&needle))))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Initialize a device as an LVM physical volume
    pub fn create_physical_volume(&self, device: &str) -> Result<()> {
        info!("Creating physical volume on {}", device);
        self.executor.run("pvcreate", &[device])?;
        Ok(())
    }

    /// Create a volume group from already-initialized physical volumes
    pub fn create_volume_group(&self, vg: &str, devices: &[String]) -> Result<()> {
        info!("Creating volume group {} from {:?}", vg, devices);
        let mut args = vec![vg];
        args.extend(devices.iter().map(String::as_str));
        self.executor.run("vgcreate", &args)?;
        Ok(())
    }

    /// Add physical volumes to an existing group
    pub fn expand_volume_group(&self, vg: &str, new_pvs: &[String]) -> Result<()> {
        info!("Expanding volume group {} with {:?}", vg, new_pvs);
        let mut args = vec![vg];
        args.extend(new_pvs.iter().map(String::as_str));
        self.executor.run("vgextend", &args)?;
        Ok(())
    }

    /// Remove physical volumes from a group and release them.
    ///
    /// Refuses if any targeted PV still backs a logical volume; in that case
    /// nothing is changed.
    pub fn shrink_volume_group(&self, vg: &str, removed_pvs: &[String]) -> Result<()> {
        for pv in removed_pvs {
            if self.physical_volume_has_logical_volume(pv)? {
                return Err(Error::PhysicalVolumeBusy { pv: pv.clone() });
            }
        }

        info!("Shrinking volume group {} by {:?}", vg, removed_pvs);
        let mut args = vec![vg];
        args.extend(removed_pvs.iter().map(String::as_str));
        self.executor.run("vgreduce", &args)?;

        for pv in removed_pvs {
            debug!("Releasing physical volume {}", pv);
            self.executor.run("pvremove", &[pv.as_str()])?;
        }
        Ok(())
    }

    /// Remove a whole volume group and release its physical volumes.
    ///
    /// Refuses if the group still hosts logical volumes.
    pub fn remove_volume_group(&self, vg: &str) -> Result<()> {
        if self.volume_group_has_logical_volumes(vg)? {
            return Err(Error::VolumeGroupBusy { vg: vg.to_string() });
        }

        let members = self.list_physical_volumes(vg)?;

        info!("Removing volume group {}", vg);
        self.executor.run("vgremove", &[vg])?;

        for pv in &members {
            debug!("Releasing physical volume {}", pv.name);
            self.executor.run("pvremove", &[pv.name.as_str()])?;
        }
        Ok(())
    }
}

// =============================================================================
// Report Parsing
// =============================================================================

/// Parse `--nameprefixes` report output into one map per row.
///
/// Each line holds whitespace-separated `LVM2_KEY='value'` tokens; keys are
/// lower-cased with the prefix stripped, values are unquoted.
pub fn parse_report(output: &str) -> Vec<BTreeMap<String, String>> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut row = BTreeMap::new();
        for token in line.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let key = key.to_lowercase();
            let key = key.strip_prefix(REPORT_KEY_PREFIX).unwrap_or(&key);
            let value = value.trim_matches('\'');
            row.insert(key.to_string(), value.to_string());
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }
    rows
}

fn parse_u64(row: &BTreeMap<String, String>, key: &str) -> Result<u64> {
    let raw = row.get(key).map(String::as_str).unwrap_or("0");
    raw.parse::<u64>()
        .map_err(|_| Error::LvmReportParse(format!("bad {} value: {}", key, raw)))
}
