//! Block Device Scanner
//!
//! Enumerates block devices through the host-namespace executor and builds
//! the per-pass inventory map. Read-only: a scan never mutates the node.

use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use crate::inventory::disk::{Disk, DiskType};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

const LSBLK_COLUMNS: &str = "NAME,TYPE,SIZE,FSTYPE,MOUNTPOINT,PKNAME";

// =============================================================================
// Scanner
// =============================================================================

/// Scans block devices on the local node
pub struct DeviceScanner {
    executor: Arc<dyn CommandExecutor>,
}

impl DeviceScanner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Enumerate all block devices, keyed by device path.
    ///
    /// A discovery-tool failure aborts the whole scan; malformed rows are
    /// skipped with a warning rather than failing the pass.
    pub fn scan(&self) -> Result<BTreeMap<String, Disk>> {
        let output = self
            .executor
            .run("lsblk", &["-P", "-b", "-p", "-o", LSBLK_COLUMNS])
            .map_err(|e| Error::DeviceDiscovery(e.to_string()))?;

        let mut disks = BTreeMap::new();

        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields = parse_pairs_line(line);

            let name = match fields.get("NAME") {
                Some(n) if !n.is_empty() => n.clone(),
                _ => {
                    warn!("Skipping lsblk row without NAME: {}", line);
                    continue;
                }
            };
            let size = fields
                .get("SIZE")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);

            disks.insert(
                name.clone(),
                Disk {
                    name,
                    disk_type: DiskType::parse(fields.get("TYPE").map(String::as_str).unwrap_or("")),
                    size,
                    filesystem: fields.get("FSTYPE").cloned().unwrap_or_default(),
                    mount_point: fields.get("MOUNTPOINT").cloned().unwrap_or_default(),
                    parent: fields.get("PKNAME").cloned().unwrap_or_default(),
                    has_children: false,
                },
            );
        }

        mark_children(&mut disks);
        debug!("Scanned {} block devices", disks.len());

        Ok(disks)
    }
}

/// Mark every device that appears as another device's parent
fn mark_children(disks: &mut BTreeMap<String, Disk>) {
    let parents: Vec<String> = disks
        .values()
        .filter(|d| !d.parent.is_empty())
        .map(|d| d.parent.clone())
        .collect();

    for parent in parents {
        if let Some(disk) = disks.get_mut(&parent) {
            disk.has_children = true;
        }
    }
}

/// Parse one `KEY="value" KEY="value"` pairs line from lsblk -P.
///
/// Values may contain spaces (mount points), so this walks the line instead
/// of splitting on whitespace.
fn parse_pairs_line(line: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let key = &line[key_start..i];
        i += 1; // '='
        if i >= bytes.len() || bytes[i] != b'"' {
            break;
        }
        i += 1; // opening quote
        let value_start = i;
        while i < bytes.len() && bytes[i] != b'"' {
            i += 1;
        }
        let value = &line[value_start..i.min(bytes.len())];
        i += 1; // closing quote

        fields.insert(key.to_string(), value.to_string());
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn scanner_with(output: &str) -> DeviceScanner {
        let exec = FakeExecutor::new();
        exec.on_success("lsblk", &["-P", "-b", "-p", "-o", LSBLK_COLUMNS], output);
        DeviceScanner::new(Arc::new(exec))
    }

    #[test]
    fn test_parse_pairs_line() {
        let fields = parse_pairs_line(
            r#"NAME="/dev/sda1" TYPE="part" SIZE="1073741824" FSTYPE="ext4" MOUNTPOINT="/mnt/my data" PKNAME="/dev/sda""#,
        );
        assert_eq!(fields["NAME"], "/dev/sda1");
        assert_eq!(fields["TYPE"], "part");
        assert_eq!(fields["MOUNTPOINT"], "/mnt/my data");
        assert_eq!(fields["PKNAME"], "/dev/sda");
    }

    #[test]
    fn test_scan_builds_inventory() {
        let output = format!(
            "NAME=\"/dev/sda\" TYPE=\"disk\" SIZE=\"{}\" FSTYPE=\"\" MOUNTPOINT=\"\" PKNAME=\"\"\n\
             NAME=\"/dev/sda1\" TYPE=\"part\" SIZE=\"{}\" FSTYPE=\"ext4\" MOUNTPOINT=\"/\" PKNAME=\"/dev/sda\"\n\
             NAME=\"/dev/sdb\" TYPE=\"disk\" SIZE=\"{}\" FSTYPE=\"\" MOUNTPOINT=\"\" PKNAME=\"\"",
            100 * GIB,
            99 * GIB,
            10 * GIB
        );
        let disks = scanner_with(&output).scan().unwrap();

        assert_eq!(disks.len(), 3);
        // sda carries a partition, so only sdb is available
        assert!(disks["/dev/sda"].has_children);
        assert!(!disks["/dev/sda"].is_available());
        assert!(!disks["/dev/sda1"].is_available());
        assert!(disks["/dev/sdb"].is_available());
    }

    #[test]
    fn test_scan_tool_failure_is_fatal() {
        let exec = FakeExecutor::new();
        exec.on_failure(
            "lsblk",
            &["-P", "-b", "-p", "-o", LSBLK_COLUMNS],
            "lsblk: not found",
        );
        let err = DeviceScanner::new(Arc::new(exec)).scan().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_scan_skips_malformed_rows() {
        let output = format!(
            "TYPE=\"disk\" SIZE=\"123\"\n\
             NAME=\"/dev/sdb\" TYPE=\"disk\" SIZE=\"{}\" FSTYPE=\"\" MOUNTPOINT=\"\" PKNAME=\"\"",
            10 * GIB
        );
        let disks = scanner_with(&output).scan().unwrap();
        assert_eq!(disks.len(), 1);
        assert!(disks.contains_key("/dev/sdb"));
    }
}
