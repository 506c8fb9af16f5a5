//! Block Device Enumeration
//!
//! Lists block devices with `lsblk --pairs` and parses each row into a
//! [`BlockDevice`]. Rows that fail to parse are returned separately so a
//! single odd device never aborts enumeration.

use crate::crd::{DeviceMechanicalProperty, DeviceType};
use crate::domain::ports::BlockLister;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Columns requested from lsblk, in order
pub const LSBLK_COLUMNS: &str =
    "NAME,ROTA,TYPE,SIZE,MODEL,VENDOR,RO,RM,STATE,FSTYPE,SERIAL,KNAME,PKNAME,PARTLABEL,MOUNTPOINT";

/// Part label that marks a BIOS boot partition
pub const BIOS_BOOT_PART_LABEL: &str = "BIOS-BOOT";

/// Device state that excludes a device from use
pub const STATE_SUSPENDED: &str = "suspended";

// =============================================================================
// Block Device
// =============================================================================

/// A block device as reported by lsblk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub kname: String,
    /// Kernel name of the parent device, empty for top-level devices
    pub pkname: String,
    /// lsblk TYPE column (disk, part, loop, mpath, rom, lvm, ...)
    pub device_type: String,
    /// Size in bytes
    pub size: u64,
    pub model: String,
    pub vendor: String,
    pub serial: String,
    pub rotational: bool,
    pub read_only: bool,
    pub removable: bool,
    pub state: String,
    pub fstype: String,
    pub partlabel: String,
    pub mountpoint: String,
    /// Whether another row names this device as its parent
    pub has_children: bool,
}

impl BlockDevice {
    /// Device node path
    pub fn dev_path(&self) -> PathBuf {
        PathBuf::from("/dev").join(&self.kname)
    }

    /// Parsed device type, `None` for types the operator never claims
    pub fn kind(&self) -> Option<DeviceType> {
        DeviceType::from_lsblk(&self.device_type)
    }

    pub fn mechanical_property(&self) -> DeviceMechanicalProperty {
        if self.rotational {
            DeviceMechanicalProperty::Rotational
        } else {
            DeviceMechanicalProperty::NonRotational
        }
    }

    pub fn is_bios_boot(&self) -> bool {
        self.partlabel.to_lowercase().contains(&BIOS_BOOT_PART_LABEL.to_lowercase())
    }

    pub fn is_suspended(&self) -> bool {
        self.state.eq_ignore_ascii_case(STATE_SUSPENDED)
    }
}

/// A row lsblk printed that could not be turned into a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadRow {
    pub line: String,
    pub reason: String,
}

/// Result of one enumeration
#[derive(Debug, Clone, Default)]
pub struct BlockListing {
    pub devices: Vec<BlockDevice>,
    pub bad_rows: Vec<BadRow>,
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse `KEY="value"` pairs from a single lsblk row
fn parse_pairs(line: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut pairs = BTreeMap::new();
    let mut rest = line.trim();

    while !rest.is_empty() {
        let eq = rest
            .find("=\"")
            .ok_or_else(|| format!("expected KEY=\"value\" at `{}`", rest))?;
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 2..];
        let close = after
            .find('"')
            .ok_or_else(|| format!("unterminated value for {}", key))?;
        pairs.insert(key, after[..close].to_string());
        rest = after[close + 1..].trim_start();
    }

    Ok(pairs)
}

fn parse_row(line: &str) -> std::result::Result<BlockDevice, String> {
    let pairs = parse_pairs(line)?;
    let get = |key: &str| pairs.get(key).cloned().unwrap_or_default();
    let flag = |key: &str| pairs.get(key).map(|v| v.trim() == "1").unwrap_or(false);

    let kname = get("KNAME");
    if kname.is_empty() {
        return Err("missing KNAME".into());
    }
    let device_type = get("TYPE");
    if device_type.is_empty() {
        return Err(format!("missing TYPE for {}", kname));
    }
    let size_raw = get("SIZE");
    let size = size_raw
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid SIZE `{}` for {}", size_raw, kname))?;

    Ok(BlockDevice {
        name: get("NAME"),
        kname,
        pkname: get("PKNAME"),
        device_type,
        size,
        model: get("MODEL").trim().to_string(),
        vendor: get("VENDOR").trim().to_string(),
        serial: get("SERIAL").trim().to_string(),
        rotational: flag("ROTA"),
        read_only: flag("RO"),
        removable: flag("RM"),
        state: get("STATE"),
        fstype: get("FSTYPE"),
        partlabel: get("PARTLABEL"),
        mountpoint: get("MOUNTPOINT"),
        has_children: false,
    })
}

/// Parse the full output of `lsblk --pairs`
pub fn parse_lsblk_output(output: &str) -> BlockListing {
    let mut listing = BlockListing::default();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match parse_row(line) {
            Ok(device) => listing.devices.push(device),
            Err(reason) => listing.bad_rows.push(BadRow {
                line: line.to_string(),
                reason,
            }),
        }
    }

    let parents: HashSet<String> = listing
        .devices
        .iter()
        .filter(|d| !d.pkname.is_empty())
        .map(|d| d.pkname.clone())
        .collect();
    for device in listing.devices.iter_mut() {
        device.has_children = parents.contains(&device.kname);
    }

    listing
}

// =============================================================================
// lsblk Lister
// =============================================================================

/// Lists devices by shelling out to lsblk
#[derive(Debug, Clone)]
pub struct LsblkLister {
    binary: PathBuf,
}

impl Default for LsblkLister {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("lsblk"),
        }
    }
}

impl LsblkLister {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl BlockLister for LsblkLister {
    async fn list(&self) -> Result<BlockListing> {
        let output = Command::new(&self.binary)
            .args(["--bytes", "--noheadings", "--pairs", "--output", LSBLK_COLUMNS])
            .output()
            .await
            .map_err(|e| Error::BlockList(format!("failed to run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            return Err(Error::BlockList(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let listing = parse_lsblk_output(&String::from_utf8_lossy(&output.stdout));
        for bad in &listing.bad_rows {
            warn!("Skipping unparseable lsblk row ({}): {}", bad.reason, bad.line);
        }
        debug!("lsblk reported {} devices", listing.devices.len());

        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"NAME="sda" ROTA="1" TYPE="disk" SIZE="21474836480" MODEL="VBOX HARDDISK   " VENDOR="ATA     " RO="0" RM="0" STATE="running" FSTYPE="" SERIAL="VB1234" KNAME="sda" PKNAME="" PARTLABEL="" MOUNTPOINT=""
NAME="sda1" ROTA="1" TYPE="part" SIZE="1048576" MODEL="" VENDOR="" RO="0" RM="0" STATE="" FSTYPE="" SERIAL="" KNAME="sda1" PKNAME="sda" PARTLABEL="BIOS-BOOT" MOUNTPOINT=""
NAME="sdb" ROTA="0" TYPE="disk" SIZE="not-a-number" MODEL="" VENDOR="" RO="0" RM="0" STATE="running" FSTYPE="" SERIAL="" KNAME="sdb" PKNAME="" PARTLABEL="" MOUNTPOINT=""
NAME="sr0" ROTA="1" TYPE="rom" SIZE="1073741312" MODEL="CD" VENDOR="" RO="1" RM="1" STATE="running" FSTYPE="iso9660" SERIAL="" KNAME="sr0" PKNAME="" PARTLABEL="" MOUNTPOINT="/media"
"#;

    #[test]
    fn test_parse_rows_and_children() {
        let listing = parse_lsblk_output(SAMPLE);
        assert_eq!(listing.devices.len(), 3);
        assert_eq!(listing.bad_rows.len(), 1);
        assert!(listing.bad_rows[0].reason.contains("SIZE"));

        let sda = &listing.devices[0];
        assert_eq!(sda.kname, "sda");
        assert_eq!(sda.size, 21_474_836_480);
        assert_eq!(sda.model, "VBOX HARDDISK");
        assert_eq!(sda.vendor, "ATA");
        assert!(sda.rotational);
        assert!(sda.has_children);
        assert_eq!(sda.kind(), Some(DeviceType::Disk));

        let sda1 = &listing.devices[1];
        assert!(!sda1.has_children);
        assert!(sda1.is_bios_boot());

        let sr0 = &listing.devices[2];
        assert!(sr0.read_only);
        assert!(sr0.removable);
        assert_eq!(sr0.kind(), None);
        assert_eq!(sr0.mountpoint, "/media");
    }

    #[test]
    fn test_parse_pairs_errors() {
        assert!(parse_pairs(r#"NAME="sda" BROKEN"#).is_err());
        assert!(parse_pairs(r#"NAME="sda"#).is_err());
        assert_eq!(parse_pairs("").unwrap().len(), 0);
    }

    #[test]
    fn test_missing_kname_is_bad_row() {
        let listing = parse_lsblk_output(r#"NAME="x" TYPE="disk" SIZE="1""#);
        assert!(listing.devices.is_empty());
        assert_eq!(listing.bad_rows[0].reason, "missing KNAME");
    }

    #[test]
    fn test_dev_path_and_state() {
        let dev = BlockDevice {
            kname: "nvme0n1".into(),
            state: "Suspended".into(),
            ..Default::default()
        };
        assert_eq!(dev.dev_path(), PathBuf::from("/dev/nvme0n1"));
        assert!(dev.is_suspended());
        assert_eq!(dev.mechanical_property(), DeviceMechanicalProperty::NonRotational);
    }
}
