//! Device Filters
//!
//! The ordered inclusion chain a LocalVolumeSet applies to every block
//! device, and the availability classification used by discovery.

use crate::crd::{DeviceAvailability, DeviceInclusionSpec};
use crate::domain::ports::DeviceInspector;
use crate::error::Result;
use crate::hardware::blockdev::BlockDevice;
use tracing::trace;

// =============================================================================
// Verdict
// =============================================================================

/// Outcome of running the inclusion chain on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every predicate passed
    Accept,
    /// The named predicate rejected the device
    Reject(&'static str),
}

// Predicate names, also used in log lines
pub const CAN_OPEN_EXCLUSIVELY: &str = "canOpenExclusively";
pub const NO_BIND_MOUNTS: &str = "noBindMounts";
pub const NO_CHILDREN: &str = "noChildren";
pub const NOT_REMOVABLE: &str = "notRemovable";
pub const NOT_READ_ONLY: &str = "notReadOnly";
pub const NOT_SUSPENDED: &str = "notSuspended";
pub const NO_BIOS_BOOT: &str = "noBiosBootInPartLabel";
pub const NO_FILESYSTEM: &str = "noFilesystemSignature";
pub const DEVICE_TYPE: &str = "inTypeList";
pub const MECHANICAL_PROPERTY: &str = "inMechanicalPropertyList";
pub const SIZE_RANGE: &str = "inSizeRange";
pub const MODEL: &str = "inModelList";
pub const VENDOR: &str = "inVendorList";

// =============================================================================
// Inclusion Chain
// =============================================================================

/// Run the inclusion chain in order, stopping at the first rejection
///
/// Host predicates come first so a device the kernel holds open is never
/// considered further. A predicate error aborts evaluation for this
/// device only.
pub fn evaluate(
    device: &BlockDevice,
    inclusion: &DeviceInclusionSpec,
    inspector: &dyn DeviceInspector,
) -> Result<Verdict> {
    if !inspector.can_open_exclusively(device)? {
        return Ok(reject(device, CAN_OPEN_EXCLUSIVELY));
    }
    if inspector.has_bind_mounts(device)? {
        return Ok(reject(device, NO_BIND_MOUNTS));
    }
    Ok(evaluate_static(device, inclusion))
}

/// The part of the chain that only looks at lsblk attributes
pub fn evaluate_static(device: &BlockDevice, inclusion: &DeviceInclusionSpec) -> Verdict {
    let checks: [(&'static str, bool); 11] = [
        (NO_CHILDREN, !device.has_children),
        (NOT_REMOVABLE, !device.removable),
        (NOT_READ_ONLY, !device.read_only),
        (NOT_SUSPENDED, !device.is_suspended()),
        (NO_BIOS_BOOT, !device.is_bios_boot()),
        (NO_FILESYSTEM, device.fstype.is_empty()),
        (
            DEVICE_TYPE,
            device
                .kind()
                .map_or(false, |kind| inclusion.device_types.contains(&kind)),
        ),
        (
            MECHANICAL_PROPERTY,
            inclusion
                .device_mechanical_properties
                .contains(&device.mechanical_property()),
        ),
        (SIZE_RANGE, in_size_range(device.size, inclusion)),
        (MODEL, matches_any(&device.model, &inclusion.models)),
        (VENDOR, matches_any(&device.vendor, &inclusion.vendors)),
    ];

    checks
        .iter()
        .find(|(_, passed)| !passed)
        .map_or(Verdict::Accept, |(name, _)| reject(device, *name))
}

fn reject(device: &BlockDevice, predicate: &'static str) -> Verdict {
    trace!("{} rejected by {}", device.kname, predicate);
    Verdict::Reject(predicate)
}

/// An unparsable size window matches nothing
fn in_size_range(size: u64, inclusion: &DeviceInclusionSpec) -> bool {
    inclusion
        .size_bounds()
        .map_or(false, |bounds| bounds.contains(size))
}

/// Case-sensitive substring match; an empty list matches everything
fn matches_any(value: &str, needles: &[String]) -> bool {
    needles.is_empty() || needles.iter().any(|n| value.contains(n.as_str()))
}

// =============================================================================
// Discovery Classification
// =============================================================================

/// Whether discovery should report the device at all
pub fn discoverable(device: &BlockDevice) -> bool {
    !device.read_only && !device.is_suspended() && !device.has_children && device.kind().is_some()
}

/// Availability of a device for discovery results
pub fn classify(device: &BlockDevice, inspector: &dyn DeviceInspector) -> DeviceAvailability {
    if !device.fstype.is_empty() || device.is_bios_boot() {
        return DeviceAvailability::NotAvailable;
    }

    let host_checks = || -> Result<bool> {
        Ok(inspector.can_open_exclusively(device)? && !inspector.has_bind_mounts(device)?)
    };
    match host_checks() {
        Ok(true) => DeviceAvailability::Available,
        Ok(false) => DeviceAvailability::NotAvailable,
        Err(e) => {
            trace!("Cannot classify {}: {}", device.kname, e);
            DeviceAvailability::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DeviceMechanicalProperty, DeviceType};
    use crate::testing::FakeInspector;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn disk(kname: &str, size: u64) -> BlockDevice {
        BlockDevice {
            name: kname.into(),
            kname: kname.into(),
            device_type: "disk".into(),
            size,
            state: "running".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_disk_accepted() {
        let inspector = FakeInspector::default();
        let verdict = evaluate(&disk("sdb", 5 * GIB), &DeviceInclusionSpec::default(), &inspector).unwrap();
        assert_eq!(verdict, Verdict::Accept);
    }

    #[test]
    fn test_chain_order() {
        let mut inspector = FakeInspector::default();
        inspector.busy.insert("sdb".into());
        inspector.bind_mounted.insert("sdb".into());

        let mut dev = disk("sdb", 5 * GIB);
        dev.has_children = true;
        let inclusion = DeviceInclusionSpec::default();

        assert_eq!(evaluate(&dev, &inclusion, &inspector).unwrap(), Verdict::Reject(CAN_OPEN_EXCLUSIVELY));
        inspector.busy.clear();
        assert_eq!(evaluate(&dev, &inclusion, &inspector).unwrap(), Verdict::Reject(NO_BIND_MOUNTS));
        inspector.bind_mounted.clear();
        assert_eq!(evaluate(&dev, &inclusion, &inspector).unwrap(), Verdict::Reject(NO_CHILDREN));
    }

    fn disk_with(mutate: impl FnOnce(&mut BlockDevice)) -> BlockDevice {
        let mut dev = disk("sdx", 2 * GIB);
        mutate(&mut dev);
        dev
    }

    #[test]
    fn test_static_rejections() {
        let inclusion = DeviceInclusionSpec::default();
        let check = |dev: BlockDevice, expected: &'static str| {
            assert_eq!(evaluate_static(&dev, &inclusion), Verdict::Reject(expected));
        };

        check(disk_with(|d| d.removable = true), NOT_REMOVABLE);
        check(disk_with(|d| d.read_only = true), NOT_READ_ONLY);
        check(disk_with(|d| d.state = "suspended".into()), NOT_SUSPENDED);
        check(disk_with(|d| d.partlabel = "BIOS-BOOT".into()), NO_BIOS_BOOT);
        check(disk_with(|d| d.fstype = "xfs".into()), NO_FILESYSTEM);
        check(disk_with(|d| d.device_type = "part".into()), DEVICE_TYPE);
        check(disk_with(|d| d.device_type = "rom".into()), DEVICE_TYPE);
        check(disk_with(|d| d.size = GIB - 1), SIZE_RANGE);
    }

    #[test]
    fn test_inclusion_lists() {
        let inclusion = DeviceInclusionSpec {
            device_types: vec![DeviceType::Disk, DeviceType::Part],
            device_mechanical_properties: vec![DeviceMechanicalProperty::NonRotational],
            min_size: Some(Quantity("1Gi".into())),
            max_size: Some(Quantity("10Gi".into())),
            models: vec!["SAMSUNG".into()],
            vendors: vec!["ATA".into()],
        };

        let mut dev = disk("nvme0n1", 4 * GIB);
        dev.device_type = "part".into();
        dev.model = "SAMSUNG MZ7".into();
        dev.vendor = "ATA".into();
        assert_eq!(evaluate_static(&dev, &inclusion), Verdict::Accept);

        dev.rotational = true;
        assert_eq!(evaluate_static(&dev, &inclusion), Verdict::Reject(MECHANICAL_PROPERTY));
        dev.rotational = false;

        dev.size = 11 * GIB;
        assert_eq!(evaluate_static(&dev, &inclusion), Verdict::Reject(SIZE_RANGE));
        dev.size = 4 * GIB;

        dev.model = "samsung mz7".into();
        assert_eq!(evaluate_static(&dev, &inclusion), Verdict::Reject(MODEL));
        dev.model = "SAMSUNG".into();

        dev.vendor = "NVMe".into();
        assert_eq!(evaluate_static(&dev, &inclusion), Verdict::Reject(VENDOR));
    }

    #[test]
    fn test_exponent_and_invalid_sizes() {
        let exponent = DeviceInclusionSpec {
            min_size: Some(Quantity("1e9".into())),
            max_size: Some(Quantity("5e9".into())),
            ..Default::default()
        };
        assert_eq!(evaluate_static(&disk("sdb", 2 * GIB), &exponent), Verdict::Accept);
        assert_eq!(evaluate_static(&disk("sdb", 6 * GIB), &exponent), Verdict::Reject(SIZE_RANGE));

        let invalid = DeviceInclusionSpec {
            max_size: Some(Quantity("lots".into())),
            ..Default::default()
        };
        assert_eq!(evaluate_static(&disk("sdb", 2 * GIB), &invalid), Verdict::Reject(SIZE_RANGE));
    }

    #[test]
    fn test_predicate_error_propagates() {
        let mut inspector = FakeInspector::default();
        inspector.failing.insert("sdb".into());
        assert!(evaluate(&disk("sdb", 5 * GIB), &DeviceInclusionSpec::default(), &inspector).is_err());
    }

    #[test]
    fn test_classify() {
        let mut inspector = FakeInspector::default();

        let mut ext4 = disk("sdb", 5 * GIB);
        ext4.fstype = "ext4".into();
        assert_eq!(classify(&ext4, &inspector), DeviceAvailability::NotAvailable);
        assert_eq!(classify(&disk("sdc", 5 * GIB), &inspector), DeviceAvailability::Available);

        inspector.bind_mounted.insert("sdd".into());
        assert_eq!(classify(&disk("sdd", 5 * GIB), &inspector), DeviceAvailability::NotAvailable);

        inspector.failing.insert("sde".into());
        assert_eq!(classify(&disk("sde", 5 * GIB), &inspector), DeviceAvailability::Unknown);
    }

    #[test]
    fn test_discoverable() {
        assert!(discoverable(&disk("sdb", GIB)));

        let mut dev = disk("sdb", GIB);
        dev.has_children = true;
        assert!(!discoverable(&dev));

        let mut dev = disk("sr0", GIB);
        dev.device_type = "rom".into();
        assert!(!discoverable(&dev));

        let mut dev = disk("sdb", GIB);
        dev.read_only = true;
        assert!(!discoverable(&dev));
    }
}
