//! Event reasons emitted on owner resources

pub const FOUND_MATCHING_DISK: &str = "FoundMatchingDisk";
pub const ERROR_FINDING_MATCHING_DISK: &str = "ErrorFindingMatchingDisk";
pub const ERROR_RUNNING_BLOCK_LIST: &str = "ErrorRunningBlockList";
pub const ERROR_LISTING_DEVICE_ID: &str = "ErrorListingDeviceID";
pub const DEVICE_SYMLINK_EXISTS: &str = "DeviceSymlinkExists";
pub const SYMLINKED_ON_DEVICE_NAME: &str = "SymLinkedOnDeviceName";
pub const ERROR_CREATING_SYMLINK: &str = "ErrorCreatingSymLink";
pub const DISCOVERED_NEW_DEVICE: &str = "DiscoveredNewDevice";
pub const UPDATED_DISCOVERED_DEVICE_LIST: &str = "UpdatedDiscoveredDeviceList";
pub const ERROR_LISTING_EXISTING_SYMLINKS: &str = "ErrorListingExistingSymlinks";
pub const ERROR_PROVISIONING_DISK: &str = "ErrorProvisioningDisk";
pub const DELETION_FAILED: &str = "localVolumeDeletionFailed";
