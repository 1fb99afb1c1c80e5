use crate::{errors::PluginError, plugin::HostMounter};

/// Check if any of the mount references is not nested under the mount path.
/// Some mount helpers bind mount the global mount path into a nested location, and such
/// references must not be taken as the device still being used elsewhere.
pub fn has_mount_refs<S: AsRef<str>>(mount_path: &str, mount_refs: &[S]) -> bool {
    mount_refs
        .iter()
        .any(|mount_ref| !mount_ref.as_ref().contains(mount_path))
}

/// Check if the device is still held open.
/// Paths which are not block devices are never considered open.
pub(crate) async fn is_device_opened(
    device_path: &str,
    mounter: &dyn HostMounter,
) -> Result<bool, PluginError> {
    if !mounter.path_is_device(device_path).await? {
        return Ok(false);
    }
    mounter.device_opened(device_path).await
}
