//! Updaters of the Actual State of World.
//!
//! Operations record their effects through these traits once they succeed. A failed
//! operation leaves the state untouched, which is what prompts the owning control loop
//! to retry it. Implementations must be safe to call concurrently for unrelated volumes.

use crate::{
    errors::PluginError,
    plugin::Mounter,
    types::{NodeName, PodName, VolumeName, VolumeSpec},
};
use std::sync::Arc;

/// Records mount state changes of a node.
pub trait ActualStateOfWorldMounterUpdater: Send + Sync {
    /// The volume is mounted into the pod.
    fn mark_volume_as_mounted(
        &self,
        pod_name: &PodName,
        pod_uid: &uuid::Uuid,
        volume_name: &VolumeName,
        mounter: Arc<dyn Mounter>,
        outer_volume_spec_name: &str,
        volume_gid_value: &str,
    ) -> Result<(), PluginError>;
    /// The volume is no longer mounted into the pod.
    fn mark_volume_as_unmounted(
        &self,
        pod_name: &PodName,
        volume_name: &VolumeName,
    ) -> Result<(), PluginError>;
    /// The volume's device is mounted at its global mount path.
    fn mark_device_as_mounted(&self, volume_name: &VolumeName) -> Result<(), PluginError>;
    /// The volume's device is no longer mounted at its global mount path.
    fn mark_device_as_unmounted(&self, volume_name: &VolumeName) -> Result<(), PluginError>;
}

/// Records attachment state changes of the cluster.
pub trait ActualStateOfWorldAttacherUpdater: Send + Sync {
    /// The volume is attached to the node at the given device path.
    fn mark_volume_as_attached(
        &self,
        volume_name: &VolumeName,
        volume_spec: &VolumeSpec,
        node_name: &NodeName,
        device_path: &str,
    ) -> Result<(), PluginError>;
    /// The volume is no longer attached to the node.
    fn mark_volume_as_detached(&self, volume_name: &VolumeName, node_name: &NodeName);
    /// Stop reporting the volume as attached in the node status, typically before detaching.
    fn remove_volume_from_report_as_attached(
        &self,
        volume_name: &VolumeName,
        node_name: &NodeName,
    ) -> Result<(), PluginError>;
    /// Report the volume as attached in the node status again, eg: after a failed detach.
    fn add_volume_to_report_as_attached(&self, volume_name: &VolumeName, node_name: &NodeName);
}
