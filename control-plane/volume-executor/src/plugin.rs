//! Volume plugin capabilities consumed by the operation generator.
//!
//! A plugin always knows how to set up and tear down a volume for a pod. Attaching,
//! detaching and bulk verification are optional capabilities which a plugin advertises
//! by returning `Some` from the respective query.

use crate::{
    errors::PluginError,
    types::{AttachedVolumeStatus, NodeName, PodRef, VolumeName, VolumeSpec},
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Attach side of an attachable volume plugin.
#[async_trait]
pub trait Attacher: Send + Sync {
    /// Attach the volume to the node, returning the device path on the node.
    async fn attach(&self, spec: &VolumeSpec, node: &NodeName) -> Result<String, PluginError>;
    /// Check which of the given volumes are still attached to the node.
    /// The result is keyed by the spec name.
    async fn volumes_are_attached(
        &self,
        specs: &[VolumeSpec],
        node: &NodeName,
    ) -> Result<HashMap<String, bool>, PluginError>;
    /// Wait until the volume is attached to this node and return its device path.
    async fn wait_for_attach(
        &self,
        spec: &VolumeSpec,
        device_path: &str,
        timeout: Duration,
    ) -> Result<String, PluginError>;
    /// The global mount path of the volume's device.
    fn device_mount_path(&self, spec: &VolumeSpec) -> Result<String, PluginError>;
    /// Mount the device at its global mount path.
    async fn mount_device(
        &self,
        spec: &VolumeSpec,
        device_path: &str,
        device_mount_path: &str,
    ) -> Result<(), PluginError>;
}

/// Detach side of an attachable volume plugin.
#[async_trait]
pub trait Detacher: Send + Sync {
    /// Detach the volume from the node.
    async fn detach(&self, volume: &VolumeName, node: &NodeName) -> Result<(), PluginError>;
    /// Unmount the device from its global mount path.
    async fn unmount_device(&self, device_mount_path: &str) -> Result<(), PluginError>;
}

/// Verifies the attachment of the volumes of many nodes with a single call.
#[async_trait]
pub trait BulkVolumeVerifier: Send + Sync {
    /// Returns, per node, whether each spec (keyed by spec name) is still attached.
    /// Nodes missing from the result could not be checked.
    async fn bulk_verify_volumes(
        &self,
        volumes_by_node: &HashMap<NodeName, Vec<VolumeSpec>>,
    ) -> Result<HashMap<NodeName, HashMap<String, bool>>, PluginError>;
}

/// Sets up a volume for a single pod.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Check the node has what it takes to mount the volume.
    async fn can_mount(&self) -> Result<(), PluginError> {
        Ok(())
    }
    /// Set up the volume at its pod specific path.
    async fn set_up(&self, fs_group: Option<i64>) -> Result<(), PluginError>;
}

/// Tears down a volume of a single pod.
#[async_trait]
pub trait Unmounter: Send + Sync {
    /// Tear down the volume from its pod specific path.
    async fn tear_down(&self) -> Result<(), PluginError>;
}

/// A volume plugin, with its optional capabilities.
#[async_trait]
pub trait VolumePlugin: Send + Sync {
    /// The unique plugin name.
    fn name(&self) -> &str;
    /// Whether the plugin can verify the volumes of many nodes at once.
    fn supports_bulk_volume_verification(&self) -> bool {
        false
    }
    /// The attacher, if the plugin is attachable.
    fn attacher(&self) -> Option<Arc<dyn Attacher>> {
        None
    }
    /// The detacher, if the plugin is attachable.
    fn detacher(&self) -> Option<Arc<dyn Detacher>> {
        None
    }
    /// The bulk verifier, if supported.
    fn bulk_verifier(&self) -> Option<Arc<dyn BulkVolumeVerifier>> {
        None
    }
    /// All the mount references of the device mount path, as found in the mount table.
    async fn device_mount_refs(&self, _device_mount_path: &str) -> Result<Vec<String>, PluginError> {
        Ok(vec![])
    }
    /// Get a new mounter for the volume and pod.
    fn new_mounter(
        &self,
        spec: &VolumeSpec,
        pod: &PodRef,
    ) -> Result<Arc<dyn Mounter>, PluginError>;
    /// Get a new unmounter for the volume of the pod with the given uid.
    fn new_unmounter(
        &self,
        inner_spec_name: &str,
        pod_uid: &uuid::Uuid,
    ) -> Result<Arc<dyn Unmounter>, PluginError>;
}

/// Finds the plugin which handles a volume.
pub trait PluginResolver: Send + Sync {
    /// Find the plugin which supports the given spec.
    fn find_plugin_by_spec(&self, spec: &VolumeSpec) -> Result<Arc<dyn VolumePlugin>, PluginError>;
    /// Find the plugin with the given name.
    fn find_plugin_by_name(&self, name: &str) -> Result<Arc<dyn VolumePlugin>, PluginError>;
}

/// Volume status reported by a node.
#[async_trait]
pub trait NodeStatusProvider: Send + Sync {
    /// Volumes the node reports as in use.
    async fn volumes_in_use(&self, node: &NodeName) -> Result<Vec<VolumeName>, PluginError>;
    /// Volumes the node reports as attached.
    async fn volumes_attached(
        &self,
        node: &NodeName,
    ) -> Result<Vec<AttachedVolumeStatus>, PluginError>;
}

/// Host mount utilities.
#[async_trait]
pub trait HostMounter: Send + Sync {
    /// Check if the path is a block device.
    async fn path_is_device(&self, path: &str) -> Result<bool, PluginError>;
    /// Check if the device is held open by anyone.
    async fn device_opened(&self, path: &str) -> Result<bool, PluginError>;
}
