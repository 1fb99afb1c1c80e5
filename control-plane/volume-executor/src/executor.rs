//! The operation executor.
//!
//! Each verb generates its operation synchronously and submits it to the nested pending
//! operations under the key which expresses what the operation may run in parallel with.
//! Verbs return once the operation is accepted, rejected or failed to generate; the outcome
//! of the operation itself is observed through the actual state of world.

use crate::{
    errors::{ExecutorError, Generate},
    generator::OperationGenerator,
    pending_operations::NestedPendingOperations,
    plugin::HostMounter,
    state::{ActualStateOfWorldAttacherUpdater, ActualStateOfWorldMounterUpdater},
    types::{
        AttachedVolume, MountedVolume, NodeName, OperationKind, PluginNodeVolumes, PodName,
        VolumeName, VolumeToAttach, VolumeToMount,
    },
};

use snafu::ResultExt;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Starts asynchronous attach, detach, mount and unmount operations.
/// At most one operation per volume (or per volume and pod) is in flight at any time.
pub trait OperationExecutor: Send + Sync {
    /// Attach the volume to its node.
    fn attach_volume(
        &self,
        volume_to_attach: VolumeToAttach,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError>;

    /// Detach the volume from its node.
    /// With `verify_safe_to_detach` the detach fails while the node still reports the volume
    /// as in use.
    fn detach_volume(
        &self,
        volume_to_detach: AttachedVolume,
        verify_safe_to_detach: bool,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError>;

    /// Verify the attachment of the volumes of all the given nodes.
    /// Volumes whose plugin supports bulk verification are verified with one operation per
    /// plugin, all others with one operation per node. Nothing is returned: failures are logged.
    fn verify_volumes_are_attached(
        &self,
        attached_volumes: HashMap<NodeName, Vec<AttachedVolume>>,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    );

    /// Verify the attachment of the volumes of a single node.
    fn verify_volumes_are_attached_per_node(
        &self,
        attached_volumes: Vec<AttachedVolume>,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError>;

    /// Mount the volume into its pod.
    fn mount_volume(
        &self,
        wait_for_attach_timeout: Duration,
        volume_to_mount: VolumeToMount,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<(), ExecutorError>;

    /// Unmount the volume from its pod.
    fn unmount_volume(
        &self,
        volume_to_unmount: MountedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<(), ExecutorError>;

    /// Unmount the volume's device from its global mount path.
    fn unmount_device(
        &self,
        device_to_detach: AttachedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
        host_mounter: Arc<dyn HostMounter>,
    ) -> Result<(), ExecutorError>;

    /// Verify the controller has attached the volume to the node.
    fn verify_controller_attached_volume(
        &self,
        volume_to_mount: VolumeToMount,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError>;

    /// Check if an operation conflicting with the given key is in flight.
    fn is_operation_pending(&self, volume: &VolumeName, pod: &PodName) -> bool;
}

/// Operation executor backed by the nested pending operations.
#[derive(Clone)]
pub struct VolumeOperationExecutor {
    pending_operations: NestedPendingOperations,
    operation_generator: Arc<dyn OperationGenerator>,
}

impl std::fmt::Debug for VolumeOperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeOperationExecutor")
            .field("pending_operations", &self.pending_operations)
            .finish()
    }
}

impl VolumeOperationExecutor {
    /// Return a new `Self`.
    pub fn new(
        operation_generator: Arc<dyn OperationGenerator>,
        pending_operations: NestedPendingOperations,
    ) -> Self {
        Self {
            pending_operations,
            operation_generator,
        }
    }

    /// Get a reference to the pending operations.
    pub fn pending_operations(&self) -> &NestedPendingOperations {
        &self.pending_operations
    }

    /// Wait until all the in-flight operations are complete.
    pub async fn wait(&self) {
        self.pending_operations.wait().await
    }

    /// Verify the volumes of a single plugin across all of their nodes with one operation.
    /// Keyed by the plugin name so a plugin is never bulk verified concurrently.
    pub(crate) fn bulk_verify_volumes(
        &self,
        plugin_name: String,
        volumes: PluginNodeVolumes,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError> {
        let plugin_key = VolumeName::from(plugin_name.as_str());
        let operation = self
            .operation_generator
            .generate_bulk_volume_verify(plugin_name, volumes, actual_state)
            .context(Generate {
                kind: OperationKind::BulkVerifyAttached,
            })?;
        self.pending_operations
            .run(&plugin_key, &PodName::empty(), operation)
    }
}

impl OperationExecutor for VolumeOperationExecutor {
    fn attach_volume(
        &self,
        volume_to_attach: VolumeToAttach,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError> {
        let volume = volume_to_attach.volume_name.clone();
        let operation = self
            .operation_generator
            .generate_attach_volume(volume_to_attach, actual_state)
            .context(Generate {
                kind: OperationKind::Attach,
            })?;
        self.pending_operations
            .run(&volume, &PodName::empty(), operation)
    }

    fn detach_volume(
        &self,
        volume_to_detach: AttachedVolume,
        verify_safe_to_detach: bool,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError> {
        let volume = volume_to_detach.volume_name.clone();
        let operation = self
            .operation_generator
            .generate_detach_volume(volume_to_detach, verify_safe_to_detach, actual_state)
            .context(Generate {
                kind: OperationKind::Detach,
            })?;
        self.pending_operations
            .run(&volume, &PodName::empty(), operation)
    }

    fn verify_volumes_are_attached(
        &self,
        attached_volumes: HashMap<NodeName, Vec<AttachedVolume>>,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) {
        let resolver = self.operation_generator.plugin_resolver();
        let mut bulk_by_plugin = HashMap::<String, PluginNodeVolumes>::new();

        for (node, volumes) in attached_volumes {
            let mut per_node = Vec::new();
            for volume in volumes {
                let Some(spec) = &volume.volume_spec else {
                    tracing::error!(
                        volume.name = %volume.volume_name,
                        node.name = %node,
                        "VerifyVolumesAreAttached: no spec for volume"
                    );
                    continue;
                };
                let plugin = match resolver.find_plugin_by_spec(spec) {
                    Ok(plugin) => plugin,
                    Err(error) => {
                        tracing::error!(
                            volume.name = %volume.volume_name,
                            spec.name = %spec.name,
                            node.name = %node,
                            %error,
                            "VolumesAreAttached.FindPluginBySpec failed"
                        );
                        per_node.push(volume);
                        continue;
                    }
                };
                if plugin.supports_bulk_volume_verification() {
                    bulk_by_plugin
                        .entry(plugin.name().to_string())
                        .or_default()
                        .add(&node, &volume.volume_name, spec);
                } else {
                    per_node.push(volume);
                }
            }

            if per_node.is_empty() {
                continue;
            }
            if let Err(error) =
                self.verify_volumes_are_attached_per_node(per_node, node.clone(), actual_state.clone())
            {
                tracing::error!(
                    node.name = %node,
                    %error,
                    "VerifyVolumesAreAttached: failed to verify the volumes of the node"
                );
            }
        }

        for (plugin_name, volumes) in bulk_by_plugin {
            if let Err(error) =
                self.bulk_verify_volumes(plugin_name.clone(), volumes, actual_state.clone())
            {
                tracing::error!(
                    plugin.name = %plugin_name,
                    %error,
                    "BulkVerifyVolumes: failed to verify the volumes of the plugin"
                );
            }
        }
    }

    fn verify_volumes_are_attached_per_node(
        &self,
        attached_volumes: Vec<AttachedVolume>,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError> {
        let operation = self
            .operation_generator
            .generate_volumes_are_attached(attached_volumes, node, actual_state)
            .context(Generate {
                kind: OperationKind::VerifyAttachedPerNode,
            })?;
        // an empty volume name makes it untracked, so nodes are verified concurrently
        self.pending_operations
            .run(&VolumeName::empty(), &PodName::empty(), operation)
    }

    fn mount_volume(
        &self,
        wait_for_attach_timeout: Duration,
        volume_to_mount: VolumeToMount,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<(), ExecutorError> {
        let volume = volume_to_mount.volume_name.clone();
        // non-attachable volumes may be mounted into many pods in parallel
        let pod = if volume_to_mount.plugin_is_attachable {
            PodName::empty()
        } else {
            volume_to_mount.pod.unique_name()
        };
        let operation = self
            .operation_generator
            .generate_mount_volume(wait_for_attach_timeout, volume_to_mount, actual_state)
            .context(Generate {
                kind: OperationKind::Mount,
            })?;
        self.pending_operations.run(&volume, &pod, operation)
    }

    fn unmount_volume(
        &self,
        volume_to_unmount: MountedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<(), ExecutorError> {
        let volume = volume_to_unmount.volume_name.clone();
        let pod = PodName::from(volume_to_unmount.pod_uid);
        let operation = self
            .operation_generator
            .generate_unmount_volume(volume_to_unmount, actual_state)
            .context(Generate {
                kind: OperationKind::Unmount,
            })?;
        self.pending_operations.run(&volume, &pod, operation)
    }

    fn unmount_device(
        &self,
        device_to_detach: AttachedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
        host_mounter: Arc<dyn HostMounter>,
    ) -> Result<(), ExecutorError> {
        let volume = device_to_detach.volume_name.clone();
        let operation = self
            .operation_generator
            .generate_unmount_device(device_to_detach, actual_state, host_mounter)
            .context(Generate {
                kind: OperationKind::UnmountDevice,
            })?;
        self.pending_operations
            .run(&volume, &PodName::empty(), operation)
    }

    fn verify_controller_attached_volume(
        &self,
        volume_to_mount: VolumeToMount,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<(), ExecutorError> {
        let volume = volume_to_mount.volume_name.clone();
        let operation = self
            .operation_generator
            .generate_verify_controller_attached_volume(volume_to_mount, node, actual_state)
            .context(Generate {
                kind: OperationKind::VerifyControllerAttached,
            })?;
        self.pending_operations
            .run(&volume, &PodName::empty(), operation)
    }

    fn is_operation_pending(&self, volume: &VolumeName, pod: &PodName) -> bool {
        self.pending_operations.is_operation_pending(volume, pod)
    }
}
