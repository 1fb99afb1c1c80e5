use crate::{
    errors::{
        Attach, CanMount, Detach, DeviceInUse, DeviceMountPath, DeviceOpened, GenerateError,
        MarkState, MissingCapability, MissingSpec, MountDevice, MountRefs, NewHandler,
        NodeStatus, NotAttached, NotReportedInUse, OperationError, PluginByName, PluginBySpec,
        PluginError, SetUp, StillMounted, TearDown, UnmountDevice, VolumeInUse, WaitForAttach,
    },
    mount::{has_mount_refs, is_device_opened},
    pending_operations::Operation,
    plugin::{Detacher, HostMounter, NodeStatusProvider, PluginResolver, VolumePlugin},
    state::{ActualStateOfWorldAttacherUpdater, ActualStateOfWorldMounterUpdater},
    types::{
        AttachedVolume, MountedVolume, NodeName, OperationKind, PluginNodeVolumes, VolumeName,
        VolumeSpec, VolumeToAttach, VolumeToMount,
    },
};

use futures::FutureExt;
use snafu::{OptionExt, ResultExt};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Builds the operations which the executor submits to the pending operations.
/// Generating an operation resolves everything which can be checked upfront, such as the
/// plugin and its capabilities, and fails without submitting anything if that isn't possible.
pub trait OperationGenerator: Send + Sync {
    /// The resolver used to find the plugins of the volumes.
    fn plugin_resolver(&self) -> &Arc<dyn PluginResolver>;

    /// Attach the volume to its node.
    fn generate_attach_volume(
        &self,
        volume_to_attach: VolumeToAttach,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError>;

    /// Detach the volume from its node, optionally checking the node no longer uses it.
    fn generate_detach_volume(
        &self,
        volume_to_detach: AttachedVolume,
        verify_safe_to_detach: bool,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError>;

    /// Verify the volumes of a node are still attached, marking the others as detached.
    fn generate_volumes_are_attached(
        &self,
        attached_volumes: Vec<AttachedVolume>,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError>;

    /// Verify the volumes of a plugin across many nodes with a single plugin call.
    fn generate_bulk_volume_verify(
        &self,
        plugin_name: String,
        volumes: PluginNodeVolumes,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError>;

    /// Mount the volume into its pod, mounting its device first if attachable.
    fn generate_mount_volume(
        &self,
        wait_for_attach_timeout: Duration,
        volume_to_mount: VolumeToMount,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<Operation, GenerateError>;

    /// Unmount the volume from its pod.
    fn generate_unmount_volume(
        &self,
        volume_to_unmount: MountedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<Operation, GenerateError>;

    /// Unmount the volume's device from its global mount path.
    fn generate_unmount_device(
        &self,
        device_to_detach: AttachedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
        host_mounter: Arc<dyn HostMounter>,
    ) -> Result<Operation, GenerateError>;

    /// Verify the volume was attached to the node by the controller.
    fn generate_verify_controller_attached_volume(
        &self,
        volume_to_mount: VolumeToMount,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError>;
}

/// Generates volume operations using the volume plugins.
pub struct VolumeOperationGenerator {
    plugins: Arc<dyn PluginResolver>,
    node_status: Arc<dyn NodeStatusProvider>,
    check_node_capabilities_before_mount: bool,
}

impl std::fmt::Debug for VolumeOperationGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeOperationGenerator")
            .field(
                "check_node_capabilities_before_mount",
                &self.check_node_capabilities_before_mount,
            )
            .finish()
    }
}

impl VolumeOperationGenerator {
    /// Return a new `Self`.
    pub fn new(
        plugins: Arc<dyn PluginResolver>,
        node_status: Arc<dyn NodeStatusProvider>,
        check_node_capabilities_before_mount: bool,
    ) -> Self {
        Self {
            plugins,
            node_status,
            check_node_capabilities_before_mount,
        }
    }

    fn plugin_by_spec(
        &self,
        volume: &VolumeName,
        spec: &VolumeSpec,
    ) -> Result<Arc<dyn VolumePlugin>, GenerateError> {
        self.plugins.find_plugin_by_spec(spec).context(PluginBySpec {
            volume,
            spec_name: &spec.name,
        })
    }

    fn plugin_by_name(
        &self,
        volume: &VolumeName,
        plugin: &str,
    ) -> Result<Arc<dyn VolumePlugin>, GenerateError> {
        self.plugins
            .find_plugin_by_name(plugin)
            .context(PluginByName { volume, plugin })
    }
}

/// Returns the optional plugin capability or an error if the plugin doesn't have it.
fn capability<T: ?Sized>(
    found: Option<Arc<T>>,
    volume: &VolumeName,
    plugin: &dyn VolumePlugin,
    name: &'static str,
) -> Result<Arc<T>, GenerateError> {
    found.context(MissingCapability {
        volume,
        plugin: plugin.name(),
        capability: name,
    })
}

impl OperationGenerator for VolumeOperationGenerator {
    fn plugin_resolver(&self) -> &Arc<dyn PluginResolver> {
        &self.plugins
    }

    fn generate_attach_volume(
        &self,
        volume_to_attach: VolumeToAttach,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError> {
        let VolumeToAttach {
            volume_name,
            volume_spec,
            node_name,
            scheduled_pods,
        } = volume_to_attach;
        let plugin = self.plugin_by_spec(&volume_name, &volume_spec)?;
        let attacher = capability(plugin.attacher(), &volume_name, plugin.as_ref(), "attach")?;

        Ok(async move {
            let device_path = match attacher.attach(&volume_spec, &node_name).await {
                Ok(device_path) => device_path,
                Err(error) => {
                    for pod in &scheduled_pods {
                        tracing::warn!(
                            pod.namespace = %pod.namespace,
                            pod.name = %pod.name,
                            volume.name = %volume_name,
                            %error,
                            "FailedAttachVolume"
                        );
                    }
                    return Err(error).context(Attach {
                        volume: volume_name,
                        node: node_name,
                    });
                }
            };
            tracing::info!(
                volume.name = %volume_name,
                node.name = %node_name,
                device.path = %device_path,
                "AttachVolume.Attach succeeded"
            );

            actual_state
                .mark_volume_as_attached(&volume_name, &volume_spec, &node_name, &device_path)
                .context(MarkState {
                    kind: OperationKind::Attach,
                    volume: volume_name,
                })
        }
        .boxed())
    }

    fn generate_detach_volume(
        &self,
        volume_to_detach: AttachedVolume,
        verify_safe_to_detach: bool,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError> {
        let AttachedVolume {
            volume_name,
            volume_spec,
            node_name,
            ..
        } = volume_to_detach;
        let spec = volume_spec.context(MissingSpec {
            volume: &volume_name,
        })?;
        let plugin = self.plugin_by_spec(&volume_name, &spec)?;
        let detacher = capability(plugin.detacher(), &volume_name, plugin.as_ref(), "detach")?;
        let node_status = verify_safe_to_detach.then(|| self.node_status.clone());

        Ok(async move {
            let result = verify_and_detach(
                node_status.as_deref(),
                detacher.as_ref(),
                &volume_name,
                &node_name,
            )
            .await;
            if let Err(error) = result {
                // it's still attached as far as we know, so keep reporting it
                actual_state.add_volume_to_report_as_attached(&volume_name, &node_name);
                return Err(error);
            }
            tracing::info!(
                volume.name = %volume_name,
                node.name = %node_name,
                "DetachVolume.Detach succeeded"
            );

            actual_state.mark_volume_as_detached(&volume_name, &node_name);
            Ok(())
        }
        .boxed())
    }

    fn generate_volumes_are_attached(
        &self,
        attached_volumes: Vec<AttachedVolume>,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError> {
        let mut by_plugin = HashMap::<String, PluginVolumes>::new();
        for volume in attached_volumes {
            let Some(spec) = volume.volume_spec else {
                tracing::error!(
                    volume.name = %volume.volume_name,
                    node.name = %node,
                    "VerifyVolumesAreAttached: no spec for volume"
                );
                continue;
            };
            let plugin = match self.plugin_by_spec(&volume.volume_name, &spec) {
                Ok(plugin) => plugin,
                Err(error) => {
                    tracing::error!(node.name = %node, %error, "VerifyVolumesAreAttached");
                    continue;
                }
            };
            by_plugin
                .entry(plugin.name().to_string())
                .or_insert_with(|| PluginVolumes::new(plugin))
                .add(volume.volume_name, spec);
        }

        Ok(async move {
            for (plugin_name, volumes) in by_plugin {
                let Some(attacher) = volumes.plugin.attacher() else {
                    tracing::error!(
                        plugin.name = %plugin_name,
                        node.name = %node,
                        "VolumesAreAttached: plugin is not attachable"
                    );
                    continue;
                };
                let attached = match attacher.volumes_are_attached(&volumes.specs, &node).await {
                    Ok(attached) => attached,
                    Err(error) => {
                        tracing::error!(
                            plugin.name = %plugin_name,
                            node.name = %node,
                            %error,
                            "VolumesAreAttached failed"
                        );
                        continue;
                    }
                };
                for (spec_name, is_attached) in attached {
                    if is_attached {
                        continue;
                    }
                    if let Some(volume_name) = volumes.names.get(&spec_name) {
                        actual_state.mark_volume_as_detached(volume_name, &node);
                        tracing::info!(
                            volume.name = %volume_name,
                            spec.name = %spec_name,
                            node.name = %node,
                            "Volume is no longer attached to the node, marked as detached"
                        );
                    }
                }
            }
            Ok(())
        }
        .boxed())
    }

    fn generate_bulk_volume_verify(
        &self,
        plugin_name: String,
        volumes: PluginNodeVolumes,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError> {
        let plugin_volume = VolumeName::from(plugin_name.as_str());
        let plugin = self.plugin_by_name(&plugin_volume, &plugin_name)?;
        let verifier = capability(
            plugin.bulk_verifier(),
            &plugin_volume,
            plugin.as_ref(),
            "bulk volume verification",
        )?;

        Ok(async move {
            let attached = match verifier.bulk_verify_volumes(volumes.specs()).await {
                Ok(attached) => attached,
                Err(error) => {
                    tracing::error!(plugin.name = %plugin_name, %error, "BulkVerifyVolumes failed");
                    return Ok(());
                }
            };
            for (node, node_attached) in attached {
                for (spec_name, is_attached) in node_attached {
                    if is_attached {
                        continue;
                    }
                    if let Some(volume_name) = volumes.volume_name(&node, &spec_name) {
                        actual_state.mark_volume_as_detached(volume_name, &node);
                        tracing::info!(
                            volume.name = %volume_name,
                            spec.name = %spec_name,
                            node.name = %node,
                            "BulkVerifyVolumes: volume is no longer attached, marked as detached"
                        );
                    }
                }
            }
            Ok(())
        }
        .boxed())
    }

    fn generate_mount_volume(
        &self,
        wait_for_attach_timeout: Duration,
        volume_to_mount: VolumeToMount,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<Operation, GenerateError> {
        let volume_name = &volume_to_mount.volume_name;
        let plugin = self.plugin_by_spec(volume_name, &volume_to_mount.volume_spec)?;
        let mounter = plugin
            .new_mounter(&volume_to_mount.volume_spec, &volume_to_mount.pod)
            .context(NewHandler {
                volume: volume_name,
                plugin: plugin.name(),
                what: "mounter",
            })?;
        let attacher = plugin.attacher();
        let check_node_capabilities = self.check_node_capabilities_before_mount;

        Ok(async move {
            let VolumeToMount {
                volume_name,
                pod_name,
                volume_spec,
                outer_volume_spec_name,
                pod,
                volume_gid_value,
                device_path,
                ..
            } = volume_to_mount;

            if let Some(attacher) = attacher {
                let device_path = tokio::time::timeout(
                    wait_for_attach_timeout,
                    attacher.wait_for_attach(&volume_spec, &device_path, wait_for_attach_timeout),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(PluginError::Timeout {
                        what: "the volume to be attached".to_string(),
                        timeout: wait_for_attach_timeout,
                    })
                })
                .context(WaitForAttach {
                    volume: &volume_name,
                    pod: &pod_name,
                })?;

                let device_mount_path = attacher
                    .device_mount_path(&volume_spec)
                    .context(DeviceMountPath {
                        volume: &volume_name,
                    })?;
                attacher
                    .mount_device(&volume_spec, &device_path, &device_mount_path)
                    .await
                    .context(MountDevice {
                        volume: &volume_name,
                        device_path: &device_path,
                    })?;
                tracing::info!(
                    volume.name = %volume_name,
                    device.path = %device_path,
                    device.mount_path = %device_mount_path,
                    "MountVolume.MountDevice succeeded"
                );

                actual_state
                    .mark_device_as_mounted(&volume_name)
                    .context(MarkState {
                        kind: OperationKind::Mount,
                        volume: &volume_name,
                    })?;
            }

            if check_node_capabilities {
                mounter.can_mount().await.context(CanMount {
                    volume: &volume_name,
                    pod: &pod_name,
                })?;
            }

            mounter.set_up(pod.fs_group).await.context(SetUp {
                volume: &volume_name,
                pod: &pod_name,
            })?;
            tracing::info!(
                volume.name = %volume_name,
                pod.name = %pod_name,
                pod.namespace = %pod.namespace,
                "MountVolume.SetUp succeeded"
            );

            actual_state
                .mark_volume_as_mounted(
                    &pod_name,
                    &pod.uid,
                    &volume_name,
                    mounter,
                    &outer_volume_spec_name,
                    &volume_gid_value,
                )
                .context(MarkState {
                    kind: OperationKind::Mount,
                    volume: volume_name,
                })
        }
        .boxed())
    }

    fn generate_unmount_volume(
        &self,
        volume_to_unmount: MountedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
    ) -> Result<Operation, GenerateError> {
        let MountedVolume {
            pod_name,
            volume_name,
            inner_volume_spec_name,
            plugin_name,
            pod_uid,
            ..
        } = volume_to_unmount;
        let plugin = self.plugin_by_name(&volume_name, &plugin_name)?;
        let unmounter = plugin
            .new_unmounter(&inner_volume_spec_name, &pod_uid)
            .context(NewHandler {
                volume: &volume_name,
                plugin: plugin.name(),
                what: "unmounter",
            })?;

        Ok(async move {
            unmounter.tear_down().await.context(TearDown {
                volume: &volume_name,
                pod: &pod_name,
            })?;
            tracing::info!(
                volume.name = %volume_name,
                pod.name = %pod_name,
                "UnmountVolume.TearDown succeeded"
            );

            // the volume is gone either way, the state will catch up on the next sync
            if let Err(error) = actual_state.mark_volume_as_unmounted(&pod_name, &volume_name) {
                tracing::error!(
                    volume.name = %volume_name,
                    pod.name = %pod_name,
                    %error,
                    "UnmountVolume.MarkVolumeAsUnmounted failed"
                );
            }
            Ok(())
        }
        .boxed())
    }

    fn generate_unmount_device(
        &self,
        device_to_detach: AttachedVolume,
        actual_state: Arc<dyn ActualStateOfWorldMounterUpdater>,
        host_mounter: Arc<dyn HostMounter>,
    ) -> Result<Operation, GenerateError> {
        let AttachedVolume {
            volume_name,
            volume_spec,
            device_path,
            ..
        } = device_to_detach;
        let spec = volume_spec.context(MissingSpec {
            volume: &volume_name,
        })?;
        let plugin = self.plugin_by_spec(&volume_name, &spec)?;
        let attacher = capability(plugin.attacher(), &volume_name, plugin.as_ref(), "attach")?;
        let detacher = capability(plugin.detacher(), &volume_name, plugin.as_ref(), "detach")?;

        Ok(async move {
            let device_mount_path = attacher.device_mount_path(&spec).context(DeviceMountPath {
                volume: &volume_name,
            })?;
            let refs = plugin
                .device_mount_refs(&device_mount_path)
                .await
                .context(MountRefs {
                    volume: &volume_name,
                    path: &device_mount_path,
                })?;
            if has_mount_refs(&device_mount_path, &refs) {
                return StillMounted {
                    volume: volume_name,
                    path: device_mount_path,
                    refs,
                }
                .fail();
            }

            detacher
                .unmount_device(&device_mount_path)
                .await
                .context(UnmountDevice {
                    volume: &volume_name,
                    path: &device_mount_path,
                })?;

            let opened = is_device_opened(&device_path, host_mounter.as_ref())
                .await
                .context(DeviceOpened {
                    volume: &volume_name,
                    device_path: &device_path,
                })?;
            if opened {
                return DeviceInUse {
                    volume: volume_name,
                    device_path,
                }
                .fail();
            }
            tracing::info!(
                volume.name = %volume_name,
                device.mount_path = %device_mount_path,
                "UnmountDevice succeeded"
            );

            actual_state
                .mark_device_as_unmounted(&volume_name)
                .context(MarkState {
                    kind: OperationKind::UnmountDevice,
                    volume: volume_name,
                })
        }
        .boxed())
    }

    fn generate_verify_controller_attached_volume(
        &self,
        volume_to_mount: VolumeToMount,
        node: NodeName,
        actual_state: Arc<dyn ActualStateOfWorldAttacherUpdater>,
    ) -> Result<Operation, GenerateError> {
        let node_status = self.node_status.clone();

        Ok(async move {
            let VolumeToMount {
                volume_name,
                volume_spec,
                plugin_is_attachable,
                reported_in_use,
                ..
            } = volume_to_mount;
            let mark_state = MarkState {
                kind: OperationKind::VerifyControllerAttached,
                volume: &volume_name,
            };

            if !plugin_is_attachable {
                // nothing to wait for, so consider it attached
                return actual_state
                    .mark_volume_as_attached(&volume_name, &volume_spec, &node, "")
                    .context(mark_state);
            }

            if !reported_in_use {
                return NotReportedInUse {
                    volume: &volume_name,
                    node: &node,
                }
                .fail();
            }

            let attached = node_status
                .volumes_attached(&node)
                .await
                .context(NodeStatus { node: &node })?;
            let Some(status) = attached.into_iter().find(|status| status.name == volume_name)
            else {
                return NotAttached {
                    volume: &volume_name,
                    node: &node,
                }
                .fail();
            };

            actual_state
                .mark_volume_as_attached(&volume_name, &volume_spec, &node, &status.device_path)
                .context(mark_state)?;
            tracing::info!(
                volume.name = %volume_name,
                node.name = %node,
                device.path = %status.device_path,
                "Controller attach succeeded"
            );
            Ok(())
        }
        .boxed())
    }
}

/// The volumes of a node which are handled by the same plugin.
struct PluginVolumes {
    plugin: Arc<dyn VolumePlugin>,
    specs: Vec<VolumeSpec>,
    names: HashMap<String, VolumeName>,
}
impl PluginVolumes {
    fn new(plugin: Arc<dyn VolumePlugin>) -> Self {
        Self {
            plugin,
            specs: vec![],
            names: HashMap::new(),
        }
    }
    fn add(&mut self, volume: VolumeName, spec: VolumeSpec) {
        self.names.insert(spec.name.clone(), volume);
        self.specs.push(spec);
    }
}

async fn verify_and_detach(
    node_status: Option<&dyn NodeStatusProvider>,
    detacher: &dyn Detacher,
    volume: &VolumeName,
    node: &NodeName,
) -> Result<(), OperationError> {
    if let Some(node_status) = node_status {
        let in_use = node_status
            .volumes_in_use(node)
            .await
            .context(NodeStatus { node })?;
        if in_use.contains(volume) {
            return VolumeInUse { volume, node }.fail();
        }
        tracing::info!(volume.name = %volume, node.name = %node, "Volume is safe to detach");
    }
    detacher
        .detach(volume, node)
        .await
        .context(Detach { volume, node })
}
