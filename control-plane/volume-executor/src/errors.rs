use crate::types::{NodeName, OperationKind, PodName, VolumeName};
use snafu::Snafu;
use std::time::Duration;

/// Failure reported by a volume plugin or by one of the state collaborators.
#[derive(Debug, Snafu, Clone, Eq, PartialEq)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum PluginError {
    /// The call failed with the given message.
    #[snafu(display("{}", message))]
    Failed {
        /// What went wrong.
        message: String,
    },
    /// The call did not complete in time.
    #[snafu(display("Timed out after {:?} waiting for {}", timeout, what))]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long it was waited for.
        timeout: Duration,
    },
}
impl PluginError {
    /// Return a new generic `Self::Failed` with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Errors raised while building an operation, before it is submitted.
/// These are not retryable through the pending operations backoff.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
#[allow(missing_docs)]
pub enum GenerateError {
    #[snafu(display(
        "Failed to find a plugin for volume '{}' (spec.name: '{}'): {}",
        volume,
        spec_name,
        source
    ))]
    PluginBySpec {
        volume: VolumeName,
        spec_name: String,
        source: PluginError,
    },
    #[snafu(display(
        "Failed to find plugin '{}' for volume '{}': {}",
        plugin,
        volume,
        source
    ))]
    PluginByName {
        volume: VolumeName,
        plugin: String,
        source: PluginError,
    },
    #[snafu(display(
        "Plugin '{}' of volume '{}' does not support {}",
        plugin,
        volume,
        capability
    ))]
    MissingCapability {
        volume: VolumeName,
        plugin: String,
        capability: &'static str,
    },
    #[snafu(display("Volume '{}' has no spec", volume))]
    MissingSpec { volume: VolumeName },
    #[snafu(display(
        "Plugin '{}' failed to create the {} for volume '{}': {}",
        plugin,
        what,
        volume,
        source
    ))]
    NewHandler {
        volume: VolumeName,
        plugin: String,
        what: &'static str,
        source: PluginError,
    },
}

/// Errors returned synchronously by the executor verbs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
#[allow(missing_docs)]
pub enum ExecutorError {
    #[snafu(display(
        "An operation for volume '{}' (pod: '{}') is already in progress",
        volume,
        pod
    ))]
    AlreadyExists { volume: VolumeName, pod: PodName },
    #[snafu(display(
        "Operation for volume '{}' (pod: '{}') failed. No retries permitted for {} (durationBeforeRetry {}). Error: {}",
        volume,
        pod,
        humantime::format_duration(*remaining),
        humantime::format_duration(*duration_before_retry),
        last_error
    ))]
    Backoff {
        volume: VolumeName,
        pod: PodName,
        remaining: Duration,
        duration_before_retry: Duration,
        last_error: String,
    },
    #[snafu(display(
        "No async runtime to run the operation for volume '{}' (pod: '{}')",
        volume,
        pod
    ))]
    NoRuntime { volume: VolumeName, pod: PodName },
    #[snafu(display("Failed to generate the {} operation: {}", kind, source))]
    Generate {
        kind: OperationKind,
        source: GenerateError,
    },
}

impl ExecutorError {
    /// The operation was rejected because a conflicting operation is in flight.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
    /// The operation was rejected because its key is still backing off from a failure.
    pub fn is_backoff(&self) -> bool {
        matches!(self, Self::Backoff { .. })
    }
}

/// Errors raised by a running operation.
/// They are logged and recorded against the operation key, never returned to the submitter.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
#[allow(missing_docs)]
pub enum OperationError {
    #[snafu(display(
        "AttachVolume.Attach failed for volume '{}' on node '{}': {}",
        volume,
        node,
        source
    ))]
    Attach {
        volume: VolumeName,
        node: NodeName,
        source: PluginError,
    },
    #[snafu(display(
        "Failed to fetch the volume status of node '{}': {}",
        node,
        source
    ))]
    NodeStatus { node: NodeName, source: PluginError },
    #[snafu(display(
        "DetachVolume failed for volume '{}' from node '{}': the volume is still in use",
        volume,
        node
    ))]
    VolumeInUse { volume: VolumeName, node: NodeName },
    #[snafu(display(
        "DetachVolume.Detach failed for volume '{}' on node '{}': {}",
        volume,
        node,
        source
    ))]
    Detach {
        volume: VolumeName,
        node: NodeName,
        source: PluginError,
    },
    #[snafu(display(
        "MountVolume.WaitForAttach failed for volume '{}' (pod: '{}'): {}",
        volume,
        pod,
        source
    ))]
    WaitForAttach {
        volume: VolumeName,
        pod: PodName,
        source: PluginError,
    },
    #[snafu(display(
        "GetDeviceMountPath failed for volume '{}': {}",
        volume,
        source
    ))]
    DeviceMountPath {
        volume: VolumeName,
        source: PluginError,
    },
    #[snafu(display(
        "MountVolume.MountDevice failed for volume '{}' (device: '{}'): {}",
        volume,
        device_path,
        source
    ))]
    MountDevice {
        volume: VolumeName,
        device_path: String,
        source: PluginError,
    },
    #[snafu(display(
        "MountVolume.CanMount failed for volume '{}' (pod: '{}'): {}",
        volume,
        pod,
        source
    ))]
    CanMount {
        volume: VolumeName,
        pod: PodName,
        source: PluginError,
    },
    #[snafu(display(
        "MountVolume.SetUp failed for volume '{}' (pod: '{}'): {}",
        volume,
        pod,
        source
    ))]
    SetUp {
        volume: VolumeName,
        pod: PodName,
        source: PluginError,
    },
    #[snafu(display(
        "UnmountVolume.TearDown failed for volume '{}' (pod: '{}'): {}",
        volume,
        pod,
        source
    ))]
    TearDown {
        volume: VolumeName,
        pod: PodName,
        source: PluginError,
    },
    #[snafu(display(
        "GetDeviceMountRefs check failed for volume '{}' at '{}': {}",
        volume,
        path,
        source
    ))]
    MountRefs {
        volume: VolumeName,
        path: String,
        source: PluginError,
    },
    #[snafu(display(
        "The device mount path '{}' of volume '{}' is still mounted by other references {:?}",
        path,
        volume,
        refs
    ))]
    StillMounted {
        volume: VolumeName,
        path: String,
        refs: Vec<String>,
    },
    #[snafu(display(
        "UnmountDevice failed for volume '{}' at '{}': {}",
        volume,
        path,
        source
    ))]
    UnmountDevice {
        volume: VolumeName,
        path: String,
        source: PluginError,
    },
    #[snafu(display(
        "UnmountDevice.DeviceOpened failed for volume '{}' (device: '{}'): {}",
        volume,
        device_path,
        source
    ))]
    DeviceOpened {
        volume: VolumeName,
        device_path: String,
        source: PluginError,
    },
    #[snafu(display(
        "UnmountDevice failed for volume '{}': device '{}' is still in use",
        volume,
        device_path
    ))]
    DeviceInUse {
        volume: VolumeName,
        device_path: String,
    },
    #[snafu(display(
        "Volume '{}' has not been added to the list of VolumesInUse of node '{}'",
        volume,
        node
    ))]
    NotReportedInUse { volume: VolumeName, node: NodeName },
    #[snafu(display(
        "Volume '{}' is not attached according to the status of node '{}'",
        volume,
        node
    ))]
    NotAttached { volume: VolumeName, node: NodeName },
    #[snafu(display(
        "Failed to update the actual state after {} of volume '{}': {}",
        kind,
        volume,
        source
    ))]
    MarkState {
        kind: OperationKind,
        volume: VolumeName,
        source: PluginError,
    },
    #[snafu(display("Operation panicked: {}", details))]
    Panicked { details: String },
}
