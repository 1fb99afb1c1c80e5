use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Implements a string based identifier with an empty sentinel value.
macro_rules! impl_string_id {
    ($Name:ident, $Doc:literal) => {
        #[doc = $Doc]
        #[derive(Serialize, Deserialize, Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $Name(String);

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $Name {
            /// The empty sentinel identifier.
            pub fn empty() -> Self {
                $Name(String::new())
            }
            /// Check if this is the empty sentinel identifier.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
            /// Get a reference to the inner string.
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<&str> for $Name {
            fn from(id: &str) -> Self {
                $Name(id.to_string())
            }
        }
        impl From<String> for $Name {
            fn from(id: String) -> Self {
                $Name(id)
            }
        }
        impl From<&$Name> for $Name {
            fn from(id: &$Name) -> $Name {
                id.clone()
            }
        }
        impl From<$Name> for String {
            fn from(id: $Name) -> String {
                id.0
            }
        }
    };
}

impl_string_id!(
    VolumeName,
    "Unique name of a volume, scoped to a node, identifying a (volume, plugin) pairing"
);
impl_string_id!(
    PodName,
    "Unique name of a pod, derived from the pod's UID"
);
impl_string_id!(NodeName, "Name of a cluster node");

impl From<uuid::Uuid> for PodName {
    fn from(uid: uuid::Uuid) -> Self {
        PodName(uid.to_string())
    }
}

/// The kind of a volume lifecycle operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display, strum_macros::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    /// Attach a volume to a node.
    Attach,
    /// Detach a volume from a node.
    Detach,
    /// Verify a node's volumes are still attached, one plugin call per plugin.
    VerifyAttachedPerNode,
    /// Verify the volumes of many nodes in a single plugin call.
    BulkVerifyAttached,
    /// Mount a volume into a pod.
    Mount,
    /// Unmount a volume from a pod.
    Unmount,
    /// Unmount a volume's device from its global mount path.
    UnmountDevice,
    /// Verify the controller has attached a volume to this node.
    VerifyControllerAttached,
}

/// Plugin specific description of a volume.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Eq, PartialEq)]
pub struct VolumeSpec {
    /// The spec name, unique amongst the volumes handled by a plugin on a node.
    pub name: String,
    /// Plugin specific parameters.
    pub parameters: BTreeMap<String, String>,
    /// The volume is to be used read-only.
    pub read_only: bool,
}
impl VolumeSpec {
    /// Return a new `Self` with no parameters.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
    /// Add a plugin parameter.
    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }
}

/// Reference to a pod which consumes volumes.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct PodRef {
    /// Namespace of the pod.
    pub namespace: String,
    /// Name of the pod within its namespace.
    pub name: String,
    /// Unique id of the pod.
    pub uid: uuid::Uuid,
    /// Supplemental group applied to the volume's files on set up.
    pub fs_group: Option<i64>,
}
impl PodRef {
    /// Return a new `Self` with a random uid.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uuid::Uuid::new_v4(),
            fs_group: None,
        }
    }
    /// The unique pod name used to key pod scoped operations.
    pub fn unique_name(&self) -> PodName {
        PodName::from(self.uid)
    }
}

/// A volume which should be attached to a node.
#[derive(Debug, Clone)]
pub struct VolumeToAttach {
    /// The volume to attach.
    pub volume_name: VolumeName,
    /// Spec of the volume, used to find its plugin.
    pub volume_spec: VolumeSpec,
    /// The node to attach the volume to.
    pub node_name: NodeName,
    /// Pods scheduled to the node which reference this volume.
    /// Only used for reporting attach failures.
    pub scheduled_pods: Vec<PodRef>,
}

/// A volume which should be mounted into a pod.
#[derive(Debug, Clone)]
pub struct VolumeToMount {
    /// The volume to mount.
    pub volume_name: VolumeName,
    /// The pod to mount the volume into.
    pub pod_name: PodName,
    /// Spec of the volume, used to find its plugin.
    pub volume_spec: VolumeSpec,
    /// The volume name as referenced by the pod.
    pub outer_volume_spec_name: String,
    /// The pod which references the volume.
    pub pod: PodRef,
    /// Whether the plugin implements attach and detach.
    /// Attachable volumes serialize their mounts against attach and detach.
    pub plugin_is_attachable: bool,
    /// The volume GID annotation value, if any.
    pub volume_gid_value: String,
    /// The path on the node where the volume is attached, if any.
    pub device_path: String,
    /// Whether the volume was reported as in use by the node.
    pub reported_in_use: bool,
}

/// A volume which is attached to a node.
#[derive(Debug, Clone)]
pub struct AttachedVolume {
    /// The attached volume.
    pub volume_name: VolumeName,
    /// None when the spec could not be recovered, eg: after a restart.
    pub volume_spec: Option<VolumeSpec>,
    /// The node the volume is attached to.
    pub node_name: NodeName,
    /// Whether the plugin implements attach and detach.
    pub plugin_is_attachable: bool,
    /// The path of the device on the node.
    pub device_path: String,
}

/// A volume which is mounted into a pod.
#[derive(Debug, Clone)]
pub struct MountedVolume {
    /// The pod the volume is mounted into.
    pub pod_name: PodName,
    /// The mounted volume.
    pub volume_name: VolumeName,
    /// The volume spec name, as understood by the plugin.
    pub inner_volume_spec_name: String,
    /// The volume name as referenced by the pod.
    pub outer_volume_spec_name: String,
    /// Name of the plugin which mounted the volume.
    pub plugin_name: String,
    /// Unique id of the pod.
    pub pod_uid: uuid::Uuid,
    /// The volume GID annotation value, if any.
    pub volume_gid_value: String,
}

/// An attached volume as reported in a node's status.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct AttachedVolumeStatus {
    /// The attached volume.
    pub name: VolumeName,
    /// The path of the device on the node.
    pub device_path: String,
}

/// The volumes of a single plugin, grouped by node, for bulk verification.
#[derive(Debug, Default, Clone)]
pub struct PluginNodeVolumes {
    specs: HashMap<NodeName, Vec<VolumeSpec>>,
    names: HashMap<(NodeName, String), VolumeName>,
}
impl PluginNodeVolumes {
    /// Add an attached volume of the node.
    pub fn add(&mut self, node: &NodeName, volume: &VolumeName, spec: &VolumeSpec) {
        self.specs.entry(node.clone()).or_default().push(spec.clone());
        self.names
            .insert((node.clone(), spec.name.clone()), volume.clone());
    }
    /// The volume specs of each node.
    pub fn specs(&self) -> &HashMap<NodeName, Vec<VolumeSpec>> {
        &self.specs
    }
    /// The name of the volume of the node with the given spec name.
    pub fn volume_name(&self, node: &NodeName, spec_name: &str) -> Option<&VolumeName> {
        self.names.get(&(node.clone(), spec_name.to_string()))
    }
    /// Number of volumes across all nodes.
    pub fn len(&self) -> usize {
        self.names.len()
    }
    /// Check if there are no volumes.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
