
use crate::{
    backoff::BackoffConfig,
    errors::{ExecutorError, GenerateError},
    executor::{OperationExecutor, VolumeOperationExecutor},
    generator::VolumeOperationGenerator,
    pending_operations::NestedPendingOperations,
    types::{
        AttachedVolume, MountedVolume, NodeName, OperationKind, PluginNodeVolumes, PodName,
        PodRef, VolumeName, VolumeSpec, VolumeToAttach, VolumeToMount,
    },
};
use fakes::{FakeAsw, FakeHost, FakeNodeStatus, FakePlugin, FakeResolver};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Semaphore;

const WAIT_FOR_ATTACH: Duration = Duration::from_secs(60);

struct Harness {
    executor: VolumeOperationExecutor,
    asw: Arc<FakeAsw>,
    node_status: Arc<FakeNodeStatus>,
}

impl Harness {
    fn new(plugins: &[&Arc<FakePlugin>]) -> Self {
        Self::with_capability_check(plugins, false)
    }
    fn with_capability_check(plugins: &[&Arc<FakePlugin>], check_capabilities: bool) -> Self {
        utils::tracing_telemetry::init_test_tracing();
        let node_status = Arc::new(FakeNodeStatus::default());
        let generator = VolumeOperationGenerator::new(
            Arc::new(FakeResolver::new(plugins)),
            node_status.clone(),
            check_capabilities,
        );
        Self {
            executor: VolumeOperationExecutor::new(
                Arc::new(generator),
                NestedPendingOperations::new(true, BackoffConfig::default()),
            ),
            asw: Arc::new(FakeAsw::default()),
            node_status,
        }
    }
    fn failures(&self, volume: &VolumeName, pod: &PodName) -> u32 {
        self.executor.pending_operations().failures(volume, pod)
    }
}

fn node(name: &str) -> NodeName {
    NodeName::from(name)
}

fn to_attach(volume: &str, spec: VolumeSpec, node_name: &str) -> VolumeToAttach {
    VolumeToAttach {
        volume_name: VolumeName::from(volume),
        volume_spec: spec,
        node_name: node(node_name),
        scheduled_pods: vec![PodRef::new("default", "app")],
    }
}

fn attached(volume: &str, spec: Option<VolumeSpec>, node_name: &str) -> AttachedVolume {
    AttachedVolume {
        volume_name: VolumeName::from(volume),
        volume_spec: spec,
        node_name: node(node_name),
        plugin_is_attachable: true,
        device_path: format!("/dev/{node_name}-{volume}"),
    }
}

fn to_mount(volume: &str, spec: VolumeSpec, pod: &PodRef, attachable: bool) -> VolumeToMount {
    VolumeToMount {
        volume_name: VolumeName::from(volume),
        pod_name: pod.unique_name(),
        outer_volume_spec_name: spec.name.clone(),
        volume_spec: spec,
        pod: pod.clone(),
        plugin_is_attachable: attachable,
        volume_gid_value: String::new(),
        device_path: "/dev/sdb".to_string(),
        reported_in_use: true,
    }
}

fn mounted(volume: &str, spec: &VolumeSpec, plugin: &str, pod: &PodRef) -> MountedVolume {
    MountedVolume {
        pod_name: pod.unique_name(),
        volume_name: VolumeName::from(volume),
        inner_volume_spec_name: spec.name.clone(),
        outer_volume_spec_name: spec.name.clone(),
        plugin_name: plugin.to_string(),
        pod_uid: pod.uid,
        volume_gid_value: String::new(),
    }
}

#[tokio::test]
async fn attach_marks_attached() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);

    harness
        .executor
        .attach_volume(
            to_attach("vol-1", plugin.spec("pv-1"), "node-1"),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(plugin.calls(), vec!["attach:pv-1"]);
    assert_eq!(
        harness.asw.events(),
        vec!["attached:vol-1:node-1:/dev/node-1-pv-1"]
    );
    assert!(!harness
        .executor
        .is_operation_pending(&VolumeName::from("vol-1"), &PodName::empty()));
}

#[tokio::test]
async fn attach_excludes_other_operations_on_the_volume() {
    let gate = Arc::new(Semaphore::new(0));
    let plugin = FakePlugin::gated("fake/attachable", true, &gate);
    let harness = Harness::new(&[&plugin]);
    let volume = VolumeName::from("vol-1");

    harness
        .executor
        .attach_volume(
            to_attach("vol-1", plugin.spec("pv-1"), "node-1"),
            harness.asw.clone(),
        )
        .unwrap();
    assert!(harness
        .executor
        .is_operation_pending(&volume, &PodName::empty()));
    assert!(harness
        .executor
        .is_operation_pending(&volume, &PodName::from("pod-1")));

    let error = harness
        .executor
        .detach_volume(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            false,
            harness.asw.clone(),
        )
        .unwrap_err();
    assert!(error.is_already_exists(), "{error}");

    // other volumes are unaffected
    harness
        .executor
        .attach_volume(
            to_attach("vol-2", plugin.spec("pv-2"), "node-1"),
            harness.asw.clone(),
        )
        .unwrap();

    gate.add_permits(10);
    harness.executor.wait().await;
    assert!(!harness
        .executor
        .is_operation_pending(&volume, &PodName::empty()));
    assert_eq!(harness.asw.events().len(), 2);
}

#[tokio::test]
async fn attach_failure_is_not_returned_but_backs_off() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    plugin.fail("attach");
    let harness = Harness::new(&[&plugin]);
    let volume = VolumeName::from("vol-1");

    harness
        .executor
        .attach_volume(
            to_attach("vol-1", plugin.spec("pv-1"), "node-1"),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert!(harness.asw.events().is_empty());
    assert_eq!(harness.failures(&volume, &PodName::empty()), 1);

    let error = harness
        .executor
        .attach_volume(
            to_attach("vol-1", plugin.spec("pv-1"), "node-1"),
            harness.asw.clone(),
        )
        .unwrap_err();
    assert!(error.is_backoff(), "{error}");
    assert_eq!(plugin.calls(), vec!["attach:pv-1"]);
}

#[tokio::test]
async fn generation_errors_are_returned_synchronously() {
    let attachable = FakePlugin::new("fake/attachable", true, false);
    let local = FakePlugin::new("fake/local", false, false);
    let harness = Harness::new(&[&attachable, &local]);

    let error = harness
        .executor
        .attach_volume(
            to_attach("vol-1", VolumeSpec::new("pv-1"), "node-1"),
            harness.asw.clone(),
        )
        .unwrap_err();
    assert!(matches!(
        error,
        ExecutorError::Generate {
            kind: OperationKind::Attach,
            source: GenerateError::PluginBySpec { .. }
        }
    ));

    let error = harness
        .executor
        .attach_volume(
            to_attach("vol-2", local.spec("pv-2"), "node-1"),
            harness.asw.clone(),
        )
        .unwrap_err();
    assert!(matches!(
        error,
        ExecutorError::Generate {
            source: GenerateError::MissingCapability { .. },
            ..
        }
    ));

    let error = harness
        .executor
        .detach_volume(attached("vol-3", None, "node-1"), false, harness.asw.clone())
        .unwrap_err();
    assert!(matches!(
        error,
        ExecutorError::Generate {
            kind: OperationKind::Detach,
            source: GenerateError::MissingSpec { .. }
        }
    ));

    assert!(!harness
        .executor
        .is_operation_pending(&VolumeName::from("vol-1"), &PodName::empty()));
    assert!(attachable.calls().is_empty());
}

#[tokio::test]
async fn detach_marks_detached() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);

    harness
        .executor
        .detach_volume(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            true,
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(plugin.calls(), vec!["detach:vol-1"]);
    assert_eq!(harness.asw.events(), vec!["detached:vol-1:node-1"]);
}

#[tokio::test]
async fn detach_refused_while_in_use() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);
    let volume = VolumeName::from("vol-1");
    harness.node_status.set_in_use(&node("node-1"), &volume);

    harness
        .executor
        .detach_volume(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            true,
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert!(plugin.calls().is_empty());
    assert_eq!(harness.asw.events(), vec!["reported:vol-1:node-1"]);
    assert_eq!(harness.failures(&volume, &PodName::empty()), 1);
}

#[tokio::test]
async fn detach_unverified_ignores_in_use() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);
    harness
        .node_status
        .set_in_use(&node("node-1"), &VolumeName::from("vol-1"));

    harness
        .executor
        .detach_volume(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            false,
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(harness.asw.events(), vec!["detached:vol-1:node-1"]);
}

#[tokio::test]
async fn detach_failure_reports_as_attached() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    plugin.fail("detach");
    let harness = Harness::new(&[&plugin]);

    harness
        .executor
        .detach_volume(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            false,
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(harness.asw.events(), vec!["reported:vol-1:node-1"]);
}

#[tokio::test]
async fn mount_attachable_volume() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);
    let pod = PodRef::new("default", "app");

    harness
        .executor
        .mount_volume(
            WAIT_FOR_ATTACH,
            to_mount("vol-1", plugin.spec("pv-1"), &pod, true),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(
        plugin.calls(),
        vec!["wait_for_attach:pv-1", "mount_device:pv-1", "set_up:pv-1"]
    );
    assert_eq!(
        harness.asw.events(),
        vec![
            "device_mounted:vol-1".to_string(),
            format!("mounted:{}:vol-1", pod.uid)
        ]
    );
}

#[tokio::test]
async fn mount_non_attachable_volume() {
    let plugin = FakePlugin::new("fake/local", false, false);
    let harness = Harness::new(&[&plugin]);
    let pod = PodRef::new("default", "app");

    harness
        .executor
        .mount_volume(
            WAIT_FOR_ATTACH,
            to_mount("vol-1", plugin.spec("pv-1"), &pod, false),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(plugin.calls(), vec!["set_up:pv-1"]);
    assert_eq!(
        harness.asw.events(),
        vec![format!("mounted:{}:vol-1", pod.uid)]
    );
}

#[tokio::test]
async fn mount_attachable_volume_is_exclusive() {
    let gate = Arc::new(Semaphore::new(0));
    let plugin = FakePlugin::gated("fake/attachable", true, &gate);
    let harness = Harness::new(&[&plugin]);
    let (pod_a, pod_b) = (PodRef::new("default", "a"), PodRef::new("default", "b"));

    harness
        .executor
        .mount_volume(
            WAIT_FOR_ATTACH,
            to_mount("vol-1", plugin.spec("pv-1"), &pod_a, true),
            harness.asw.clone(),
        )
        .unwrap();
    let error = harness
        .executor
        .mount_volume(
            WAIT_FOR_ATTACH,
            to_mount("vol-1", plugin.spec("pv-1"), &pod_b, true),
            harness.asw.clone(),
        )
        .unwrap_err();
    assert!(error.is_already_exists(), "{error}");

    gate.add_permits(10);
    harness.executor.wait().await;
}

#[tokio::test]
async fn mount_non_attachable_volume_into_pods_in_parallel() {
    let gate = Arc::new(Semaphore::new(0));
    let plugin = FakePlugin::gated("fake/local", false, &gate);
    let harness = Harness::new(&[&plugin]);
    let (pod_a, pod_b) = (PodRef::new("default", "a"), PodRef::new("default", "b"));
    let volume = VolumeName::from("vol-1");

    for pod in [&pod_a, &pod_b] {
        harness
            .executor
            .mount_volume(
                WAIT_FOR_ATTACH,
                to_mount("vol-1", plugin.spec("pv-1"), pod, false),
                harness.asw.clone(),
            )
            .unwrap();
    }
    assert!(harness
        .executor
        .is_operation_pending(&volume, &pod_a.unique_name()));
    assert!(harness
        .executor
        .is_operation_pending(&volume, &pod_b.unique_name()));

    // the same pod may not mount twice concurrently
    let error = harness
        .executor
        .mount_volume(
            WAIT_FOR_ATTACH,
            to_mount("vol-1", plugin.spec("pv-1"), &pod_a, false),
            harness.asw.clone(),
        )
        .unwrap_err();
    assert!(error.is_already_exists(), "{error}");

    gate.add_permits(10);
    harness.executor.wait().await;
    assert_eq!(harness.asw.events().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn mount_wait_for_attach_times_out() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    plugin.hang("wait_for_attach");
    let harness = Harness::new(&[&plugin]);
    let pod = PodRef::new("default", "app");

    harness
        .executor
        .mount_volume(
            Duration::from_secs(10),
            to_mount("vol-1", plugin.spec("pv-1"), &pod, true),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(plugin.calls(), vec!["wait_for_attach:pv-1"]);
    assert!(harness.asw.events().is_empty());
    assert_eq!(
        harness.failures(&VolumeName::from("vol-1"), &PodName::empty()),
        1
    );
}

#[tokio::test]
async fn mount_checks_node_capabilities() {
    let plugin = FakePlugin::new("fake/local", false, false);
    plugin.fail("can_mount");
    let harness = Harness::with_capability_check(&[&plugin], true);
    let pod = PodRef::new("default", "app");

    harness
        .executor
        .mount_volume(
            WAIT_FOR_ATTACH,
            to_mount("vol-1", plugin.spec("pv-1"), &pod, false),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(plugin.calls(), vec!["can_mount:pv-1"]);
    assert!(harness.asw.events().is_empty());
}

#[tokio::test]
async fn unmount_is_keyed_by_pod() {
    let gate = Arc::new(Semaphore::new(0));
    let plugin = FakePlugin::gated("fake/attachable", true, &gate);
    let harness = Harness::new(&[&plugin]);
    let (pod_a, pod_b) = (PodRef::new("default", "a"), PodRef::new("default", "b"));
    let volume = VolumeName::from("vol-1");
    let spec = plugin.spec("pv-1");

    for pod in [&pod_a, &pod_b] {
        harness
            .executor
            .unmount_volume(
                mounted("vol-1", &spec, "fake/attachable", pod),
                harness.asw.clone(),
            )
            .unwrap();
    }
    assert!(harness
        .executor
        .is_operation_pending(&volume, &PodName::from(pod_a.uid)));
    assert!(harness
        .executor
        .is_operation_pending(&volume, &PodName::empty()));

    gate.add_permits(10);
    harness.executor.wait().await;

    let mut events = harness.asw.events();
    events.sort();
    let mut expected = vec![
        format!("unmounted:{}:vol-1", pod_a.uid),
        format!("unmounted:{}:vol-1", pod_b.uid),
    ];
    expected.sort();
    assert_eq!(events, expected);
}

#[tokio::test]
async fn unmount_failure_keeps_the_volume_mounted() {
    let plugin = FakePlugin::new("fake/local", false, false);
    plugin.fail("tear_down");
    let harness = Harness::new(&[&plugin]);
    let pod = PodRef::new("default", "app");

    harness
        .executor
        .unmount_volume(
            mounted("vol-1", &plugin.spec("pv-1"), "fake/local", &pod),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert!(harness.asw.events().is_empty());
    assert_eq!(
        harness.failures(&VolumeName::from("vol-1"), &pod.unique_name()),
        1
    );
}

#[tokio::test]
async fn unmount_device() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);
    let mount_path = plugin.device_mount_path("pv-1");
    // nested references don't count as the device being in use
    plugin.set_mount_refs(&[format!("{mount_path}/nested").as_str()]);

    harness
        .executor
        .unmount_device(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            harness.asw.clone(),
            Arc::new(FakeHost::default()),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(plugin.calls(), vec![format!("unmount_device:{mount_path}")]);
    assert_eq!(harness.asw.events(), vec!["device_unmounted:vol-1"]);
}

#[tokio::test]
async fn unmount_device_refused_with_other_mount_refs() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);
    let mount_path = plugin.device_mount_path("pv-1");
    plugin.set_mount_refs(&[
        format!("{mount_path}/nested").as_str(),
        "/var/lib/kubelet/pods/x",
    ]);

    harness
        .executor
        .unmount_device(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            harness.asw.clone(),
            Arc::new(FakeHost::default()),
        )
        .unwrap();
    harness.executor.wait().await;

    assert!(plugin.calls().is_empty());
    assert!(harness.asw.events().is_empty());
    assert_eq!(
        harness.failures(&VolumeName::from("vol-1"), &PodName::empty()),
        1
    );
}

#[tokio::test]
async fn unmount_device_refused_while_device_opened() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);

    harness
        .executor
        .unmount_device(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            harness.asw.clone(),
            Arc::new(FakeHost {
                opened: true,
                ..Default::default()
            }),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(plugin.calls().len(), 1);
    assert!(harness.asw.events().is_empty());
}

#[tokio::test]
async fn unmount_device_fails_when_device_check_fails() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);
    let volume = VolumeName::from("vol-1");

    harness
        .executor
        .unmount_device(
            attached("vol-1", Some(plugin.spec("pv-1")), "node-1"),
            harness.asw.clone(),
            Arc::new(FakeHost {
                stat_fails: true,
                ..Default::default()
            }),
        )
        .unwrap();
    harness.executor.wait().await;

    assert!(harness.asw.events().is_empty());
    assert_eq!(harness.failures(&volume, &PodName::empty()), 1);
}

#[tokio::test]
async fn verify_controller_attached_non_attachable() {
    let plugin = FakePlugin::new("fake/local", false, false);
    let harness = Harness::new(&[&plugin]);
    let pod = PodRef::new("default", "app");

    harness
        .executor
        .verify_controller_attached_volume(
            to_mount("vol-1", plugin.spec("pv-1"), &pod, false),
            node("node-1"),
            harness.asw.clone(),
        )
        .unwrap();
    harness.executor.wait().await;

    assert_eq!(harness.asw.events(), vec!["attached:vol-1:node-1:"]);
}

#[tokio::test]
async fn verify_controller_attached_uses_node_status() {
    let plugin = FakePlugin::new("fake/attachable", true, false);
    let harness = Harness::new(&[&plugin]);
    let pod = PodRef::new("default", "app");
    let node_1 = node("node-1");

    // not reported as in use yet
    let mut volume = to_mount("vol-1", plugin.spec("pv-1"), &pod, true);
    volume.reported_in_use = false;
    harness
        .executor
        .verify_controller_attached_volume(volume, node_1.clone(), harness.asw.clone())
        .unwrap();
    harness.executor.wait().await;
    assert!(harness.asw.events().is_empty());

    // in use, but not yet attached by the controller
    let volume = to_mount("vol-2", plugin.spec("pv-2"), &pod, true);
    harness
        .executor
        .verify_controller_attached_volume(volume, node_1.clone(), harness.asw.clone())
        .unwrap();
    harness.executor.wait().await;
    assert!(harness.asw.events().is_empty());

    harness
        .node_status
        .set_attached(&node_1, &VolumeName::from("vol-3"), "/dev/xvdf");
    let volume = to_mount("vol-3", plugin.spec("pv-3"), &pod, true);
    harness
        .executor
        .verify_controller_attached_volume(volume, node_1, harness.asw.clone())
        .unwrap();
    harness.executor.wait().await;
    assert_eq!(harness.asw.events(), vec!["attached:vol-3:node-1:/dev/xvdf"]);
}

#[tokio::test]
async fn verify_volumes_are_attached_per_node_runs_untracked() {
    let gate = Arc::new(Semaphore::new(0));
    let plugin = FakePlugin::gated("fake/attachable", true, &gate);
    plugin.set_detached("pv-2");
    let harness = Harness::new(&[&plugin]);

    for node_name in ["node-1", "node-2"] {
        harness
            .executor
            .verify_volumes_are_attached_per_node(
                vec![
                    attached("vol-1", Some(plugin.spec("pv-1")), node_name),
                    attached("vol-2", Some(plugin.spec("pv-2")), node_name),
                ],
                node(node_name),
                harness.asw.clone(),
            )
            .unwrap();
    }

    gate.add_permits(10);
    harness.executor.wait().await;

    let mut events = harness.asw.events();
    events.sort();
    assert_eq!(events, vec!["detached:vol-2:node-1", "detached:vol-2:node-2"]);
}

#[tokio::test]
async fn verify_volumes_are_attached() {
    let bulk = FakePlugin::new("fake/bulk", true, true);
    let single = FakePlugin::new("fake/single", true, false);
    bulk.set_detached("bulk-2");
    single.set_detached("single-1");
    let harness = Harness::new(&[&bulk, &single]);

    let attached_volumes = HashMap::from([
        (
            node("node-1"),
            vec![
                attached("vol-b1", Some(bulk.spec("bulk-1")), "node-1"),
                attached("vol-s1", Some(single.spec("single-1")), "node-1"),
                attached("vol-b3", Some(bulk.spec("bulk-3")), "node-1"),
                attached("vol-nospec", None, "node-1"),
            ],
        ),
        (
            node("node-2"),
            vec![
                attached("vol-s2", Some(single.spec("single-2")), "node-2"),
                attached("vol-b2", Some(bulk.spec("bulk-2")), "node-2"),
                attached("vol-unknown", Some(VolumeSpec::new("what")), "node-2"),
            ],
        ),
    ]);
    harness
        .executor
        .verify_volumes_are_attached(attached_volumes, harness.asw.clone());
    harness.executor.wait().await;

    // a single bulk call covers every node of the plugin
    assert_eq!(bulk.calls(), vec!["bulk_verify:node-1,node-2"]);
    let mut single_calls = single.calls();
    single_calls.sort();
    assert_eq!(
        single_calls,
        vec!["volumes_are_attached:node-1", "volumes_are_attached:node-2"]
    );

    let mut events = harness.asw.events();
    events.sort();
    assert_eq!(
        events,
        vec!["detached:vol-b2:node-2", "detached:vol-s1:node-1"]
    );
}

#[tokio::test]
async fn bulk_verify_leaves_unchecked_nodes_alone() {
    let bulk = FakePlugin::new("fake/bulk", true, true);
    bulk.set_detached("bulk-1");
    bulk.set_detached("bulk-2");
    bulk.set_unreachable(&node("node-2"));
    let harness = Harness::new(&[&bulk]);

    let attached_volumes = HashMap::from([
        (
            node("node-1"),
            vec![attached("vol-b1", Some(bulk.spec("bulk-1")), "node-1")],
        ),
        (
            node("node-2"),
            vec![attached("vol-b2", Some(bulk.spec("bulk-2")), "node-2")],
        ),
    ]);
    harness
        .executor
        .verify_volumes_are_attached(attached_volumes, harness.asw.clone());
    harness.executor.wait().await;

    assert_eq!(harness.asw.events(), vec!["detached:vol-b1:node-1"]);
}

#[tokio::test]
async fn bulk_verify_runs_once_per_plugin() {
    let bulk = FakePlugin::new("fake/bulk", true, true);
    let harness = Harness::new(&[&bulk]);
    let volumes = || {
        HashMap::from([(
            node("node-1"),
            vec![attached("vol-b1", Some(bulk.spec("bulk-1")), "node-1")],
        )])
    };

    harness
        .executor
        .verify_volumes_are_attached(volumes(), harness.asw.clone());
    // still in flight, so this round is skipped
    assert!(harness
        .executor
        .is_operation_pending(&VolumeName::from("fake/bulk"), &PodName::empty()));
    harness
        .executor
        .verify_volumes_are_attached(volumes(), harness.asw.clone());
    harness.executor.wait().await;

    assert_eq!(bulk.calls().len(), 1);
}

#[tokio::test]
async fn bulk_verify_generation_errors() {
    let single = FakePlugin::new("fake/single", true, false);
    let harness = Harness::new(&[&single]);
    let volumes = || {
        let mut volumes = PluginNodeVolumes::default();
        volumes.add(
            &node("node-1"),
            &VolumeName::from("vol-1"),
            &single.spec("pv-1"),
        );
        volumes
    };

    let error = harness
        .executor
        .bulk_verify_volumes("fake/gone".to_string(), volumes(), harness.asw.clone())
        .unwrap_err();
    assert!(matches!(
        error,
        ExecutorError::Generate {
            kind: OperationKind::BulkVerifyAttached,
            source: GenerateError::PluginByName { .. }
        }
    ));

    let error = harness
        .executor
        .bulk_verify_volumes("fake/single".to_string(), volumes(), harness.asw.clone())
        .unwrap_err();
    assert!(matches!(
        error,
        ExecutorError::Generate {
            kind: OperationKind::BulkVerifyAttached,
            source: GenerateError::MissingCapability { .. }
        }
    ));
    assert!(!harness
        .executor
        .is_operation_pending(&VolumeName::from("fake/single"), &PodName::empty()));
    assert!(single.calls().is_empty());
}
