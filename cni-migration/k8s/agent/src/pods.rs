//! Decides which of the node's pods take part in the migration.

use crate::k8s::{Pod, ResourceExt, MIGRATION_MARKER_ANNOTATION};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

const CRITICAL_PRIORITY_CLASSES: [&str; 2] = ["system-node-critical", "system-cluster-critical"];

/// Returns true if the pod is attached to the pod network and can be
/// restarted onto the new data plane.
pub fn should_annotate(pod: &Pod) -> bool {
    if is_terminal(pod) || pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let spec = pod.spec.as_ref();
    if spec.and_then(|s| s.host_network).unwrap_or(false) {
        return false;
    }
    if spec
        .and_then(|s| s.priority_class_name.as_deref())
        .is_some_and(|pc| CRITICAL_PRIORITY_CLASSES.contains(&pc))
    {
        return false;
    }

    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return false;
    }
    !pod.owner_references().iter().any(|o| o.kind == "DaemonSet")
}

/// Returns true if the pod carries the marker for `migration`.
pub fn is_marked(pod: &Pod, migration: &str) -> bool {
    pod.annotations()
        .get(MIGRATION_MARKER_ANNOTATION)
        .is_some_and(|v| v == migration)
}

/// Returns true if the pod was marked by `migration` and is still running.
pub fn should_restart(pod: &Pod, migration: &str) -> bool {
    is_marked(pod, migration) && pod.metadata.deletion_timestamp.is_none() && !is_terminal(pod)
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{ObjectMeta, OwnerReference, PodSpec, PodStatus, Time};
    use rstest::rstest;

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web-0".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    fn owned_by(kind: &str) -> Pod {
        let mut pod = pod();
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: "owner-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        pod
    }

    fn with_phase(phase: &str) -> Pod {
        let mut pod = pod();
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn with_spec(f: impl FnOnce(&mut PodSpec)) -> Pod {
        let mut pod = pod();
        f(pod.spec.get_or_insert_with(Default::default));
        pod
    }

    fn annotated(key: &str, value: &str) -> Pod {
        let mut pod = pod();
        pod.metadata.annotations = Some([(key.to_string(), value.to_string())].into());
        pod
    }

    #[rstest]
    #[case::plain(pod(), true)]
    #[case::replicaset(owned_by("ReplicaSet"), true)]
    #[case::daemonset(owned_by("DaemonSet"), false)]
    #[case::succeeded(with_phase("Succeeded"), false)]
    #[case::failed(with_phase("Failed"), false)]
    #[case::pending(with_phase("Pending"), true)]
    #[case::host_network(with_spec(|s| s.host_network = Some(true)), false)]
    #[case::node_critical(
        with_spec(|s| s.priority_class_name = Some("system-node-critical".to_string())),
        false
    )]
    #[case::cluster_critical(
        with_spec(|s| s.priority_class_name = Some("system-cluster-critical".to_string())),
        false
    )]
    #[case::high_priority(
        with_spec(|s| s.priority_class_name = Some("production-high".to_string())),
        true
    )]
    #[case::mirror(annotated(MIRROR_POD_ANNOTATION, "abc123"), false)]
    fn annotation_selection(#[case] pod: Pod, #[case] expected: bool) {
        assert_eq!(should_annotate(&pod), expected);
    }

    #[test]
    fn terminating_pods_are_skipped() {
        let mut pod = pod();
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!should_annotate(&pod));
    }

    #[test]
    fn marker_is_scoped_to_migration() {
        let pod = annotated(MIGRATION_MARKER_ANNOTATION, "flannel-to-cilium");
        assert!(is_marked(&pod, "flannel-to-cilium"));
        assert!(!is_marked(&pod, "cilium-to-flannel"));
        assert!(should_restart(&pod, "flannel-to-cilium"));

        let mut done = pod.clone();
        done.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(!should_restart(&done, "flannel-to-cilium"));
    }
}
