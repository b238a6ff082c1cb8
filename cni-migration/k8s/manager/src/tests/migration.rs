use super::*;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn healthy_cluster_completes() {
    let mut h = Harness::new(
        &["n1", "n2", "n3"],
        &[Cni::Flannel],
        Cni::Cilium,
        policy(0.1),
    );

    let phases = h.drive(&[], Duration::from_secs(5), 32).await;

    assert_eq!(h.phase(), MigrationPhase::Completed);
    assert!(phases.windows(2).all(|w| w[0] <= w[1]), "{phases:?}");

    let status = h.status();
    assert_eq!(status.current_cni, Some(Cni::Flannel));
    assert_eq!(status.nodes_total, 3);
    assert_eq!(status.nodes_succeeded, 3);
    assert_eq!(status.nodes_failed, 0);
    assert!(status.failed_summary.is_empty());

    let mut phase = MigrationPhase::Preparing;
    loop {
        assert_eq!(
            h.condition(phase.condition()),
            t("True", conditions::reasons::SUCCEEDED),
            "{phase}"
        );
        match phase.next() {
            Some(next) => phase = next,
            None => break,
        }
    }
    assert_eq!(
        h.condition(conditions::CURRENT_CNI_DETECTION_FAILED),
        t("False", conditions::reasons::DETECTED)
    );

    for state in h.cluster.states() {
        assert_eq!(state.phase(), NodePhase::Completed);
        for condition in [
            conditions::PODS_ANNOTATED,
            conditions::CLEANUP_DONE,
            conditions::PODS_RESTARTED,
        ] {
            assert!(conditions::is_true(state.conditions(), condition));
        }
    }

    assert!(h.toggle.is_enabled_now(Cni::Cilium));
    assert!(!h.toggle.is_enabled_now(Cni::Flannel));
}

#[tokio::test]
async fn preparing_creates_one_owned_state_per_node() {
    let mut h = Harness::new(
        &["n1", "n2", "n3"],
        &[Cni::Flannel],
        Cni::Cilium,
        policy(0.1),
    );

    h.reconcile().await.unwrap();

    assert_eq!(h.phase(), MigrationPhase::WaitingForAgents);
    let states = h.cluster.states();
    assert_eq!(
        states.iter().map(|s| s.name_any()).collect::<Vec<_>>(),
        vec!["n1", "n2", "n3"]
    );
    for state in &states {
        assert!(state.is_owned_by(&h.migration));
        assert_eq!(state.migration_name(), Some(MIGRATION_NAME));
        assert_eq!(state.outgoing_cni(), Some(Cni::Flannel));
    }
}

#[tokio::test]
async fn completed_migration_is_left_alone() {
    let mut h = Harness::new(&["n1", "n2"], &[Cni::Flannel], Cni::Cilium, policy(0.1));
    h.drive(&[], Duration::from_secs(5), 32).await;
    assert!(h.status().is_final());

    let before = h.status();
    let patches = h.cluster.patches();
    let states = h.cluster.states().len();

    h.clock.advance(Duration::from_secs(3600));
    let action = h.reconcile().await.unwrap();

    assert_eq!(action, Action::await_change());
    assert_eq!(h.cluster.patches(), patches);
    assert_eq!(h.cluster.states().len(), states);
    assert_eq!(h.status(), before);
}

#[tokio::test]
async fn detection_failure_holds_preparing() {
    let mut h = Harness::new(&["n1"], &[], Cni::Cilium, policy(0.1));

    let action = h.reconcile().await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    assert_eq!(h.phase(), MigrationPhase::Preparing);
    assert_eq!(h.status().current_cni, None);
    assert_eq!(
        h.condition(conditions::CURRENT_CNI_DETECTION_FAILED),
        t("True", conditions::reasons::DETECTION_FAILED)
    );
    assert!(h.cluster.states().is_empty());

    h.toggle.enable_now(Cni::Flannel);
    h.reconcile().await.unwrap();

    assert_eq!(
        h.condition(conditions::CURRENT_CNI_DETECTION_FAILED),
        t("False", conditions::reasons::DETECTED)
    );
    assert_eq!(h.status().current_cni, Some(Cni::Flannel));
    assert_eq!(h.phase(), MigrationPhase::WaitingForAgents);
}

#[tokio::test]
async fn current_cni_is_frozen_once_detected() {
    let mut h = Harness::new(&["n1"], &[Cni::Flannel], Cni::Cilium, policy(0.1));
    h.reconcile().await.unwrap();

    // A second enabled module would make detection ambiguous; it must not
    // be consulted again.
    h.toggle.enable_now(Cni::SimpleBridge);
    h.cluster.run_agents(&[], h.clock.now());
    h.reconcile().await.unwrap();

    assert_eq!(h.status().current_cni, Some(Cni::Flannel));
    assert_eq!(h.phase(), MigrationPhase::EnablingTargetCNI);
}

#[tokio::test]
async fn target_equal_to_current_is_rejected() {
    let mut h = Harness::new(&["n1"], &[Cni::Cilium], Cni::Cilium, policy(0.1));

    let error = h.reconcile().await.unwrap_err();
    assert!(
        matches!(error, Error::Step { phase: MigrationPhase::Preparing, .. }),
        "{error}"
    );
    assert_eq!(h.phase(), MigrationPhase::Preparing);
    assert_eq!(
        h.condition(conditions::ENVIRONMENT_PREPARED),
        t("False", conditions::reasons::ERROR)
    );
    assert!(h.cluster.states().is_empty());
}

#[tokio::test]
async fn blocking_webhook_delays_node_fan_out() {
    let mut h = Harness::with_webhooks(
        &["n1", "n2"],
        &[Cni::Flannel],
        Cni::Cilium,
        policy(0.1),
        vec!["d8-cni-cilium-webhooks".to_string()],
    );
    h.cluster
        .block_on_webhook("d8-cni-cilium-webhooks", "webhook still registered");

    h.reconcile().await.unwrap();
    assert_eq!(h.phase(), MigrationPhase::Preparing);
    assert_eq!(
        h.condition(conditions::ENVIRONMENT_PREPARED),
        t("False", conditions::reasons::IN_PROGRESS)
    );
    assert!(h.cluster.states().is_empty());

    h.cluster.unblock_webhook("d8-cni-cilium-webhooks");
    h.reconcile().await.unwrap();
    assert_eq!(h.phase(), MigrationPhase::WaitingForAgents);
    assert_eq!(h.cluster.states().len(), 2);
}

#[tokio::test]
async fn restart_waits_for_webhook_backends() {
    let webhook = "d8-cni-cilium-webhooks";
    let mut h = Harness::with_webhooks(
        &["n1"],
        &[Cni::Flannel],
        Cni::Cilium,
        policy(0.1),
        vec![webhook.to_string()],
    );
    h.cluster
        .0
        .lock()
        .unready
        .insert(webhook.to_string(), "no ready pods".to_string());

    let phases = h.drive(&[], Duration::from_secs(5), 16).await;
    assert_eq!(phases.last(), Some(&MigrationPhase::RestartingPods));
    assert_eq!(
        h.condition(conditions::PODS_RESTARTED),
        t("False", conditions::reasons::IN_PROGRESS)
    );

    h.cluster.0.lock().unready.clear();
    h.drive(&[], Duration::from_secs(5), 4).await;
    assert_eq!(h.phase(), MigrationPhase::Completed);
    assert!(h.status().is_final());
}

#[tokio::test]
async fn pause_annotation_holds_phase() {
    let mut h = Harness::new(&["n1"], &[Cni::Flannel], Cni::Cilium, policy(0.1));
    h.migration.metadata.annotations = Some(maplit::btreemap! {
        crate::k8s::PAUSE_BEFORE_PHASE_ANNOTATION.to_string() => "EnablingTargetCNI".to_string(),
    });

    let phases = h.drive(&[], Duration::from_secs(5), 8).await;
    assert_eq!(phases.last(), Some(&MigrationPhase::EnablingTargetCNI));
    assert!(!h.toggle.is_enabled_now(Cni::Cilium));

    h.migration.metadata.annotations = None;
    h.reconcile().await.unwrap();
    assert_eq!(h.phase(), MigrationPhase::DisablingCurrentCNI);
    assert!(h.toggle.is_enabled_now(Cni::Cilium));
}

#[tokio::test]
async fn enable_waits_for_rollout() {
    let mut h = Harness::new(&["n1"], &[Cni::Flannel], Cni::Cilium, policy(0.1));
    h.toggle.set_readiness(
        Cni::Cilium,
        Readiness::Progressing("1 of 3 pods scheduled".to_string()),
    );

    let phases = h.drive(&[], Duration::from_secs(5), 6).await;
    assert_eq!(phases.last(), Some(&MigrationPhase::EnablingTargetCNI));
    assert_eq!(
        h.condition(conditions::TARGET_CNI_ENABLED),
        t("False", conditions::reasons::IN_PROGRESS)
    );

    h.toggle.set_readiness(Cni::Cilium, Readiness::RolledOut);
    h.reconcile().await.unwrap();
    assert_eq!(h.phase(), MigrationPhase::DisablingCurrentCNI);
}

#[tokio::test]
async fn new_node_is_registered_while_waiting_for_agents() {
    let mut h = Harness::new(&["n1", "n2"], &[Cni::Flannel], Cni::Cilium, policy(0.1));
    h.reconcile().await.unwrap();
    assert_eq!(h.phase(), MigrationPhase::WaitingForAgents);

    h.cluster.run_agents(&[], h.clock.now());
    h.cluster.add_node("n3");
    h.reconcile().await.unwrap();

    assert_eq!(h.phase(), MigrationPhase::WaitingForAgents);
    assert_eq!(h.cluster.states().len(), 3);
    assert_eq!(
        h.condition(conditions::AGENTS_READY),
        t("False", conditions::reasons::IN_PROGRESS)
    );

    h.cluster.run_agents(&[], h.clock.now());
    h.reconcile().await.unwrap();
    assert_eq!(h.phase(), MigrationPhase::EnablingTargetCNI);
    assert_eq!(h.status().nodes_total, 3);
}

#[tokio::test]
async fn deleted_node_leaves_the_quorum() {
    let mut h = Harness::new(
        &["n1", "n2", "n3"],
        &[Cni::Flannel],
        Cni::Cilium,
        policy(0.1),
    );
    h.reconcile().await.unwrap();

    h.cluster
        .run_agents(&[("n3", NodePhase::PodsAnnotating)], h.clock.now());
    h.cluster.remove_node("n3");
    h.reconcile().await.unwrap();

    assert_eq!(h.phase(), MigrationPhase::EnablingTargetCNI);
    let status = h.status();
    assert_eq!(status.nodes_total, 2);
    assert_eq!(status.nodes_failed, 0);
    assert!(status.failed_summary.is_empty());
}

#[tokio::test]
async fn agents_never_run_ahead_of_the_cluster() {
    let mut h = Harness::new(
        &["n1", "n2", "n3"],
        &[Cni::Flannel],
        Cni::Cilium,
        policy(0.1),
    );

    for _ in 0..32 {
        h.reconcile().await.unwrap();
        if h.status().is_final() {
            break;
        }

        // Agents get several chances per round to race ahead.
        for _ in 0..3 {
            h.cluster.run_agents(&[], h.clock.now());
        }
        let phase = h.phase();
        for state in h.cluster.states() {
            let node = state.name_any();
            if phase < MigrationPhase::CleaningNodes {
                assert!(state.phase() <= NodePhase::NodeCleaning, "{node} during {phase}");
                assert!(
                    !conditions::is_true(state.conditions(), conditions::CLEANUP_DONE),
                    "{node} cleaned up during {phase}"
                );
            }
            if phase < MigrationPhase::RestartingPods {
                assert!(
                    !conditions::is_true(state.conditions(), conditions::PODS_RESTARTED),
                    "{node} restarted pods during {phase}"
                );
            }
        }
        h.clock.advance(Duration::from_secs(5));
    }

    assert_eq!(h.phase(), MigrationPhase::Completed);
    for state in h.cluster.states() {
        assert_eq!(state.phase(), NodePhase::Completed);
        assert_eq!(state.allowed_phase(), NodePhase::RestartingPods);
    }
    // Each gate is opened once per node.
    assert_eq!(h.cluster.gate_patches(), 6);
}

#[tokio::test]
async fn gates_stay_closed_while_waiting_for_agents() {
    let mut h = Harness::new(&["n1", "n2"], &[Cni::Flannel], Cni::Cilium, policy(0.1));
    h.reconcile().await.unwrap();
    h.cluster
        .run_agents(&[("n2", NodePhase::PodsAnnotating)], h.clock.now());
    h.cluster.run_agents(&[], h.clock.now());

    let states = h.cluster.states();
    assert!(states.iter().all(|s| s.phase() == NodePhase::NodeCleaning));
    assert!(states
        .iter()
        .all(|s| s.allowed_phase() == NodePhase::PodsAnnotating));
    assert_eq!(h.cluster.gate_patches(), 0);
}
