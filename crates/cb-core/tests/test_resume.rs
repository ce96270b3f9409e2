mod common;

use std::sync::Arc;
use std::time::Duration;

use cb_core::error::BootstrapError;
use cb_core::models::{FailureReason, Outcome, RunOptions, StepStatus};
use cb_core::services::state::{StateTracker, STATE_FILENAME};

use common::{
    command_of, fast_cluster, fast_options, harness, harness_on, harness_with, phases, step_of,
};

#[tokio::test]
async fn interrupted_bootstrap_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(StateTracker::open(dir.path()).await.unwrap());
    let h = harness_with(1, fast_cluster(), tracker);
    h.channel.fail("worker-1", &command_of("kubernetes-packages"));

    let first = h.orchestrator.run(&[], &[], &fast_options()).await.unwrap();
    assert_eq!(first.exit_code(), 20);
    assert!(dir.path().join(STATE_FILENAME).exists());

    // a new process picks up the persisted records
    h.channel.clear_failures();
    h.channel.clear_calls();
    let reopened = Arc::new(StateTracker::open(dir.path()).await.unwrap());
    let orchestrator = harness_on(1, h.channel.clone(), reopened.clone());
    let second = orchestrator.run(&[], &[], &fast_options()).await.unwrap();

    assert!(second.succeeded(), "{second:?}");
    // finished work on the control plane is not touched again
    assert!(h.channel.calls_on("cp").iter().all(|c| !c.starts_with("kubeadm init")));
    assert_eq!(second.outcome("cp", "kubeadm-init"), Some(&Outcome::SkippedAlreadySatisfied));
    assert_eq!(second.outcome("worker-1", "kubernetes-packages"), Some(&Outcome::Success));
    assert_eq!(second.outcome("worker-1", "join-cluster"), Some(&Outcome::Success));
    assert_eq!(h.channel.token_requests(), 1);
    assert!(reopened.is_satisfied("worker-1", "join-cluster").await);
}

#[tokio::test]
async fn force_reverifies_recorded_steps() {
    let h = harness_with(1, fast_cluster(), Arc::new(StateTracker::in_memory()));
    h.orchestrator
        .run(&phases(&["dependencies"]), &[], &fast_options())
        .await
        .unwrap();
    h.channel.clear_calls();

    let options = RunOptions {
        force: true,
        ..fast_options()
    };
    let report = h
        .orchestrator
        .run(&phases(&["dependencies"]), &[], &options)
        .await
        .unwrap();

    assert!(report.succeeded());
    // every pair is probed, nothing is re-applied
    assert!(!h.channel.calls().is_empty());
    assert_eq!(h.channel.count("apt-get install"), 0);
    assert!(report
        .entries
        .iter()
        .all(|e| e.outcome == Outcome::SkippedAlreadySatisfied));
}

#[tokio::test]
async fn reset_forgets_records_and_rejoins() {
    let h = harness_with(2, fast_cluster(), Arc::new(StateTracker::in_memory()));
    h.orchestrator.run(&[], &[], &fast_options()).await.unwrap();

    let reset = h
        .orchestrator
        .reset(
            &["worker-1".to_string()],
            Some("join-cluster"),
            true,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(reset.removed, 1);
    assert!(reset.succeeded());
    assert!(!h.channel.is_member("worker-1"));
    assert!(h.channel.is_member("worker-2"));
    assert_eq!(h.tracker.status("worker-1", "join-cluster").await, None);
    assert_eq!(
        h.tracker.status("worker-1", "swap-off").await,
        Some(StepStatus::Success)
    );

    h.channel.clear_calls();
    let report = h
        .orchestrator
        .run(&phases(&["worker-join"]), &[], &fast_options())
        .await
        .unwrap();
    assert_eq!(report.outcome("worker-1", "join-cluster"), Some(&Outcome::Success));
    assert_eq!(
        report.outcome("worker-2", "join-cluster"),
        Some(&Outcome::SkippedAlreadySatisfied)
    );
    assert!(h.channel.calls_on("worker-2").is_empty());
}

#[tokio::test]
async fn local_reset_leaves_hosts_alone() {
    let h = harness_with(1, fast_cluster(), Arc::new(StateTracker::in_memory()));
    h.orchestrator
        .run(&phases(&["dependencies"]), &[], &fast_options())
        .await
        .unwrap();
    h.channel.clear_calls();

    let reset = h
        .orchestrator
        .reset(&[], None, false, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(reset.removed > 0);
    assert!(reset.succeeded());
    assert!(h.tracker.snapshot().await.is_empty());
    assert!(h.channel.calls().is_empty());
}

#[tokio::test]
async fn reset_of_unknown_step_is_rejected() {
    let h = harness_with(1, fast_cluster(), Arc::new(StateTracker::in_memory()));
    let result = h
        .orchestrator
        .reset(&[], Some("no-such-step"), false, Duration::from_secs(5))
        .await;
    assert!(matches!(result, Err(BootstrapError::Config(_))));
}

/// Bootstrap everything, then leave worker-1 looking like a join that
/// stopped after the marker was written.
async fn half_joined_worker(workers: usize) -> common::Harness {
    let h = harness(workers);
    let report = h.orchestrator.run(&[], &[], &fast_options()).await.unwrap();
    assert!(report.succeeded(), "{report:?}");
    h.tracker
        .mark_pending("worker-1", &step_of("join-cluster"))
        .await
        .unwrap();
    h.channel.clear_calls();
    h
}

#[tokio::test]
async fn resume_after_crash_mid_join_does_not_trust_the_marker() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(StateTracker::open(dir.path()).await.unwrap());
    let h = harness_with(1, fast_cluster(), tracker);
    h.orchestrator.run(&[], &[], &fast_options()).await.unwrap();
    h.tracker
        .mark_pending("worker-1", &step_of("join-cluster"))
        .await
        .unwrap();

    let reopened = Arc::new(StateTracker::open(dir.path()).await.unwrap());
    let orchestrator = harness_on(1, h.channel.clone(), reopened.clone());
    let report = orchestrator.run(&[], &[], &fast_options()).await.unwrap();

    assert_eq!(report.exit_code(), 20);
    assert_eq!(
        report.outcome("worker-1", "join-cluster"),
        Some(&Outcome::Failed(FailureReason::PartialMembership))
    );
    assert_eq!(
        reopened.status("worker-1", "join-cluster").await,
        Some(StepStatus::Failed)
    );

    let options = RunOptions {
        reset_partial_joins: true,
        ..fast_options()
    };
    let rerun = orchestrator.run(&[], &[], &options).await.unwrap();
    assert_eq!(rerun.outcome("worker-1", "join-cluster"), Some(&Outcome::Success));
    assert_eq!(h.channel.count("kubeadm reset -f"), 1);
}

#[tokio::test]
async fn local_reset_keeps_the_record_of_a_partial_join() {
    let h = half_joined_worker(1).await;

    let reset = h
        .orchestrator
        .reset(
            &["worker-1".to_string()],
            Some("join-cluster"),
            false,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(reset.removed, 0);
    assert_eq!(reset.failed.len(), 1);
    assert_eq!(reset.failed[0].host, "worker-1");
    assert!(reset.failed[0].error.contains("--remote"));
    assert_eq!(reset.exit_code(), 20);
    assert_eq!(
        h.tracker.status("worker-1", "join-cluster").await,
        Some(StepStatus::Pending)
    );

    let report = h
        .orchestrator
        .run(&phases(&["worker-join"]), &[], &fast_options())
        .await
        .unwrap();
    assert_eq!(
        report.outcome("worker-1", "join-cluster"),
        Some(&Outcome::Failed(FailureReason::PartialMembership))
    );
    assert_eq!(h.channel.count("kubeadm join"), 0);
}

#[tokio::test]
async fn local_reset_of_a_whole_host_drops_everything_but_a_partial_join() {
    let h = half_joined_worker(1).await;

    let reset = h
        .orchestrator
        .reset(&["worker-1".to_string()], None, false, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(reset.removed > 0);
    assert_eq!(reset.failed.len(), 1);
    let left: Vec<_> = h
        .tracker
        .snapshot()
        .await
        .into_keys()
        .filter(|(host, _)| host == "worker-1")
        .collect();
    assert_eq!(left, vec![("worker-1".to_string(), "join-cluster".to_string())]);
}

#[tokio::test]
async fn failed_remote_reset_does_not_stop_the_other_workers() {
    let h = harness(3);
    h.orchestrator.run(&[], &[], &fast_options()).await.unwrap();
    h.channel
        .fail("worker-2", "kubeadm reset -f && rm -rf /etc/cni/net.d");

    let reset = h
        .orchestrator
        .reset(&[], Some("join-cluster"), true, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(reset.removed, 2);
    assert_eq!(reset.failed.len(), 1);
    assert_eq!(reset.failed[0].host, "worker-2");
    assert!(!h.channel.is_member("worker-1"));
    assert!(h.channel.is_member("worker-2"));
    assert!(!h.channel.is_member("worker-3"));
    assert_eq!(h.tracker.status("worker-1", "join-cluster").await, None);
    assert_eq!(
        h.tracker.status("worker-2", "join-cluster").await,
        Some(StepStatus::Success)
    );
    assert_eq!(h.tracker.status("worker-3", "join-cluster").await, None);
}
