// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for status reconciliation.
//!
//! Backend jobs are finished without delivering a callback, so the reconciler
//! is the only path that notices completions.

mod common;

use std::time::Duration;

use common::Harness;
use container_service::backend::NativeStatus;
use container_service::finalizing::FinalizeOutcome;
use container_service::models::{ContainerRecord, workflow_status};
use container_service::orchestration::ChainTransition;
use container_service::phase::Phase;
use container_service::queue::FINALIZING;
use container_service::reconciler::ReconcilerConfig;
use container_service::store::ContainerStore;

async fn launch(h: &Harness, wrapper_id: i64, workflow_id: &str) -> String {
    h.service
        .submit_launch(h.launch_request("p1", wrapper_id, workflow_id))
        .await
        .unwrap();
    Harness::launched_id(&h.drain_staging().await[0])
}

#[tokio::test]
async fn test_lost_callback_is_finalized() {
    let h = Harness::new();
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-1").await;

    h.exit(&container_id, 0).await;

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.finalized, 1);
    assert_eq!(h.service.get_queue_depth(FINALIZING).await.unwrap(), 1);

    let outcomes = h.drain_finalizing().await;
    assert!(matches!(outcomes[0], FinalizeOutcome::Finalized { .. }));

    let record = h.record(&container_id).await;
    assert_eq!(record.phase, Phase::Succeeded);
    assert_eq!(record.exit_code.as_deref(), Some("0"));
    assert_eq!(
        h.tracker.latest("wf-1"),
        Some(workflow_status::complete_with_exit_code(Some("0")))
    );
}

#[tokio::test]
async fn test_lost_callback_advances_chain() {
    let h = Harness::new();
    h.add_chain(10, "p1", &[1, 2], true).await;
    let container_id = launch(&h, 1, "run-1").await;

    h.exit(&container_id, 0).await;
    h.reconciler.reconcile_once().await.unwrap();

    let outcomes = h.drain_finalizing().await;
    assert!(matches!(
        outcomes[0],
        FinalizeOutcome::Finalized {
            transition: ChainTransition::Advanced { position: 1, .. }
        }
    ));
    let next = h.drain_staging().await;
    assert_eq!(next.len(), 1);
}

#[tokio::test]
async fn test_terminal_records_are_not_requeued() {
    let h = Harness::new();
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-2").await;

    h.finish(&container_id, 1).await;
    let job_id = h.record(&container_id).await.job_id;
    h.backend.set_status(&job_id, NativeStatus::phase("Running")).await;

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(report.finalized, 0);
    assert_eq!(h.service.get_queue_depth(FINALIZING).await.unwrap(), 0);
    assert_eq!(h.record(&container_id).await.phase, Phase::Failed);
}

#[tokio::test]
async fn test_callback_racing_reconciler_finalizes_once() {
    let h = Harness::new();
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-3").await;

    h.exit_and_notify(&container_id, 0).await;
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.finalized, 1);

    let outcomes = h.drain_finalizing().await;
    assert_eq!(outcomes.len(), 2);
    let finalized = outcomes
        .iter()
        .filter(|o| matches!(o, FinalizeOutcome::Finalized { .. }))
        .count();
    assert_eq!(finalized, 1);
    assert!(outcomes.contains(&FinalizeOutcome::AlreadyFinal));

    let complete = h
        .tracker
        .history("wf-3")
        .into_iter()
        .filter(|s| s.starts_with(workflow_status::COMPLETE))
        .count();
    assert_eq!(complete, 1);
}

#[tokio::test]
async fn test_phase_change_is_recorded() {
    let h = Harness::new();
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-4").await;
    assert_eq!(h.record(&container_id).await.phase, Phase::Pending);

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.phase_updates, 1);
    assert_eq!(h.record(&container_id).await.phase, Phase::Running);

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.phase_updates, 0);
    assert_eq!(report.finalized, 0);
}

#[tokio::test]
async fn test_unknown_native_phase_leaves_record() {
    let h = Harness::new();
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-5").await;
    let job_id = h.record(&container_id).await.job_id;
    h.backend.set_status(&job_id, NativeStatus::phase("Evicting")).await;

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.phase_updates, 0);
    assert_eq!(report.finalized, 0);
    assert_eq!(h.record(&container_id).await.phase, Phase::Pending);
}

#[tokio::test]
async fn test_vanished_job_finalizes_as_failed() {
    let h = Harness::new();
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-6").await;
    let job_id = h.record(&container_id).await.job_id;
    h.backend.forget(&job_id).await;

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.finalized, 1);
    h.drain_finalizing().await;

    let record = h.record(&container_id).await;
    assert_eq!(record.phase, Phase::Failed);
    assert!(record.exit_code.is_none());
    assert_eq!(
        h.tracker.latest("wf-6"),
        Some(workflow_status::failed_with_exit_code(None))
    );
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_backend_backs_off() {
    let h = Harness::with_reconciler_config(ReconcilerConfig {
        poll_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(3600),
        max_backoff: Duration::from_secs(60),
    });
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-7").await;
    h.backend.set_unreachable(true);

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.unreachable, 1);

    // Inside the first backoff window.
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(report.skipped, 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.unreachable, 1);

    // Second failure doubles the wait.
    h.backend.set_unreachable(false);
    tokio::time::advance(Duration::from_secs(10)).await;
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.skipped, 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.unreachable, 0);
    assert_eq!(report.phase_updates, 1);
    assert_eq!(h.record(&container_id).await.phase, Phase::Running);

    // Success clears the backoff.
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.skipped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_finalize_is_not_requeued_every_cycle() {
    let h = Harness::with_reconciler_config(ReconcilerConfig {
        poll_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(3600),
        max_backoff: Duration::from_secs(60),
    });
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-9").await;
    h.exit(&container_id, 0).await;

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.finalized, 1);

    // Finalizing consumer is backed up: the queued request is not duplicated.
    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(10)).await;
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.finalized, 0);
        assert_eq!(report.skipped, 1);
    }
    assert_eq!(h.service.get_queue_depth(FINALIZING).await.unwrap(), 1);

    // Still in flight after the hold: enqueue again in case the first was lost.
    tokio::time::advance(Duration::from_secs(10)).await;
    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.finalized, 1);
    assert_eq!(h.service.get_queue_depth(FINALIZING).await.unwrap(), 2);

    let outcomes = h.drain_finalizing().await;
    assert!(matches!(outcomes[0], FinalizeOutcome::Finalized { .. }));
    assert_eq!(outcomes[1], FinalizeOutcome::AlreadyFinal);

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn test_other_backend_records_are_skipped() {
    let h = Harness::new();
    let request = h.launch_request("p1", 7, "wf-8");
    let record = ContainerRecord::launched(
        "docker-owned".to_string(),
        "docker",
        "abc123".to_string(),
        &request,
        None,
    );
    h.store.create(&record).await.unwrap();

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.checked, 0);
    assert_eq!(h.record("docker-owned").await.phase, Phase::Pending);
}

#[tokio::test]
async fn test_stale_records_are_counted() {
    let h = Harness::new();
    let request = h.launch_request("p1", 7, "wf-9");
    let mut record = ContainerRecord::launched(
        "old".to_string(),
        "docker",
        "abc".to_string(),
        &request,
        None,
    );
    record.phase_changed_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.store.create(&record).await.unwrap();

    let report = h.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.stale, 1);
    assert!(report.max_staleness >= Duration::from_secs(7000));
}

#[tokio::test]
async fn test_reconciler_run_stops_on_shutdown() {
    let h = Harness::with_reconciler_config(ReconcilerConfig {
        poll_interval: Duration::from_millis(20),
        stale_after: Duration::from_secs(3600),
        max_backoff: Duration::from_secs(1),
    });
    h.resolver.add_wrapper(7, "tool", &["run"]);
    let container_id = launch(&h, 7, "wf-10").await;
    h.exit(&container_id, 0).await;

    let reconciler = std::sync::Arc::new(h.reconciler);
    let shutdown = reconciler.shutdown_handle();
    let task = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.run().await }
    });

    let queue = h.queue.clone();
    let mut queued = false;
    for _ in 0..100 {
        use container_service::queue::Transport;
        if queue.depth(FINALIZING).await.unwrap() > 0 {
            queued = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(queued, "reconciler should have enqueued a finalize request");

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("reconciler should stop")
        .unwrap();
}
