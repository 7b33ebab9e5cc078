//! Label-scoped teardown

use tokio_util::sync::CancellationToken;

use virtwork::cleanup::CleanupEngine;
use virtwork::error::ApiError;
use virtwork::gateway::ResourceKind;
use virtwork::labels::LabelSet;
use virtwork::workload::WorkloadKind;

use super::fake_cluster::Op;
use super::{cluster, orchestrator, plan, NAMESPACE};

// =============================================================================
// Counting and run discovery
// =============================================================================

#[tokio::test]
async fn deletes_every_managed_vm_and_reports_run_ids() {
    let (cluster, gateway) = cluster();
    for (name, run) in [("vm-a", "r1"), ("vm-b", "r1"), ("vm-c", "r2")] {
        cluster.seed(ResourceKind::VirtualMachine, NAMESPACE, name, &LabelSet::for_run(run));
    }

    let result = CleanupEngine::new(gateway)
        .cleanup_all(NAMESPACE, false, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.vms_deleted, 3);
    assert_eq!(result.services_deleted, 0);
    assert_eq!(result.secrets_deleted, 0);
    assert!(!result.namespace_deleted);
    assert_eq!(result.run_ids, vec!["r1", "r2"]);
    assert!(result.errors.is_empty());
    assert!(cluster.names(ResourceKind::VirtualMachine).is_empty());
}

#[tokio::test]
async fn unmanaged_objects_are_left_alone() {
    let (cluster, gateway) = cluster();
    cluster.seed(ResourceKind::VirtualMachine, NAMESPACE, "ours", &LabelSet::for_run("r1"));
    cluster.seed(
        ResourceKind::VirtualMachine,
        NAMESPACE,
        "theirs",
        &LabelSet::new().with("app", "db"),
    );
    cluster.seed(ResourceKind::VirtualMachine, "other", "elsewhere", &LabelSet::for_run("r1"));

    let result = CleanupEngine::new(gateway)
        .cleanup_all(NAMESPACE, false, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.vms_deleted, 1);
    assert_eq!(cluster.names(ResourceKind::VirtualMachine), vec!["elsewhere", "theirs"]);
}

// =============================================================================
// Run isolation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn run_filter_only_touches_that_run() {
    let (cluster, gateway) = cluster();
    let cancel = CancellationToken::new();
    orchestrator(gateway.clone())
        .execute(plan(&[WorkloadKind::Cpu], 1, "run-a"), NAMESPACE, "run-a", &cancel)
        .await
        .unwrap();
    orchestrator(gateway.clone())
        .execute(plan(&[WorkloadKind::Memory], 1, "run-b"), NAMESPACE, "run-b", &cancel)
        .await
        .unwrap();

    let engine = CleanupEngine::new(gateway);
    let result = engine
        .cleanup_all(NAMESPACE, false, Some("run-a"), &cancel)
        .await
        .unwrap();

    assert_eq!(result.vms_deleted, 1);
    assert_eq!(result.secrets_deleted, 1);
    assert_eq!(result.run_ids, vec!["run-a"]);
    assert_eq!(cluster.names(ResourceKind::VirtualMachine), vec!["virtwork-memory-0"]);
    assert_eq!(cluster.names(ResourceKind::Secret), vec!["virtwork-memory-0-cloudinit"]);

    let result = engine.cleanup_all(NAMESPACE, false, None, &cancel).await.unwrap();
    assert_eq!(result.vms_deleted, 1);
    assert_eq!(result.run_ids, vec!["run-b"]);
    assert!(cluster.names(ResourceKind::VirtualMachine).is_empty());
    assert!(cluster.names(ResourceKind::Secret).is_empty());
    assert_eq!(cluster.names(ResourceKind::Namespace), vec![NAMESPACE]);
}

#[tokio::test(start_paused = true)]
async fn full_teardown_removes_namespace_last() {
    let (cluster, gateway) = cluster();
    let cancel = CancellationToken::new();
    orchestrator(gateway.clone())
        .execute(plan(&[WorkloadKind::Network], 1, "run-a"), NAMESPACE, "run-a", &cancel)
        .await
        .unwrap();

    let result = CleanupEngine::new(gateway)
        .cleanup_all(NAMESPACE, true, None, &cancel)
        .await
        .unwrap();

    assert_eq!(result.vms_deleted, 2);
    assert_eq!(result.services_deleted, 1);
    assert_eq!(result.secrets_deleted, 2);
    assert!(result.namespace_deleted);
    assert!(cluster.names(ResourceKind::Namespace).is_empty());

    let calls = cluster.calls();
    let last = calls.iter().rev().find(|c| c.op == Op::Delete).unwrap();
    assert_eq!(last.kind, ResourceKind::Namespace);
}

// =============================================================================
// Partial failure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn one_stuck_delete_does_not_block_the_rest() {
    let (cluster, gateway) = cluster();
    for name in ["vm-a", "vm-b", "vm-c"] {
        cluster.seed(ResourceKind::VirtualMachine, NAMESPACE, name, &LabelSet::for_run("r1"));
    }
    cluster.fail(Op::Delete, "vm-b", ApiError::unavailable("apiserver overloaded"), None);

    let result = CleanupEngine::new(gateway)
        .cleanup_all(NAMESPACE, false, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.vms_deleted, 2);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("vm-b"), "{:?}", result.errors);
    assert!(result.errors[0].contains("retries exhausted"), "{:?}", result.errors);
    // First attempt plus five retries
    assert_eq!(cluster.calls_of(Op::Delete, ResourceKind::VirtualMachine).iter().filter(|n| *n == "vm-b").count(), 6);
    assert_eq!(cluster.names(ResourceKind::VirtualMachine), vec!["vm-b"]);
}

#[tokio::test]
async fn fatal_delete_error_is_collected_without_retry() {
    let (cluster, gateway) = cluster();
    for name in ["vm-a", "vm-b", "vm-c"] {
        cluster.seed(ResourceKind::VirtualMachine, NAMESPACE, name, &LabelSet::for_run("r1"));
    }
    cluster.fail(Op::Delete, "vm-c", ApiError::forbidden("cannot delete"), None);

    let result = CleanupEngine::new(gateway)
        .cleanup_all(NAMESPACE, false, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.vms_deleted, 2);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("vm-c"));
    let attempts = cluster.calls_of(Op::Delete, ResourceKind::VirtualMachine);
    assert_eq!(attempts.iter().filter(|n| *n == "vm-c").count(), 1);
}

#[tokio::test]
async fn listing_failure_aborts_cleanup() {
    let (cluster, gateway) = cluster();
    cluster.seed(ResourceKind::VirtualMachine, NAMESPACE, "vm-a", &LabelSet::for_run("r1"));
    cluster.fail(Op::List, NAMESPACE, ApiError::forbidden("cannot list"), None);

    let err = CleanupEngine::new(gateway)
        .cleanup_all(NAMESPACE, true, None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("listing"), "{err}");
    assert!(cluster.calls_of(Op::Delete, ResourceKind::VirtualMachine).is_empty());
    assert!(cluster.calls_of(Op::Delete, ResourceKind::Namespace).is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_delete_backoff_fails_the_cleanup() {
    let (cluster, gateway) = cluster();
    for name in ["vm-a", "vm-b", "vm-c"] {
        cluster.seed(ResourceKind::VirtualMachine, NAMESPACE, name, &LabelSet::for_run("r1"));
    }
    cluster.seed(ResourceKind::Namespace, "", NAMESPACE, &LabelSet::managed());
    cluster.fail(Op::Delete, "vm-a", ApiError::unavailable("apiserver restarting"), None);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        trigger.cancel();
    });

    let err = CleanupEngine::new(gateway)
        .cleanup_all(NAMESPACE, true, None, &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "{err}");
    assert_eq!(cluster.calls_of(Op::Delete, ResourceKind::VirtualMachine).iter().filter(|n| *n != "vm-a").count(), 0);
    assert!(cluster.calls_of(Op::Delete, ResourceKind::Namespace).is_empty());
    assert_eq!(cluster.names(ResourceKind::VirtualMachine), vec!["vm-a", "vm-b", "vm-c"]);
}

// =============================================================================
// Idempotent delete
// =============================================================================

#[tokio::test]
async fn deleting_a_missing_object_succeeds() {
    let (cluster, gateway) = cluster();
    let cancel = CancellationToken::new();

    gateway.delete_vm(NAMESPACE, "never-existed", &cancel).await.unwrap();
    gateway.delete_secret(NAMESPACE, "never-existed", &cancel).await.unwrap();
    gateway.delete_service(NAMESPACE, "never-existed", &cancel).await.unwrap();
    gateway.delete_namespace("never-existed", &cancel).await.unwrap();

    assert_eq!(cluster.calls().len(), 4);
}
