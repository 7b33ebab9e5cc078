//! Create path: namespace, services, secrets, VMs, readiness

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use virtwork::audit::{AuditSession, ExecutionRecord, SqliteAuditor};
use virtwork::error::ApiError;
use virtwork::gateway::ResourceKind;
use virtwork::labels::{LABEL_COMPONENT, LABEL_MANAGED_BY, LABEL_ROLE, LABEL_RUN_ID};
use virtwork::workload::{WorkloadKind, IPERF3_SERVICE_NAME};
use virtwork::Error;

use super::fake_cluster::Op;
use super::{cluster, orchestrator, plan, NAMESPACE};

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

// =============================================================================
// Single-role workload
// =============================================================================

#[tokio::test(start_paused = true)]
async fn cpu_workload_creates_two_vms_with_secrets() {
    let (cluster, gateway) = cluster();
    let plan = plan(&[WorkloadKind::Cpu], 2, "run-a");
    assert_eq!(plan.vm_names(), vec!["virtwork-cpu-0", "virtwork-cpu-1"]);

    let summary = orchestrator(gateway)
        .execute(plan, NAMESPACE, "run-a", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cluster.calls_of(Op::Create, ResourceKind::Namespace), vec![NAMESPACE]);
    assert!(cluster.calls_of(Op::Create, ResourceKind::Service).is_empty());
    assert_eq!(
        sorted(cluster.calls_of(Op::Create, ResourceKind::Secret)),
        vec!["virtwork-cpu-0-cloudinit", "virtwork-cpu-1-cloudinit"]
    );
    assert_eq!(
        sorted(cluster.calls_of(Op::Create, ResourceKind::VirtualMachine)),
        vec!["virtwork-cpu-0", "virtwork-cpu-1"]
    );

    let mut polled = cluster.calls_of(Op::GetPhase, ResourceKind::VirtualMachineInstance);
    polled.sort();
    polled.dedup();
    assert_eq!(polled, vec!["virtwork-cpu-0", "virtwork-cpu-1"]);

    assert_eq!(summary.vms_created, 2);
    assert_eq!(summary.secrets_created, 2);
    assert_eq!(summary.services_created, 0);
    assert_eq!(summary.vms_ready, Some(2));
}

#[tokio::test(start_paused = true)]
async fn created_objects_carry_managed_and_run_labels() {
    let (cluster, gateway) = cluster();
    orchestrator(gateway)
        .execute(plan(&[WorkloadKind::Disk], 1, "run-a"), NAMESPACE, "run-a", &CancellationToken::new())
        .await
        .unwrap();

    let vm = cluster
        .labels(ResourceKind::VirtualMachine, NAMESPACE, "virtwork-disk-0")
        .unwrap();
    assert_eq!(vm[LABEL_MANAGED_BY], "virtwork");
    assert_eq!(vm[LABEL_RUN_ID], "run-a");
    assert_eq!(vm[LABEL_COMPONENT], "disk");
    assert!(!vm.contains_key(LABEL_ROLE));

    let secret = cluster
        .labels(ResourceKind::Secret, NAMESPACE, "virtwork-disk-0-cloudinit")
        .unwrap();
    assert_eq!(secret[LABEL_RUN_ID], "run-a");

    // The namespace outlives runs and is only marked as managed
    let ns = cluster.labels(ResourceKind::Namespace, "", NAMESPACE).unwrap();
    assert_eq!(ns[LABEL_MANAGED_BY], "virtwork");
    assert!(!ns.contains_key(LABEL_RUN_ID));
}

// =============================================================================
// Multi-role workload
// =============================================================================

#[tokio::test(start_paused = true)]
async fn network_service_exists_before_either_vm() {
    let (cluster, gateway) = cluster();
    let plan = plan(&[WorkloadKind::Network], 1, "run-b");
    assert_eq!(
        plan.vm_names(),
        vec!["virtwork-network-server-0", "virtwork-network-client-0"]
    );

    let summary = orchestrator(gateway)
        .execute(plan, NAMESPACE, "run-b", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.services_created, 1);

    assert_eq!(
        cluster.calls_of(Op::Create, ResourceKind::Service),
        vec![IPERF3_SERVICE_NAME]
    );
    let service_at = cluster
        .position(Op::Create, ResourceKind::Service, IPERF3_SERVICE_NAME)
        .unwrap();
    for vm in ["virtwork-network-server-0", "virtwork-network-client-0"] {
        let vm_at = cluster.position(Op::Create, ResourceKind::VirtualMachine, vm).unwrap();
        assert!(service_at < vm_at, "service created after {}", vm);
    }

    for (vm, role) in [
        ("virtwork-network-server-0", "server"),
        ("virtwork-network-client-0", "client"),
    ] {
        let labels = cluster.labels(ResourceKind::VirtualMachine, NAMESPACE, vm).unwrap();
        assert_eq!(labels[LABEL_ROLE], role);
        assert_eq!(labels[LABEL_COMPONENT], "network");
    }
}

#[tokio::test(start_paused = true)]
async fn network_count_applies_per_role() {
    let (cluster, gateway) = cluster();
    let summary = orchestrator(gateway)
        .execute(plan(&[WorkloadKind::Network], 3, "run-b"), NAMESPACE, "run-b", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.vms_created, 6);
    let vms = cluster.names(ResourceKind::VirtualMachine);
    assert_eq!(vms.iter().filter(|n| n.contains("-server-")).count(), 3);
    assert_eq!(vms.iter().filter(|n| n.contains("-client-")).count(), 3);
}

// =============================================================================
// Idempotency and failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn running_the_same_plan_twice_is_harmless() {
    let (cluster, gateway) = cluster();
    let kinds = [WorkloadKind::Cpu, WorkloadKind::Network];
    let cancel = CancellationToken::new();

    orchestrator(gateway.clone())
        .execute(plan(&kinds, 1, "run-a"), NAMESPACE, "run-a", &cancel)
        .await
        .unwrap();
    let vms = cluster.names(ResourceKind::VirtualMachine);
    let secrets = cluster.names(ResourceKind::Secret);

    let summary = orchestrator(gateway)
        .execute(plan(&kinds, 1, "run-a"), NAMESPACE, "run-a", &cancel)
        .await
        .unwrap();

    assert_eq!(summary.vms_created, 3);
    assert_eq!(cluster.names(ResourceKind::VirtualMachine), vms);
    assert_eq!(cluster.names(ResourceKind::Secret), secrets);
    assert_eq!(cluster.names(ResourceKind::Service), vec![IPERF3_SERVICE_NAME]);
    assert_eq!(cluster.calls_of(Op::Create, ResourceKind::Namespace).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_vm_create_failures_are_retried() {
    let (cluster, gateway) = cluster();
    cluster.fail(
        Op::Create,
        "virtwork-memory-0",
        ApiError::unavailable("etcd leader changed"),
        Some(2),
    );

    orchestrator(gateway)
        .execute(plan(&[WorkloadKind::Memory], 1, "run-a"), NAMESPACE, "run-a", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        cluster.calls_of(Op::Create, ResourceKind::VirtualMachine),
        vec!["virtwork-memory-0"; 3]
    );
    assert_eq!(cluster.names(ResourceKind::VirtualMachine), vec!["virtwork-memory-0"]);
}

#[tokio::test(start_paused = true)]
async fn forbidden_service_stops_the_run_before_vms() {
    let (cluster, gateway) = cluster();
    cluster.fail(
        Op::Create,
        IPERF3_SERVICE_NAME,
        ApiError::forbidden("services is forbidden"),
        None,
    );

    let err = orchestrator(gateway)
        .execute(plan(&[WorkloadKind::Network], 1, "run-b"), NAMESPACE, "run-b", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Stage { .. }), "{err}");
    assert!(err.to_string().contains(IPERF3_SERVICE_NAME), "{err}");
    assert!(cluster.calls_of(Op::Create, ResourceKind::VirtualMachine).is_empty());
    assert!(cluster.calls_of(Op::Create, ResourceKind::Secret).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stuck_vm_fails_the_run_but_not_its_siblings() {
    let (cluster, gateway) = cluster();
    cluster.set_phase("virtwork-cpu-1", "Scheduling");

    let err = orchestrator(gateway)
        .execute(plan(&[WorkloadKind::Cpu], 3, "run-a"), NAMESPACE, "run-a", &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::ReadinessFailed { failures, total } => {
            assert_eq!(total, 3);
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("virtwork-cpu-1"), "{:?}", failures);
        }
        other => panic!("expected readiness failure, got {other}"),
    }
    // Every VM was still created
    assert_eq!(cluster.names(ResourceKind::VirtualMachine).len(), 3);
}

// =============================================================================
// Audit trail
// =============================================================================

#[tokio::test(start_paused = true)]
async fn run_is_recorded_in_the_audit_database() {
    let (_cluster, gateway) = cluster();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.db");
    let auditor = SqliteAuditor::open(&path).unwrap();
    let record = ExecutionRecord {
        run_id: "run-a".to_string(),
        command: "run".to_string(),
        namespace: NAMESPACE.to_string(),
        ..Default::default()
    };
    let audit = AuditSession::start(Arc::new(auditor), &record);

    orchestrator(gateway)
        .with_audit(audit)
        .execute(plan(&[WorkloadKind::Network], 1, "run-a"), NAMESPACE, "run-a", &CancellationToken::new())
        .await
        .unwrap();

    let db = rusqlite::Connection::open(&path).unwrap();
    let status: String = db
        .query_row("SELECT status FROM audit_log WHERE run_id = 'run-a'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(status, "completed");

    let ready: i64 = db
        .query_row("SELECT COUNT(*) FROM vm_details WHERE status = 'ready'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(ready, 2);

    let services: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM resource_details WHERE resource_type = 'Service'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(services, 1);
}
