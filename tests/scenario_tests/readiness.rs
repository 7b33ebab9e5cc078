//! Readiness polling and retry schedules under paused time

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use virtwork::error::ApiError;
use virtwork::gateway::{ResourceGateway, ResourceKind};
use virtwork::labels::LabelSet;
use virtwork::readiness::{wait_ready, wait_ready_all};
use virtwork::retry::RetryConfig;
use virtwork::vm::build_vm;
use virtwork::workload::WorkloadKind;
use virtwork::Error;

use super::fake_cluster::Op;
use super::{cluster, plan, NAMESPACE};

fn seed_vms(cluster: &super::fake_cluster::FakeCluster, names: &[&str]) {
    for name in names {
        cluster.seed(ResourceKind::VirtualMachine, NAMESPACE, name, &LabelSet::for_run("r1"));
    }
}

// =============================================================================
// Readiness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn one_stuck_vm_does_not_hold_back_the_others() {
    let (cluster, gateway) = cluster();
    seed_vms(&cluster, &["vm-a", "vm-b", "vm-c"]);
    cluster.set_phase("vm-b", "Scheduling");

    let names: Vec<String> = ["vm-a", "vm-b", "vm-c"].map(String::from).to_vec();
    let timeout = Duration::from_secs(60);
    let start = Instant::now();
    let results = wait_ready_all(
        &gateway,
        &names,
        NAMESPACE,
        timeout,
        Duration::from_secs(5),
        &CancellationToken::new(),
    )
    .await;

    assert!(start.elapsed() <= timeout);
    assert_eq!(results.len(), 3);
    assert!(results["vm-a"].is_ok());
    assert!(results["vm-c"].is_ok());
    assert!(matches!(results["vm-b"], Err(Error::Timeout { .. })));
}

#[tokio::test(start_paused = true)]
async fn vm_without_instance_yet_keeps_polling() {
    let (cluster, gateway) = cluster();
    let start = Instant::now();

    let waiter = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            wait_ready(
                &gateway,
                "late",
                NAMESPACE,
                Duration::from_secs(120),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
        })
    };

    // The instance shows up after the third poll
    tokio::time::sleep(Duration::from_secs(25)).await;
    seed_vms(&cluster, &["late"]);

    waiter.await.unwrap().unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert_eq!(
        cluster.calls_of(Op::GetPhase, ResourceKind::VirtualMachineInstance).len(),
        4
    );
}

#[tokio::test(start_paused = true)]
async fn failing_phase_read_ends_only_that_vm() {
    let (cluster, gateway) = cluster();
    seed_vms(&cluster, &["vm-a", "vm-b"]);
    cluster.fail(Op::GetPhase, "vm-a", ApiError::forbidden("no access"), None);

    let names = vec!["vm-a".to_string(), "vm-b".to_string()];
    let results = wait_ready_all(
        &gateway,
        &names,
        NAMESPACE,
        Duration::from_secs(60),
        Duration::from_secs(5),
        &CancellationToken::new(),
    )
    .await;

    assert!(results["vm-a"].as_ref().unwrap_err().to_string().contains("no access"));
    assert!(results["vm-b"].is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancellation_ends_every_wait() {
    let (cluster, gateway) = cluster();
    seed_vms(&cluster, &["vm-a", "vm-b"]);
    cluster.set_phase("vm-a", "Pending");
    cluster.set_phase("vm-b", "Pending");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        trigger.cancel();
    });

    let names = vec!["vm-a".to_string(), "vm-b".to_string()];
    let start = Instant::now();
    let results = wait_ready_all(
        &gateway,
        &names,
        NAMESPACE,
        Duration::from_secs(600),
        Duration::from_secs(5),
        &cancel,
    )
    .await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(results.values().all(|r| r.as_ref().unwrap_err().is_cancelled()));
}

// =============================================================================
// Retry schedule
// =============================================================================

#[tokio::test(start_paused = true)]
async fn always_transient_create_is_attempted_max_retries_plus_one_times() {
    let (cluster, gateway) = cluster();
    let gateway: ResourceGateway = gateway.with_retry(RetryConfig::default());
    let plan = plan(&[WorkloadKind::Cpu], 1, "r1");
    let vm = build_vm(&plan.vms[0]);
    cluster.fail(
        Op::Create,
        "virtwork-cpu-0",
        ApiError::unavailable("service unavailable"),
        None,
    );

    let start = Instant::now();
    let err = gateway
        .create_vm(&vm, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 6),
        other => panic!("expected retries exhausted, got {other}"),
    }
    assert_eq!(
        cluster.calls_of(Op::Create, ResourceKind::VirtualMachine).len(),
        6
    );
    // 1 + 2 + 4 + 8 + 16 seconds of backoff
    assert_eq!(start.elapsed(), Duration::from_secs(31));
    assert!(cluster.names(ResourceKind::VirtualMachine).is_empty());
}

#[tokio::test(start_paused = true)]
async fn creating_an_existing_vm_is_a_no_op() {
    let (cluster, gateway) = cluster();
    let plan = plan(&[WorkloadKind::Cpu], 1, "r1");
    let vm = build_vm(&plan.vms[0]);
    let cancel = CancellationToken::new();

    gateway.create_vm(&vm, &cancel).await.unwrap();
    let labels = cluster.labels(ResourceKind::VirtualMachine, NAMESPACE, "virtwork-cpu-0");

    gateway.create_vm(&vm, &cancel).await.unwrap();
    assert_eq!(
        cluster.labels(ResourceKind::VirtualMachine, NAMESPACE, "virtwork-cpu-0"),
        labels
    );
    // AlreadyExists is not retried
    assert_eq!(cluster.calls_of(Op::Create, ResourceKind::VirtualMachine).len(), 2);
}
