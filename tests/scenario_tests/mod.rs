//! Scenario tests against an in-memory cluster
//!
//! # The Story
//!
//! An operator validating a monitoring pipeline points virtwork at a
//! namespace and asks for a few workloads. The tool ensures the namespace,
//! creates the Services multi-role workloads depend on, writes one cloud-init
//! Secret per VM, fans out the VM creates and then waits for every VM to
//! reach `Running`. Later, possibly after a crash, the operator cleans up
//! either one run or everything virtwork ever created there.
//!
//! The cluster here is [`fake_cluster::FakeCluster`]: objects keyed by kind,
//! namespace and name with their labels, an ordered call log, and injectable
//! failures per operation and name. Backoff and polling run under tokio's
//! paused clock so schedules can be asserted exactly.

mod cleanup;
mod fake_cluster;
mod readiness;
mod run;

use std::sync::Arc;
use std::time::Duration;

use virtwork::gateway::ResourceGateway;
use virtwork::orchestrator::{Orchestrator, OrchestratorOptions};
use virtwork::retry::RetryConfig;
use virtwork::workload::{build_plans, Plan, WorkloadOptions, WorkloadRequest};
use virtwork::workload::WorkloadKind;

use fake_cluster::FakeCluster;

/// Namespace every scenario runs in
pub const NAMESPACE: &str = "ns1";

/// Fresh cluster plus a gateway on it with a short retry schedule
pub fn cluster() -> (Arc<FakeCluster>, ResourceGateway) {
    let cluster = Arc::new(FakeCluster::new());
    let gateway = ResourceGateway::new(cluster.clone())
        .with_retry(RetryConfig::with_initial_delay(Duration::from_millis(10)));
    (cluster, gateway)
}

/// Plan `count` VMs of each kind in [`NAMESPACE`]
pub fn plan(kinds: &[WorkloadKind], count: u32, run_id: &str) -> Plan {
    let requests: Vec<_> = kinds
        .iter()
        .map(|kind| WorkloadRequest::new(*kind, count))
        .collect();
    let opts = WorkloadOptions {
        namespace: NAMESPACE.to_string(),
        ..Default::default()
    };
    build_plans(&requests, opts, run_id).unwrap()
}

/// Orchestrator that polls readiness every second for up to a minute
pub fn orchestrator(gateway: ResourceGateway) -> Orchestrator {
    Orchestrator::new(gateway).with_options(OrchestratorOptions {
        ready_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_secs(1),
        ..Default::default()
    })
}
