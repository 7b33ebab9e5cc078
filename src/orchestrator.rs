//! Run Orchestrator: the create path
//!
//! A run walks a fixed sequence of stages:
//!
//! 1. ensure the namespace
//! 2. create Services, one at a time, before any VM exists
//! 3. create one cloud-init Secret per VM
//! 4. create VMs concurrently (bounded fan-out)
//! 5. optionally wait for every VM to reach `Running`
//!
//! Stages 1-4 are fail-fast and report the stage and resource that failed.
//! Readiness failures are collected per VM and reported together. Nothing is
//! rolled back; `virtwork cleanup` removes what a failed run left behind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{
    AuditSession, EventRecord, EventType, ExecutionStatus, ResourceRecord, VmRecord,
    WorkloadRecord,
};
use crate::error::RunStage;
use crate::gateway::ResourceGateway;
use crate::labels::LabelSet;
use crate::readiness::wait_ready_all;
use crate::vm::{build_vm, to_yaml};
use crate::workload::{Plan, Topology, VmPlan, WorkloadKind};
use crate::{Error, Result};

/// Default number of VM creates in flight at once
pub const DEFAULT_CREATE_CONCURRENCY: usize = 8;

/// Render every planned VM as a YAML document, without touching a cluster
pub fn render_dry_run(plan: &Plan) -> Result<String> {
    let mut out = String::new();
    for vm in &plan.vms {
        out.push_str("---\n");
        out.push_str(&to_yaml(&build_vm(vm))?);
    }
    Ok(out)
}

/// Tunables for a run
#[derive(Clone, Debug)]
pub struct OrchestratorOptions {
    /// Upper bound on concurrent VM creates
    pub create_concurrency: usize,
    /// Wait for every VM to reach `Running`
    pub wait_for_ready: bool,
    /// Per-VM readiness deadline
    pub ready_timeout: Duration,
    /// Interval between VMI phase reads
    pub poll_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            create_concurrency: DEFAULT_CREATE_CONCURRENCY,
            wait_for_ready: true,
            ready_timeout: crate::DEFAULT_READY_TIMEOUT,
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What a successful run created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    /// Run identifier stamped on every resource
    pub run_id: String,
    /// Target namespace
    pub namespace: String,
    /// VMs created (or found already present)
    pub vms_created: usize,
    /// Services created
    pub services_created: usize,
    /// Cloud-init Secrets created
    pub secrets_created: usize,
    /// VMs confirmed running, `None` when readiness was not awaited
    pub vms_ready: Option<usize>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<12}{}", "RUN ID", self.run_id)?;
        writeln!(f, "{:<12}{}", "NAMESPACE", self.namespace)?;
        writeln!(f, "{:<12}{}", "VMS", self.vms_created)?;
        writeln!(f, "{:<12}{}", "SERVICES", self.services_created)?;
        writeln!(f, "{:<12}{}", "SECRETS", self.secrets_created)?;
        match self.vms_ready {
            Some(ready) => write!(f, "{:<12}{}/{}", "READY", ready, self.vms_created),
            None => write!(f, "{:<12}not awaited", "READY"),
        }
    }
}

/// Audit row ids for a plan
struct PlanAudit {
    workloads: BTreeMap<WorkloadKind, Option<i64>>,
    vms: Vec<Option<i64>>,
}

/// Drives the create path against a [`ResourceGateway`]
pub struct Orchestrator {
    gateway: ResourceGateway,
    audit: AuditSession,
    options: OrchestratorOptions,
}

impl Orchestrator {
    /// Orchestrator with default options and no audit trail
    pub fn new(gateway: ResourceGateway) -> Self {
        Self {
            gateway,
            audit: AuditSession::disabled(),
            options: OrchestratorOptions::default(),
        }
    }

    /// Record the run in `audit`
    pub fn with_audit(mut self, audit: AuditSession) -> Self {
        self.audit = audit;
        self
    }

    /// Override the run options
    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Execute a plan and mark the audited execution finished.
    pub async fn execute(
        &self,
        plan: Plan,
        namespace: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let result = self.run_stages(plan, namespace, run_id, cancel).await;

        match &result {
            Ok(summary) => {
                info!(run_id = %run_id, namespace = %namespace, vms = summary.vms_created, "Run complete");
                self.audit.event(EventRecord::new(
                    EventType::RunCompleted,
                    format!("run {} completed", run_id),
                ));
                self.audit.complete(ExecutionStatus::Completed, None);
            }
            Err(e) => {
                let detail = e.to_string();
                self.audit.event(
                    EventRecord::new(EventType::RunFailed, format!("run {} failed", run_id))
                        .with_error(detail.clone()),
                );
                self.audit.complete(ExecutionStatus::Failed, Some(&detail));
            }
        }

        result
    }

    async fn run_stages(
        &self,
        mut plan: Plan,
        namespace: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let ids = self.record_plan(&plan);
        let mut summary = RunSummary {
            run_id: run_id.to_string(),
            namespace: namespace.to_string(),
            vms_created: 0,
            services_created: 0,
            secrets_created: 0,
            vms_ready: None,
        };

        ensure_not_cancelled(cancel, "ensuring namespace")?;
        self.gateway
            .ensure_namespace(namespace, &LabelSet::managed())
            .await
            .map_err(|e| e.at_stage(RunStage::EnsureNamespace, namespace))?;
        self.audit.event(EventRecord::new(
            EventType::NamespaceEnsured,
            format!("namespace {} ensured", namespace),
        ));

        // Clients resolve the server through the Service DNS name at boot
        for service in &plan.services {
            ensure_not_cancelled(cancel, "creating services")?;
            self.gateway
                .create_service(&service.to_service())
                .await
                .map_err(|e| e.at_stage(RunStage::CreateService, &service.name))?;
            summary.services_created += 1;
            self.audit.resource(&ResourceRecord {
                resource_type: "Service".to_string(),
                resource_name: service.name.clone(),
                namespace: service.namespace.clone(),
            });
            self.audit.event(EventRecord::new(
                EventType::ServiceCreated,
                format!("service {} created", service.name),
            ));
        }

        for (vm, vm_id) in plan.vms.iter_mut().zip(&ids.vms) {
            ensure_not_cancelled(cancel, "creating cloud-init secrets")?;
            let secret_name = vm.cloud_init_secret_name();
            self.gateway
                .create_secret(&vm.cloud_init_secret())
                .await
                .map_err(|e| e.at_stage(RunStage::CreateSecret, &secret_name))?;
            summary.secrets_created += 1;
            self.audit.resource(&ResourceRecord {
                resource_type: "Secret".to_string(),
                resource_name: secret_name.clone(),
                namespace: vm.namespace.clone(),
            });
            self.audit.event(
                EventRecord::new(
                    EventType::SecretCreated,
                    format!("secret {} created", secret_name),
                )
                .for_vm(*vm_id),
            );
            vm.secret_name = Some(secret_name);
        }

        summary.vms_created = self.create_vms(&plan.vms, &ids, cancel).await?;

        if !self.options.wait_for_ready {
            info!(vms = summary.vms_created, "Not waiting for VMs to become ready");
            return Ok(summary);
        }

        let names = plan.vm_names();
        info!(
            vms = names.len(),
            timeout_secs = self.options.ready_timeout.as_secs(),
            "Waiting for VMs to become ready"
        );
        let results = wait_ready_all(
            &self.gateway,
            &names,
            namespace,
            self.options.ready_timeout,
            self.options.poll_interval,
            cancel,
        )
        .await;

        // An interrupt is not a readiness failure
        if cancel.is_cancelled() {
            return Err(Error::cancelled("waiting for VMs to become ready"));
        }

        let mut failures = Vec::new();
        for (vm, vm_id) in plan.vms.iter().zip(&ids.vms) {
            match results.get(&vm.name) {
                Some(Ok(())) => {
                    self.audit.vm_status(*vm_id, crate::vm::VMI_PHASE_RUNNING, "ready");
                    self.audit.event(
                        EventRecord::new(EventType::VmReady, format!("VM {} is ready", vm.name))
                            .for_vm(*vm_id),
                    );
                }
                Some(Err(e)) => {
                    let (event, status) = match e {
                        Error::Timeout { .. } => (EventType::VmTimeout, "timeout"),
                        _ => (EventType::VmFailed, "failed"),
                    };
                    self.audit.vm_status(*vm_id, "", status);
                    self.audit.event(
                        EventRecord::new(event, format!("VM {} did not become ready", vm.name))
                            .with_error(e.to_string())
                            .for_vm(*vm_id),
                    );
                    failures.push(format!("{}: {}", vm.name, e));
                }
                None => {}
            }
        }

        if !failures.is_empty() {
            return Err(Error::ReadinessFailed {
                failures,
                total: names.len(),
            });
        }

        summary.vms_ready = Some(names.len());
        Ok(summary)
    }

    /// Create every VM with at most `create_concurrency` creates in flight.
    ///
    /// After the first failure no new create starts; creates already in
    /// flight finish and are kept. The error reported is the first failure in
    /// plan order.
    async fn create_vms(
        &self,
        vms: &[VmPlan],
        ids: &PlanAudit,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let failed = AtomicBool::new(false);

        let mut outcomes: Vec<(usize, Option<Result<()>>)> = stream::iter(vms.iter().enumerate())
            .map(|(i, plan)| {
                let failed = &failed;
                async move {
                    if failed.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        return (i, None);
                    }
                    let result = self.gateway.create_vm(&build_vm(plan), cancel).await;
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    (i, Some(result))
                }
            })
            .buffer_unordered(self.options.create_concurrency.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|(i, _)| *i);

        let mut created = 0;
        let mut first_error = None;
        for (i, outcome) in outcomes {
            let plan = &vms[i];
            let vm_id = ids.vms.get(i).copied().flatten();
            match outcome {
                Some(Ok(())) => {
                    created += 1;
                    self.audit.vm_status(vm_id, "", "created");
                    self.audit.event(
                        EventRecord::new(EventType::VmCreated, format!("VM {} created", plan.name))
                            .for_vm(vm_id),
                    );
                }
                Some(Err(e)) => {
                    warn!(vm = %plan.name, error = %e, "VM create failed");
                    self.audit.vm_status(vm_id, "", "failed");
                    self.audit.event(
                        EventRecord::new(EventType::VmFailed, format!("VM {} create failed", plan.name))
                            .with_error(e.to_string())
                            .for_vm(vm_id),
                    );
                    if first_error.is_none() {
                        first_error = Some(e.at_stage(RunStage::CreateVm, &plan.name));
                    }
                }
                None => debug!(vm = %plan.name, "Skipped VM create"),
            }
        }

        let status = if first_error.is_some() { "failed" } else { "created" };
        for workload_id in ids.workloads.values() {
            self.audit.workload_status(*workload_id, status);
        }

        match first_error {
            Some(e) if cancel.is_cancelled() && e.is_cancelled() => {
                Err(Error::cancelled("creating VMs"))
            }
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(Error::cancelled("creating VMs")),
            None => Ok(created),
        }
    }

    fn record_plan(&self, plan: &Plan) -> PlanAudit {
        let mut workloads = BTreeMap::new();
        for vm in &plan.vms {
            workloads.entry(vm.component).or_insert_with(|| {
                let vm_count = plan.vms.iter().filter(|v| v.component == vm.component).count();
                self.audit.workload(&WorkloadRecord {
                    workload_type: vm.component.to_string(),
                    vm_count,
                    cpu_cores: vm.shape.cpu_cores,
                    memory: vm.shape.memory.clone(),
                    data_disk_size: data_disk_size(vm),
                    requires_service: vm.component.topology() == Topology::ServerClient,
                })
            });
        }

        let vms = plan
            .vms
            .iter()
            .map(|vm| {
                let workload_id = workloads.get(&vm.component).copied().flatten();
                self.audit.vm(
                    workload_id,
                    &VmRecord {
                        vm_name: vm.name.clone(),
                        namespace: vm.namespace.clone(),
                        component: vm.component.to_string(),
                        role: vm.role.map(|r| r.to_string()),
                        cpu_cores: vm.shape.cpu_cores,
                        memory: vm.shape.memory.clone(),
                        container_disk_image: vm.image.clone(),
                        data_disk_size: data_disk_size(vm),
                    },
                )
            })
            .collect();

        PlanAudit { workloads, vms }
    }
}

fn data_disk_size(vm: &VmPlan) -> Option<String> {
    vm.data_volume_templates.first().map(|t| t.size.clone())
}

fn ensure_not_cancelled(cancel: &CancellationToken, operation: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled(operation));
    }
    Ok(())
}
