//! Audit trail of runs and cleanups
//!
//! Every `run` and `cleanup` invocation is recorded as an execution keyed by
//! its run identifier, together with the workloads, VMs, auxiliary resources
//! and lifecycle events it produced. Cleanups record which runs they touched,
//! using the run identifiers the Cleanup Engine collected from labels.
//!
//! Auditing never decides the outcome of an operation: [`AuditSession`] logs
//! store failures with `warn!` and carries on.

mod sqlite;

pub use sqlite::SqliteAuditor;

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::Result;

/// Outcome of an execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Still running (or crashed before completing)
    InProgress,
    /// Finished without error
    Completed,
    /// Finished with an error
    Failed,
}

impl ExecutionStatus {
    /// Stored value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle events worth keeping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Execution started
    RunStarted,
    /// Plan built
    PlanBuilt,
    /// Namespace ensured
    NamespaceEnsured,
    /// Service created
    ServiceCreated,
    /// Cloud-init secret created
    SecretCreated,
    /// VM created
    VmCreated,
    /// VM create failed
    VmFailed,
    /// VM reached Running
    VmReady,
    /// VM timed out waiting for Running
    VmTimeout,
    /// Run finished
    RunCompleted,
    /// Run failed
    RunFailed,
    /// Cleanup started
    CleanupStarted,
    /// Cleanup finished
    CleanupCompleted,
    /// A resource could not be deleted
    CleanupError,
}

impl EventType {
    /// Stored value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::PlanBuilt => "plan_built",
            Self::NamespaceEnsured => "namespace_ensured",
            Self::ServiceCreated => "service_created",
            Self::SecretCreated => "secret_created",
            Self::VmCreated => "vm_created",
            Self::VmFailed => "vm_failed",
            Self::VmReady => "vm_ready",
            Self::VmTimeout => "vm_timeout",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::CleanupStarted => "cleanup_started",
            Self::CleanupCompleted => "cleanup_completed",
            Self::CleanupError => "cleanup_error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Run identifier minted by the command
    pub run_id: String,
    /// `run` or `cleanup`
    pub command: String,
    /// Target namespace
    pub namespace: String,
    /// Explicit kubeconfig, if any
    pub kubeconfig_path: Option<String>,
    /// Container disk image
    pub container_disk_image: Option<String>,
    /// Default CPU cores
    pub cpu_cores: Option<u32>,
    /// Default memory
    pub memory: Option<String>,
    /// Data disk size
    pub data_disk_size: Option<String>,
    /// Comma-separated workload kinds
    pub workloads: Option<String>,
    /// Total VMs planned
    pub total_vm_count: Option<usize>,
    /// Number of workloads planned
    pub total_workload_count: Option<usize>,
    /// Dry run requested
    pub dry_run: bool,
    /// SSH password or keys configured
    pub ssh_auth_configured: bool,
    /// `all` or `run-id` for cleanups
    pub cleanup_mode: Option<String>,
    /// Readiness wait enabled
    pub wait_for_ready: bool,
    /// Readiness timeout
    pub ready_timeout_seconds: Option<u64>,
}

/// One planned workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRecord {
    /// Workload kind
    pub workload_type: String,
    /// VMs planned for it
    pub vm_count: usize,
    /// CPU cores per VM
    pub cpu_cores: u32,
    /// Memory per VM
    pub memory: String,
    /// Data disk size, for disk-backed kinds
    pub data_disk_size: Option<String>,
    /// Whether a Service was required
    pub requires_service: bool,
}

/// One planned VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmRecord {
    /// VM name
    pub vm_name: String,
    /// Namespace
    pub namespace: String,
    /// Workload kind
    pub component: String,
    /// Role, for server/client kinds
    pub role: Option<String>,
    /// CPU cores
    pub cpu_cores: u32,
    /// Memory
    pub memory: String,
    /// Container disk image
    pub container_disk_image: String,
    /// Data disk size, when a data volume is attached
    pub data_disk_size: Option<String>,
}

/// An auxiliary resource (Service, Secret)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Kind
    pub resource_type: String,
    /// Name
    pub resource_name: String,
    /// Namespace
    pub namespace: String,
}

/// A lifecycle event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    /// Event type
    pub event_type: EventType,
    /// Human readable message
    pub message: String,
    /// Error text for failure events
    pub error_detail: Option<String>,
    /// Related VM row
    pub vm_id: Option<i64>,
    /// Related workload row
    pub workload_id: Option<i64>,
}

impl EventRecord {
    /// Event with just a message
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            error_detail: None,
            vm_id: None,
            workload_id: None,
        }
    }

    /// Attach error text
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_detail = Some(error.into());
        self
    }

    /// Attach the related VM row
    pub fn for_vm(mut self, vm_id: Option<i64>) -> Self {
        self.vm_id = vm_id;
        self
    }
}

/// Counters recorded at the end of a cleanup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    /// VMs deleted
    pub vms_deleted: usize,
    /// Services deleted
    pub services_deleted: usize,
    /// Secrets deleted
    pub secrets_deleted: usize,
    /// Namespace deleted
    pub namespace_deleted: bool,
}

/// Audit store
pub trait Auditor: Send + Sync {
    /// Record an execution and return its row id
    fn start_execution(&self, record: &ExecutionRecord) -> Result<i64>;

    /// Mark an execution finished
    fn complete_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        error_summary: Option<&str>,
    ) -> Result<()>;

    /// Store the run identifiers a cleanup touched
    fn link_cleanup_to_runs(&self, id: i64, run_ids: &[String]) -> Result<()>;

    /// Store cleanup counters
    fn record_cleanup_counts(&self, id: i64, counts: &CleanupCounts) -> Result<()>;

    /// Record a workload and return its row id
    fn record_workload(&self, execution_id: i64, record: &WorkloadRecord) -> Result<i64>;

    /// Update a workload's status
    fn update_workload_status(&self, id: i64, status: &str) -> Result<()>;

    /// Record a VM and return its row id
    fn record_vm(
        &self,
        execution_id: i64,
        workload_id: Option<i64>,
        record: &VmRecord,
    ) -> Result<i64>;

    /// Update a VM's phase and status
    fn update_vm_status(&self, id: i64, phase: &str, status: &str) -> Result<()>;

    /// Record an auxiliary resource and return its row id
    fn record_resource(&self, execution_id: i64, record: &ResourceRecord) -> Result<i64>;

    /// Record an event
    fn record_event(&self, execution_id: i64, event: &EventRecord) -> Result<()>;
}

/// Auditor that records nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuditor;

impl Auditor for NoopAuditor {
    fn start_execution(&self, _: &ExecutionRecord) -> Result<i64> {
        Ok(0)
    }
    fn complete_execution(&self, _: i64, _: ExecutionStatus, _: Option<&str>) -> Result<()> {
        Ok(())
    }
    fn link_cleanup_to_runs(&self, _: i64, _: &[String]) -> Result<()> {
        Ok(())
    }
    fn record_cleanup_counts(&self, _: i64, _: &CleanupCounts) -> Result<()> {
        Ok(())
    }
    fn record_workload(&self, _: i64, _: &WorkloadRecord) -> Result<i64> {
        Ok(0)
    }
    fn update_workload_status(&self, _: i64, _: &str) -> Result<()> {
        Ok(())
    }
    fn record_vm(&self, _: i64, _: Option<i64>, _: &VmRecord) -> Result<i64> {
        Ok(0)
    }
    fn update_vm_status(&self, _: i64, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
    fn record_resource(&self, _: i64, _: &ResourceRecord) -> Result<i64> {
        Ok(0)
    }
    fn record_event(&self, _: i64, _: &EventRecord) -> Result<()> {
        Ok(())
    }
}

/// One execution's view of the audit store.
///
/// Every method is infallible: store errors are logged and dropped, and once
/// the execution row could not be written the rest of the session is a no-op.
#[derive(Clone)]
pub struct AuditSession {
    auditor: Arc<dyn Auditor>,
    execution_id: Option<i64>,
}

impl AuditSession {
    /// Record the execution start
    pub fn start(auditor: Arc<dyn Auditor>, record: &ExecutionRecord) -> Self {
        let execution_id = match auditor.start_execution(record) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(run_id = %record.run_id, error = %e, "Failed to record execution start");
                None
            }
        };
        Self {
            auditor,
            execution_id,
        }
    }

    /// Session that records nothing
    pub fn disabled() -> Self {
        Self {
            auditor: Arc::new(NoopAuditor),
            execution_id: None,
        }
    }

    /// Row id of the execution, if it was recorded
    pub fn execution_id(&self) -> Option<i64> {
        self.execution_id
    }

    fn with_execution<T>(&self, what: &str, f: impl FnOnce(i64) -> Result<T>) -> Option<T> {
        let id = self.execution_id?;
        match f(id) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(execution_id = id, error = %e, "Failed to record {}", what);
                None
            }
        }
    }

    /// Record a workload
    pub fn workload(&self, record: &WorkloadRecord) -> Option<i64> {
        self.with_execution("workload", |id| self.auditor.record_workload(id, record))
    }

    /// Update a workload's status
    pub fn workload_status(&self, workload_id: Option<i64>, status: &str) {
        if let Some(wid) = workload_id {
            self.with_execution("workload status", |_| {
                self.auditor.update_workload_status(wid, status)
            });
        }
    }

    /// Record a VM
    pub fn vm(&self, workload_id: Option<i64>, record: &VmRecord) -> Option<i64> {
        self.with_execution("VM", |id| self.auditor.record_vm(id, workload_id, record))
    }

    /// Update a VM's phase and status
    pub fn vm_status(&self, vm_id: Option<i64>, phase: &str, status: &str) {
        if let Some(vid) = vm_id {
            self.with_execution("VM status", |_| {
                self.auditor.update_vm_status(vid, phase, status)
            });
        }
    }

    /// Record an auxiliary resource
    pub fn resource(&self, record: &ResourceRecord) -> Option<i64> {
        self.with_execution("resource", |id| self.auditor.record_resource(id, record))
    }

    /// Record an event
    pub fn event(&self, event: EventRecord) {
        self.with_execution("event", |id| self.auditor.record_event(id, &event));
    }

    /// Store cleanup counters and the run identifiers a cleanup touched
    pub fn cleanup(&self, counts: &CleanupCounts, run_ids: &[String]) {
        self.with_execution("cleanup counts", |id| {
            self.auditor.record_cleanup_counts(id, counts)
        });
        if !run_ids.is_empty() {
            self.with_execution("linked runs", |id| {
                self.auditor.link_cleanup_to_runs(id, run_ids)
            });
        }
    }

    /// Mark the execution finished
    pub fn complete(&self, status: ExecutionStatus, error_summary: Option<&str>) {
        self.with_execution("execution completion", |id| {
            self.auditor.complete_execution(id, status, error_summary)
        });
    }
}
