//! virtwork - KubeVirt VMs running synthetic stress workloads
//!
//! virtwork provisions virtual machines on a Kubernetes cluster with KubeVirt
//! installed and configures each one, through cloud-init, to run a continuous
//! CPU, memory, database, network, or disk I/O workload. It exists to produce
//! realistic telemetry for validating monitoring pipelines.
//!
//! The tool is one-shot: it creates resources and exits. Workload supervision
//! is left to systemd inside each VM.
//!
//! # Modules
//!
//! - [`labels`] - Label scheme every managed resource carries
//! - [`gateway`] - Cluster client seam and the idempotent, retrying Resource Gateway
//! - [`vm`] - KubeVirt VirtualMachine types and materialization
//! - [`workload`] - Workload kinds, cloud-init payloads, and the Plan Builder
//! - [`readiness`] - VM readiness polling
//! - [`orchestrator`] - The create path: namespace, services, secrets, VMs, readiness
//! - [`cleanup`] - Label-scoped teardown
//! - [`audit`] - Audit trail of runs and cleanups
//! - [`config`] - Configuration resolution (flags, env, file, defaults)
//! - [`commands`] - CLI commands
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod audit;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod labels;
pub mod orchestrator;
pub mod readiness;
pub mod retry;
pub mod telemetry;
pub mod vm;
pub mod workload;

pub use commands::Cli;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Tool name, used as the managed-by label value and the resource name prefix
pub const TOOL_NAME: &str = "virtwork";

/// Default namespace for VMs
pub const DEFAULT_NAMESPACE: &str = "virtwork";

/// Default container disk image for VM root disks
pub const DEFAULT_CONTAINER_DISK_IMAGE: &str = "quay.io/containerdisks/fedora:41";

/// Default CPU cores per VM
pub const DEFAULT_CPU_CORES: u32 = 2;

/// Default memory request per VM
pub const DEFAULT_MEMORY: &str = "2Gi";

/// Default data disk size for disk-backed workloads
pub const DEFAULT_DATA_DISK_SIZE: &str = "10Gi";

/// Default SSH user created inside every VM
pub const DEFAULT_SSH_USER: &str = "virtwork";

/// Default audit database path
pub const DEFAULT_AUDIT_DB_PATH: &str = "virtwork-audit.db";

/// Default readiness timeout per VM
pub const DEFAULT_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// Default interval between VMI phase reads
pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);
