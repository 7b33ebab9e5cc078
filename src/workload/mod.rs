//! Workload catalogue and the Plan Builder
//!
//! The set of workloads is closed, so each one is a [`WorkloadKind`] variant
//! described by data: whether it runs as one role or as a server/client pair,
//! whether it needs a data disk, and what cloud-init payload each role boots
//! with. [`plan::build_plans`] expands requested kinds into concrete
//! [`VmPlan`]s and the [`ServicePlan`]s they depend on.

mod cloudinit;
mod cpu;
mod database;
mod disk;
mod memory;
mod network;
pub mod plan;

pub use cloudinit::{CloudConfig, SshCredentials, WriteFile};
pub use network::{IPERF3_PORT, IPERF3_SERVICE_NAME};
pub use plan::{build_plans, Plan, ServicePlan, VmPlan, VmShape, WorkloadRequest};

use std::fmt;
use std::str::FromStr;

use crate::labels::LabelSet;
use crate::{Error, Result};

/// A workload a VM can run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    /// stress-ng CPU stressors on every core
    Cpu,
    /// PostgreSQL with a looping pgbench run
    Database,
    /// fio random and sequential profiles on a data disk
    Disk,
    /// stress-ng VM stressor using most of guest memory
    Memory,
    /// iperf3 server/client pair behind a Service
    Network,
}

/// How many cooperating roles a workload needs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    /// Every VM runs the same payload
    Single,
    /// Server and client VMs; clients reach servers through a Service
    ServerClient,
}

/// Role of a VM in a [`Topology::ServerClient`] workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Listens for clients
    Server,
    /// Connects to the server Service
    Client,
}

impl Role {
    /// Both roles, servers first
    pub const ALL: [Role; 2] = [Role::Server, Role::Client];

    /// Label value and name segment
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkloadKind {
    /// Every kind, sorted by name
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::Cpu,
        WorkloadKind::Database,
        WorkloadKind::Disk,
        WorkloadKind::Memory,
        WorkloadKind::Network,
    ];

    /// Name used on the command line, in labels and in VM names
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Cpu => "cpu",
            WorkloadKind::Database => "database",
            WorkloadKind::Disk => "disk",
            WorkloadKind::Memory => "memory",
            WorkloadKind::Network => "network",
        }
    }

    /// Comma-separated list of every valid name
    pub fn available() -> String {
        Self::ALL
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Role layout
    pub fn topology(self) -> Topology {
        match self {
            WorkloadKind::Network => Topology::ServerClient,
            _ => Topology::Single,
        }
    }

    /// Whether each VM gets a blank data volume
    pub fn needs_data_disk(self) -> bool {
        matches!(self, WorkloadKind::Database | WorkloadKind::Disk)
    }

    /// Service the kind's VMs depend on, if any
    pub fn service_plan(self, namespace: &str, labels: LabelSet) -> Option<ServicePlan> {
        match self.topology() {
            Topology::ServerClient => Some(network::service_plan(namespace, labels)),
            Topology::Single => None,
        }
    }

    /// Cloud-init payload for a VM of this kind.
    ///
    /// `role` only matters for server/client kinds, where `None` means server.
    pub fn cloud_config(self, role: Option<Role>, namespace: &str) -> CloudConfig {
        match self {
            WorkloadKind::Cpu => cpu::cloud_config(),
            WorkloadKind::Database => database::cloud_config(),
            WorkloadKind::Disk => disk::cloud_config(),
            WorkloadKind::Memory => memory::cloud_config(),
            WorkloadKind::Network => match role.unwrap_or(Role::Server) {
                Role::Server => network::server_cloud_config(),
                Role::Client => network::client_cloud_config(namespace),
            },
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownWorkload {
                name: s.to_string(),
                available: Self::available(),
            })
    }
}

/// Parse a comma-separated workload list, ignoring blanks and duplicates
pub fn parse_kinds(list: &str) -> Result<Vec<WorkloadKind>> {
    let mut kinds = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind: WorkloadKind = name.parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err(Error::config(format!(
            "no workloads selected; available: {}",
            WorkloadKind::available()
        )));
    }
    Ok(kinds)
}

/// Cross-cutting options every workload is built with
#[derive(Clone, Debug)]
pub struct WorkloadOptions {
    /// Namespace VMs are created in (used for Service DNS names)
    pub namespace: String,
    /// Size of the blank data volume for disk-backed kinds
    pub data_disk_size: String,
    /// Container disk image every VM boots from
    pub image: String,
    /// Login configured inside every VM
    pub ssh: SshCredentials,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
            data_disk_size: crate::DEFAULT_DATA_DISK_SIZE.to_string(),
            image: crate::DEFAULT_CONTAINER_DISK_IMAGE.to_string(),
            ssh: SshCredentials::default(),
        }
    }
}
