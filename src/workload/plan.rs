//! Plan Builder: expand workload requests into VM and Service plans
//!
//! Single-role kinds produce `count` VMs named `virtwork-<kind>-<i>`.
//! Server/client kinds produce `count` VMs for each role, named
//! `virtwork-<kind>-<role>-<i>`, plus the Service the clients resolve.
//! Nothing here talks to the cluster.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use super::{Role, Topology, WorkloadKind, WorkloadOptions};
use crate::labels::{LabelSet, LABEL_APP_NAME, LABEL_COMPONENT, LABEL_ROLE};
use crate::vm::{validate_quantity, DataVolumeTemplate, ExtraDisk};
use crate::{Error, Result, TOOL_NAME};

/// Secret key holding the cloud-init payload
pub const USERDATA_KEY: &str = "userdata";
/// Disk name of the data volume inside the guest
pub const DATA_DISK_NAME: &str = "datadisk";

/// CPU and memory of one VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmShape {
    /// Virtual CPU cores
    pub cpu_cores: u32,
    /// Memory request (Kubernetes quantity)
    pub memory: String,
}

impl Default for VmShape {
    fn default() -> Self {
        Self {
            cpu_cores: crate::DEFAULT_CPU_CORES,
            memory: crate::DEFAULT_MEMORY.to_string(),
        }
    }
}

/// One requested workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRequest {
    /// Workload kind
    pub kind: WorkloadKind,
    /// VMs per role; values below 1 are treated as 1
    pub count: u32,
    /// Shape of every VM of this workload
    pub shape: VmShape,
}

impl WorkloadRequest {
    /// Request `count` VMs of the default shape
    pub fn new(kind: WorkloadKind, count: u32) -> Self {
        Self {
            kind,
            count,
            shape: VmShape::default(),
        }
    }

    /// Number of VMs this request expands to
    pub fn vm_count(&self) -> usize {
        let per_role = self.count.max(1) as usize;
        match self.kind.topology() {
            Topology::Single => per_role,
            Topology::ServerClient => per_role * Role::ALL.len(),
        }
    }
}

/// Everything needed to materialize one VirtualMachine
#[derive(Clone, Debug, PartialEq)]
pub struct VmPlan {
    /// VM name, unique within a plan
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// Container disk image
    pub image: String,
    /// Rendered cloud-config
    pub userdata: String,
    /// Secret carrying `userdata`, once it has been created
    pub secret_name: Option<String>,
    /// CPU and memory
    pub shape: VmShape,
    /// Workload the VM runs
    pub component: WorkloadKind,
    /// Role for server/client workloads
    pub role: Option<Role>,
    /// Labels for the VM, its template, and its secret
    pub labels: LabelSet,
    /// Disks appended after the root and cloud-init disks
    pub extra_disks: Vec<ExtraDisk>,
    /// DataVolumes created with the VM
    pub data_volume_templates: Vec<DataVolumeTemplate>,
}

impl VmPlan {
    /// Name of the cloud-init secret for this VM
    pub fn cloud_init_secret_name(&self) -> String {
        format!("{}-cloudinit", self.name)
    }

    /// The cloud-init secret for this VM
    pub fn cloud_init_secret(&self) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(USERDATA_KEY.to_string(), self.userdata.clone());

        Secret {
            metadata: ObjectMeta {
                name: Some(self.cloud_init_secret_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.as_map().clone()),
                ..Default::default()
            },
            string_data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }
}

/// A ClusterIP Service some VMs depend on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePlan {
    /// Service name
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// Labels on the Service object
    pub labels: LabelSet,
    /// Pod selector
    pub selector: BTreeMap<String, String>,
    /// Port name
    pub port_name: String,
    /// TCP port (service and target)
    pub port: i32,
}

impl ServicePlan {
    /// Materialize as a core/v1 Service
    pub fn to_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.as_map().clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.selector.clone()),
                ports: Some(vec![ServicePort {
                    name: Some(self.port_name.clone()),
                    port: self.port,
                    target_port: Some(IntOrString::Int(self.port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// The flat result of planning a run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    /// VMs in creation order
    pub vms: Vec<VmPlan>,
    /// Services, created before any VM
    pub services: Vec<ServicePlan>,
}

impl Plan {
    /// Names of every planned VM
    pub fn vm_names(&self) -> Vec<String> {
        self.vms.iter().map(|p| p.name.clone()).collect()
    }
}

fn vm_labels(run_id: &str, kind: WorkloadKind, role: Option<Role>) -> LabelSet {
    let labels = LabelSet::for_run(run_id)
        .with(LABEL_APP_NAME, format!("{}-{}", TOOL_NAME, kind))
        .with(LABEL_COMPONENT, kind.as_str());
    match role {
        Some(role) => labels.with(LABEL_ROLE, role.as_str()),
        None => labels,
    }
}

/// Expand requests into VM and Service plans.
///
/// Fails on an invalid shape, a duplicate kind, or a name collision; nothing
/// is created, so a failure here leaves the cluster untouched.
pub fn build_plans(
    requests: &[WorkloadRequest],
    opts: WorkloadOptions,
    run_id: &str,
) -> Result<Plan> {
    let mut plan = Plan::default();
    let mut kinds = HashSet::new();
    let mut names = HashSet::new();

    for request in requests {
        let kind = request.kind;
        if !kinds.insert(kind) {
            return Err(Error::config(format!("workload {} requested more than once", kind)));
        }
        if request.shape.cpu_cores == 0 {
            return Err(Error::config(format!("workload {}: cpu cores must be at least 1", kind)));
        }
        validate_quantity("memory", &request.shape.memory)?;
        if kind.needs_data_disk() {
            validate_quantity("data disk size", &opts.data_disk_size)?;
        }

        let roles: Vec<Option<Role>> = match kind.topology() {
            Topology::Single => vec![None],
            Topology::ServerClient => Role::ALL.into_iter().map(Some).collect(),
        };

        for role in roles {
            let userdata = kind.cloud_config(role, &opts.namespace).render(&opts.ssh)?;

            for i in 0..request.count.max(1) {
                let name = match role {
                    Some(role) => format!("{}-{}-{}-{}", TOOL_NAME, kind, role, i),
                    None => format!("{}-{}-{}", TOOL_NAME, kind, i),
                };
                if !names.insert(name.clone()) {
                    return Err(Error::config(format!("duplicate VM name {}", name)));
                }

                let (extra_disks, data_volume_templates) = if kind.needs_data_disk() {
                    let data_volume = format!("{}-data", name);
                    (
                        vec![ExtraDisk {
                            name: DATA_DISK_NAME.to_string(),
                            data_volume: data_volume.clone(),
                        }],
                        vec![DataVolumeTemplate {
                            name: data_volume,
                            size: opts.data_disk_size.clone(),
                        }],
                    )
                } else {
                    (Vec::new(), Vec::new())
                };

                plan.vms.push(VmPlan {
                    name,
                    namespace: opts.namespace.clone(),
                    image: opts.image.clone(),
                    userdata: userdata.clone(),
                    secret_name: None,
                    shape: request.shape.clone(),
                    component: kind,
                    role,
                    labels: vm_labels(run_id, kind, role),
                    extra_disks,
                    data_volume_templates,
                });
            }
        }

        let service_labels = vm_labels(run_id, kind, None);
        if let Some(service) = kind.service_plan(&opts.namespace, service_labels) {
            plan.services.push(service);
        }

        debug!(workload = %kind, vms = request.vm_count(), "Planned workload");
    }

    Ok(plan)
}
