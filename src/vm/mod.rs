//! KubeVirt VirtualMachine types and materialization
//!
//! KubeVirt ships no Rust bindings, so the subset of `kubevirt.io/v1`
//! VirtualMachine (and the CDI DataVolumeTemplate it embeds) that virtwork
//! produces is modelled here as plain serde structs. They serialize to the
//! exact camelCase shape the API server expects and are sent as a
//! `DynamicObject` by the kube-rs client.
//!
//! Every materialized VM boots from a container disk, receives its cloud-init
//! payload through a NoCloud disk, and gets a masquerade interface on the pod
//! network. Disk-backed workloads append a data disk backed by a blank
//! DataVolume.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::workload::VmPlan;
use crate::{Error, Result};

/// KubeVirt API version
pub const API_VERSION: &str = "kubevirt.io/v1";
/// VirtualMachine kind
pub const KIND: &str = "VirtualMachine";
/// VMI phase reported once the guest is running
pub const VMI_PHASE_RUNNING: &str = "Running";

/// Name of the root disk and its volume
pub const CONTAINER_DISK: &str = "containerdisk";
/// Name of the cloud-init disk and its volume
pub const CLOUD_INIT_DISK: &str = "cloudinitdisk";
/// Name of the pod network and its interface
pub const DEFAULT_NETWORK: &str = "default";

const VIRTIO: &str = "virtio";

// =============================================================================
// VirtualMachine
// =============================================================================

/// KubeVirt VirtualMachine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: VmMetadata,
    /// Spec
    pub spec: VirtualMachineSpec,
}

/// Object metadata for a VirtualMachine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmMetadata {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// VirtualMachine spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Start the VMI as soon as the VM exists
    pub running: bool,
    /// Instance template
    pub template: VmTemplate,
    /// DataVolumes created alongside the VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volume_templates: Vec<DataVolumeTemplateSpec>,
}

/// VirtualMachineInstance template
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmTemplate {
    /// Template metadata
    pub metadata: TemplateMetadata,
    /// Instance spec
    pub spec: VmiSpec,
}

/// Template metadata (labels only)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Labels propagated to the VMI and its launcher pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// VirtualMachineInstance spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmiSpec {
    /// Guest hardware
    pub domain: DomainSpec,
    /// Networks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,
    /// Volumes backing the disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// Guest hardware
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// CPU topology
    pub cpu: Cpu,
    /// Resource requests
    pub resources: ResourceRequirements,
    /// Attached devices
    pub devices: Devices,
}

/// CPU topology
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Cpu {
    /// Number of cores
    pub cores: u32,
}

/// Resource requests keyed by resource name (`memory`, `storage`)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    /// Requested quantities
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

impl ResourceRequirements {
    fn request(resource: &str, quantity: &str) -> Self {
        let mut requests = BTreeMap::new();
        requests.insert(resource.to_string(), quantity.to_string());
        Self { requests }
    }
}

/// Devices attached to the guest
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Disks, each backed by a volume of the same name
    pub disks: Vec<Disk>,
    /// Network interfaces
    pub interfaces: Vec<Interface>,
}

/// A disk device
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Disk {
    /// Disk (and volume) name
    pub name: String,
    /// Disk target
    pub disk: DiskTarget,
}

impl Disk {
    /// A virtio disk backed by the volume `name`
    pub fn virtio(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disk: DiskTarget {
                bus: VIRTIO.to_string(),
            },
        }
    }
}

/// Disk bus
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiskTarget {
    /// Bus type
    pub bus: String,
}

/// Network interface bound with masquerade
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Interface {
    /// Interface name, matching a network
    pub name: String,
    /// Masquerade binding
    pub masquerade: Masquerade,
}

/// Empty masquerade binding marker
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Masquerade {}

/// Guest network
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Network {
    /// Network name
    pub name: String,
    /// Pod network source
    pub pod: PodNetwork,
}

/// Empty pod network marker
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PodNetwork {}

/// A volume backing a disk
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Volume source
    #[serde(flatten)]
    pub source: VolumeSource,
}

/// Where a volume's content comes from
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Root disk pulled from a container image
    ContainerDisk {
        /// Image reference
        image: String,
    },
    /// NoCloud cloud-init data
    CloudInitNoCloud(CloudInitNoCloud),
    /// A DataVolume created from a template
    DataVolume {
        /// DataVolume name
        name: String,
    },
}

/// NoCloud cloud-init source: inline user data or a secret reference
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitNoCloud {
    /// Inline user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Secret holding the user data under key `userdata`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret_ref: Option<LocalObjectReference>,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
}

// =============================================================================
// DataVolume templates (CDI)
// =============================================================================

/// DataVolumeTemplate embedded in a VirtualMachine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeTemplateSpec {
    /// Template metadata
    pub metadata: DataVolumeMetadata,
    /// DataVolume spec
    pub spec: DataVolumeSpec,
}

/// DataVolume template metadata
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataVolumeMetadata {
    /// DataVolume name
    pub name: String,
}

/// DataVolume spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataVolumeSpec {
    /// Content source
    pub source: DataVolumeSource,
    /// Storage request
    pub storage: StorageSpec,
}

/// DataVolume content source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataVolumeSource {
    /// Blank, unformatted image
    pub blank: BlankImage,
}

/// Empty blank-image marker
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BlankImage {}

/// DataVolume storage request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StorageSpec {
    /// Resource requests (`storage`)
    pub resources: ResourceRequirements,
}

// =============================================================================
// Plan descriptors
// =============================================================================

/// An extra disk attached after the root and cloud-init disks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraDisk {
    /// Disk and volume name inside the guest spec
    pub name: String,
    /// DataVolume backing the disk
    pub data_volume: String,
}

/// A blank DataVolume created with the VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataVolumeTemplate {
    /// DataVolume name, unique per VM
    pub name: String,
    /// Storage quantity, e.g. `10Gi`
    pub size: String,
}

impl DataVolumeTemplate {
    /// Materialize into the CDI template shape
    pub fn to_spec(&self) -> DataVolumeTemplateSpec {
        DataVolumeTemplateSpec {
            metadata: DataVolumeMetadata {
                name: self.name.clone(),
            },
            spec: DataVolumeSpec {
                source: DataVolumeSource {
                    blank: BlankImage {},
                },
                storage: StorageSpec {
                    resources: ResourceRequirements::request("storage", &self.size),
                },
            },
        }
    }
}

// =============================================================================
// Materialization
// =============================================================================

/// Materialize a VM plan into a full VirtualMachine.
///
/// The cloud-init volume references the plan's secret when one has been
/// attached, and embeds the payload inline otherwise (dry-run output).
pub fn build_vm(plan: &VmPlan) -> VirtualMachine {
    let labels = plan.labels.as_map().clone();

    let mut disks = vec![Disk::virtio(CONTAINER_DISK), Disk::virtio(CLOUD_INIT_DISK)];
    disks.extend(plan.extra_disks.iter().map(|d| Disk::virtio(&d.name)));

    let cloud_init = match &plan.secret_name {
        Some(secret) => CloudInitNoCloud {
            user_data: None,
            user_data_secret_ref: Some(LocalObjectReference {
                name: secret.clone(),
            }),
        },
        None => CloudInitNoCloud {
            user_data: Some(plan.userdata.clone()),
            user_data_secret_ref: None,
        },
    };

    let mut volumes = vec![
        Volume {
            name: CONTAINER_DISK.to_string(),
            source: VolumeSource::ContainerDisk {
                image: plan.image.clone(),
            },
        },
        Volume {
            name: CLOUD_INIT_DISK.to_string(),
            source: VolumeSource::CloudInitNoCloud(cloud_init),
        },
    ];
    volumes.extend(plan.extra_disks.iter().map(|d| Volume {
        name: d.name.clone(),
        source: VolumeSource::DataVolume {
            name: d.data_volume.clone(),
        },
    }));

    VirtualMachine {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        metadata: VmMetadata {
            name: plan.name.clone(),
            namespace: plan.namespace.clone(),
            labels: labels.clone(),
        },
        spec: VirtualMachineSpec {
            running: true,
            template: VmTemplate {
                metadata: TemplateMetadata { labels },
                spec: VmiSpec {
                    domain: DomainSpec {
                        cpu: Cpu {
                            cores: plan.shape.cpu_cores,
                        },
                        resources: ResourceRequirements::request("memory", &plan.shape.memory),
                        devices: Devices {
                            disks,
                            interfaces: vec![Interface {
                                name: DEFAULT_NETWORK.to_string(),
                                masquerade: Masquerade {},
                            }],
                        },
                    },
                    networks: vec![Network {
                        name: DEFAULT_NETWORK.to_string(),
                        pod: PodNetwork {},
                    }],
                    volumes,
                },
            },
            data_volume_templates: plan
                .data_volume_templates
                .iter()
                .map(DataVolumeTemplate::to_spec)
                .collect(),
        },
    }
}

/// Render a VirtualMachine as a YAML document
pub fn to_yaml(vm: &VirtualMachine) -> Result<String> {
    serde_yaml::to_string(vm).map_err(|e| Error::serialization(e.to_string()))
}

/// Validate a Kubernetes resource quantity such as `2Gi`, `512M` or `1.5`.
pub fn validate_quantity(field: &str, value: &str) -> Result<()> {
    const SUFFIXES: &[&str] = &[
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "k", "M", "G", "T", "P", "E", "",
    ];

    let invalid = || Error::config(format!("invalid {} quantity {:?}", field, value));

    let digits_end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(digits_end);

    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(invalid());
    }
    if !SUFFIXES.contains(&suffix) {
        return Err(invalid());
    }
    Ok(())
}
