//! Configuration resolution
//!
//! Every setting is resolved from four layers, highest priority first:
//!
//! 1. command-line flag
//! 2. `VIRTWORK_*` environment variable (bound by clap alongside the flag)
//! 3. YAML config file passed with `--config`
//! 4. built-in default
//!
//! Per-workload entries in the config file (`workloads.<kind>`) override the
//! global VM count, CPU cores and memory for that kind. A zero or empty value
//! leaves the global value in place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::commands::run::RunArgs;
use crate::commands::GlobalArgs;
use crate::workload::{
    parse_kinds, SshCredentials, VmShape, WorkloadKind, WorkloadOptions, WorkloadRequest,
};
use crate::{Error, Result};

/// Per-workload overrides from the config file
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkloadOverride {
    /// VMs per role
    pub vm_count: Option<u32>,
    /// CPU cores per VM
    pub cpu_cores: Option<u32>,
    /// Memory per VM
    pub memory: Option<String>,
}

/// Contents of the YAML config file. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    /// Target namespace
    pub namespace: Option<String>,
    /// Kubeconfig path
    pub kubeconfig: Option<String>,
    /// Container disk image
    pub container_disk_image: Option<String>,
    /// Data disk size for disk-backed workloads
    pub data_disk_size: Option<String>,
    /// CPU cores per VM
    pub cpu_cores: Option<u32>,
    /// Memory per VM
    pub memory: Option<String>,
    /// Wait for readiness
    pub wait_for_ready: Option<bool>,
    /// Readiness timeout in seconds
    pub timeout: Option<u64>,
    /// Dry run
    pub dry_run: Option<bool>,
    /// Debug logging
    pub verbose: Option<bool>,
    /// SSH user
    pub ssh_user: Option<String>,
    /// SSH password
    pub ssh_password: Option<String>,
    /// SSH authorized keys
    pub ssh_authorized_keys: Option<Vec<String>>,
    /// Audit trail enabled
    pub audit: Option<bool>,
    /// Audit database path
    pub audit_db: Option<PathBuf>,
    /// Overrides keyed by workload name
    pub workloads: BTreeMap<String, WorkloadOverride>,
}

impl FileConfig {
    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        let config: FileConfig = serde_yaml::from_str(&content).map_err(|e| {
            Error::config(format!("failed to parse config file {}: {}", path.display(), e))
        })?;

        for name in config.workloads.keys() {
            name.parse::<WorkloadKind>()?;
        }

        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }
}

/// Settings shared by every command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Target namespace
    pub namespace: String,
    /// Explicit kubeconfig; `None` infers in-cluster or default kubeconfig
    pub kubeconfig: Option<PathBuf>,
    /// Debug logging
    pub verbose: bool,
    /// Record executions in the audit database
    pub audit_enabled: bool,
    /// Audit database path
    pub audit_db_path: PathBuf,
    /// The config file, kept for command-specific resolution
    pub file: FileConfig,
}

impl Config {
    /// Resolve global settings, loading the config file if one was given
    pub fn resolve(args: &GlobalArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::from_layers(args, file))
    }

    /// Resolve global settings against an already loaded file
    pub fn from_layers(args: &GlobalArgs, file: FileConfig) -> Self {
        let namespace = pick_string(args.namespace.as_deref(), file.namespace.as_deref())
            .unwrap_or_else(|| crate::DEFAULT_NAMESPACE.to_string());
        let kubeconfig = pick_string(args.kubeconfig.as_deref(), file.kubeconfig.as_deref())
            .map(PathBuf::from);
        let audit_db_path = args
            .audit_db
            .clone()
            .or_else(|| file.audit_db.clone())
            .unwrap_or_else(|| PathBuf::from(crate::DEFAULT_AUDIT_DB_PATH));

        Self {
            namespace,
            kubeconfig,
            verbose: args.verbose || file.verbose.unwrap_or(false),
            audit_enabled: !args.no_audit && file.audit.unwrap_or(true),
            audit_db_path,
            file,
        }
    }
}

/// Settings for `virtwork run`
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// One request per selected workload, overrides applied
    pub requests: Vec<WorkloadRequest>,
    /// Options every workload is built with
    pub options: WorkloadOptions,
    /// Default VM shape before per-workload overrides
    pub shape: VmShape,
    /// Print manifests instead of creating anything
    pub dry_run: bool,
    /// Wait for VMs to reach `Running`
    pub wait_for_ready: bool,
    /// Per-VM readiness deadline
    pub ready_timeout: Duration,
}

impl RunConfig {
    /// Resolve run settings; reads SSH key files
    pub fn resolve(config: &Config, args: &RunArgs) -> Result<Self> {
        let file = &config.file;

        let kinds = match args.workloads.as_deref() {
            Some(list) => parse_kinds(list)?,
            None => WorkloadKind::ALL.to_vec(),
        };

        let shape = VmShape {
            cpu_cores: args
                .cpu_cores
                .or(file.cpu_cores)
                .filter(|c| *c > 0)
                .unwrap_or(crate::DEFAULT_CPU_CORES),
            memory: pick_string(args.memory.as_deref(), file.memory.as_deref())
                .unwrap_or_else(|| crate::DEFAULT_MEMORY.to_string()),
        };
        let vm_count = args.vm_count.unwrap_or(1);

        let requests = kinds
            .into_iter()
            .map(|kind| apply_override(kind, vm_count, &shape, file.workloads.get(kind.as_str())))
            .collect();

        let listed = if args.ssh_keys.is_empty() {
            file.ssh_authorized_keys.clone().unwrap_or_default()
        } else {
            args.ssh_keys.clone()
        };
        let mut authorized_keys: Vec<String> = listed
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        authorized_keys.extend(read_key_files(&args.ssh_key_files)?);

        let ssh = SshCredentials {
            user: pick_string(args.ssh_user.as_deref(), file.ssh_user.as_deref())
                .unwrap_or_else(|| crate::DEFAULT_SSH_USER.to_string()),
            password: pick_string(args.ssh_password.as_deref(), file.ssh_password.as_deref()),
            authorized_keys,
        };

        let options = WorkloadOptions {
            namespace: config.namespace.clone(),
            data_disk_size: pick_string(
                args.data_disk_size.as_deref(),
                file.data_disk_size.as_deref(),
            )
            .unwrap_or_else(|| crate::DEFAULT_DATA_DISK_SIZE.to_string()),
            image: pick_string(
                args.container_disk_image.as_deref(),
                file.container_disk_image.as_deref(),
            )
            .unwrap_or_else(|| crate::DEFAULT_CONTAINER_DISK_IMAGE.to_string()),
            ssh,
        };

        let ready_timeout = args
            .timeout
            .or(file.timeout)
            .filter(|t| *t > 0)
            .map(Duration::from_secs)
            .unwrap_or(crate::DEFAULT_READY_TIMEOUT);

        Ok(Self {
            requests,
            options,
            shape,
            dry_run: args.dry_run || file.dry_run.unwrap_or(false),
            wait_for_ready: !args.no_wait && file.wait_for_ready.unwrap_or(true),
            ready_timeout,
        })
    }

    /// Whether a password or any key was configured
    pub fn ssh_auth_configured(&self) -> bool {
        self.options.ssh.password.is_some() || !self.options.ssh.authorized_keys.is_empty()
    }

    /// Selected workload names, comma separated
    pub fn workload_names(&self) -> String {
        self.requests
            .iter()
            .map(|r| r.kind.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn apply_override(
    kind: WorkloadKind,
    vm_count: u32,
    shape: &VmShape,
    over: Option<&WorkloadOverride>,
) -> WorkloadRequest {
    let mut request = WorkloadRequest {
        kind,
        count: vm_count,
        shape: shape.clone(),
    };
    if let Some(over) = over {
        if let Some(count) = over.vm_count.filter(|c| *c > 0) {
            request.count = count;
        }
        if let Some(cores) = over.cpu_cores.filter(|c| *c > 0) {
            request.shape.cpu_cores = cores;
        }
        if let Some(memory) = over.memory.as_deref().filter(|m| !m.is_empty()) {
            request.shape.memory = memory.to_string();
        }
    }
    request
}

/// First non-empty value of flag/env then file
fn pick_string(arg: Option<&str>, file: Option<&str>) -> Option<String> {
    arg.filter(|s| !s.is_empty())
        .or(file.filter(|s| !s.is_empty()))
        .map(str::to_string)
}

/// Read public keys from files, one key per file, trimmed
pub fn read_key_files(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut keys = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read SSH key file {}: {}", path.display(), e))
        })?;
        let key = content.trim();
        if !key.is_empty() {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}
