//! `virtwork run`: plan, create and wait for workload VMs

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::{connect, open_auditor};
use crate::audit::{AuditSession, EventRecord, EventType, ExecutionRecord, ExecutionStatus};
use crate::config::{Config, RunConfig};
use crate::orchestrator::{render_dry_run, Orchestrator, OrchestratorOptions};
use crate::workload::{build_plans, Plan};
use crate::Result;

/// Arguments for `virtwork run`
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Workloads to deploy, comma separated (default: all)
    #[arg(long, env = "VIRTWORK_WORKLOADS")]
    pub workloads: Option<String>,

    /// VMs per workload (per role for server/client workloads)
    #[arg(long, env = "VIRTWORK_VM_COUNT")]
    pub vm_count: Option<u32>,

    /// CPU cores per VM
    #[arg(long, env = "VIRTWORK_CPU_CORES")]
    pub cpu_cores: Option<u32>,

    /// Memory per VM (e.g. 2Gi)
    #[arg(long, env = "VIRTWORK_MEMORY")]
    pub memory: Option<String>,

    /// Data disk size for disk and database workloads
    #[arg(long = "disk-size", env = "VIRTWORK_DATA_DISK_SIZE")]
    pub data_disk_size: Option<String>,

    /// Container disk image for VMs
    #[arg(long, env = "VIRTWORK_CONTAINER_DISK_IMAGE")]
    pub container_disk_image: Option<String>,

    /// Print VM manifests without connecting to a cluster
    #[arg(long, env = "VIRTWORK_DRY_RUN")]
    pub dry_run: bool,

    /// Do not wait for VMs to become ready
    #[arg(long, env = "VIRTWORK_NO_WAIT")]
    pub no_wait: bool,

    /// Readiness timeout in seconds
    #[arg(long, env = "VIRTWORK_TIMEOUT")]
    pub timeout: Option<u64>,

    /// SSH user created in every VM
    #[arg(long, env = "VIRTWORK_SSH_USER")]
    pub ssh_user: Option<String>,

    /// SSH password for the user (enables password login)
    #[arg(long, env = "VIRTWORK_SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// SSH authorized key (repeatable)
    #[arg(
        long = "ssh-key",
        env = "VIRTWORK_SSH_AUTHORIZED_KEYS",
        value_delimiter = ','
    )]
    pub ssh_keys: Vec<String>,

    /// File holding an SSH public key (repeatable)
    #[arg(long = "ssh-key-file")]
    pub ssh_key_files: Vec<PathBuf>,
}

/// Run the `run` command
pub async fn run(config: &Config, args: RunArgs, cancel: &CancellationToken) -> Result<()> {
    let settings = RunConfig::resolve(config, &args)?;
    let run_id = Uuid::new_v4().to_string();

    let plan = build_plans(&settings.requests, settings.options.clone(), &run_id)?;
    info!(
        run_id = %run_id,
        namespace = %config.namespace,
        vms = plan.vms.len(),
        services = plan.services.len(),
        "Built plan"
    );

    let record = execution_record(config, &settings, &plan, &run_id);
    let audit = AuditSession::start(open_auditor(config), &record);
    audit.event(EventRecord::new(
        EventType::RunStarted,
        format!("starting {} with run id {}", record.command, run_id),
    ));
    audit.event(EventRecord::new(
        EventType::PlanBuilt,
        format!(
            "planned {} VMs across {} workloads",
            plan.vms.len(),
            settings.requests.len()
        ),
    ));

    if settings.dry_run {
        let rendered = render_dry_run(&plan);
        match &rendered {
            Ok(yaml) => {
                print!("{}", yaml);
                audit.complete(ExecutionStatus::Completed, None);
            }
            Err(e) => audit.complete(ExecutionStatus::Failed, Some(&e.to_string())),
        }
        return rendered.map(|_| ());
    }

    let gateway = match connect(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            audit.complete(ExecutionStatus::Failed, Some(&e.to_string()));
            return Err(e);
        }
    };

    let options = OrchestratorOptions {
        wait_for_ready: settings.wait_for_ready,
        ready_timeout: settings.ready_timeout,
        ..Default::default()
    };
    let summary = Orchestrator::new(gateway)
        .with_audit(audit)
        .with_options(options)
        .execute(plan, &config.namespace, &run_id, cancel)
        .await?;

    println!("{}", summary);
    Ok(())
}

fn execution_record(
    config: &Config,
    settings: &RunConfig,
    plan: &Plan,
    run_id: &str,
) -> ExecutionRecord {
    ExecutionRecord {
        run_id: run_id.to_string(),
        command: if settings.dry_run { "dry-run" } else { "run" }.to_string(),
        namespace: config.namespace.clone(),
        kubeconfig_path: config
            .kubeconfig
            .as_ref()
            .map(|p| p.display().to_string()),
        container_disk_image: Some(settings.options.image.clone()),
        cpu_cores: Some(settings.shape.cpu_cores),
        memory: Some(settings.shape.memory.clone()),
        data_disk_size: Some(settings.options.data_disk_size.clone()),
        workloads: Some(settings.workload_names()),
        total_vm_count: Some(plan.vms.len()),
        total_workload_count: Some(settings.requests.len()),
        dry_run: settings.dry_run,
        ssh_auth_configured: settings.ssh_auth_configured(),
        cleanup_mode: None,
        wait_for_ready: settings.wait_for_ready,
        ready_timeout_seconds: Some(settings.ready_timeout.as_secs()),
    }
}
