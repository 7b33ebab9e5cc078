//! CLI commands
//!
//! `virtwork run` provisions VMs and `virtwork cleanup` removes them. Both
//! share the global options in [`GlobalArgs`], resolved into a
//! [`Config`] before either command starts.

pub mod cleanup;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{Auditor, NoopAuditor, SqliteAuditor};
use crate::config::Config;
use crate::gateway::{create_client, KubeClusterClient, ResourceGateway};
use crate::Result;

/// virtwork - KubeVirt VMs running continuous synthetic workloads
#[derive(Parser, Debug)]
#[command(name = "virtwork", version, about, long_about = None)]
pub struct Cli {
    /// Options shared by every command
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Kubernetes namespace for VMs
    #[arg(long, global = true, env = "VIRTWORK_NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to kubeconfig file (defaults to in-cluster or ~/.kube/config)
    #[arg(long, global = true, env = "VIRTWORK_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Path to YAML config file
    #[arg(long, global = true, env = "VIRTWORK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, env = "VIRTWORK_VERBOSE")]
    pub verbose: bool,

    /// Disable the audit trail
    #[arg(long, global = true, env = "VIRTWORK_NO_AUDIT")]
    pub no_audit: bool,

    /// Path to the audit database file
    #[arg(long = "audit-db", global = true, env = "VIRTWORK_AUDIT_DB")]
    pub audit_db: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create VMs and start workloads
    ///
    /// Each workload installs its software through cloud-init and runs
    /// continuously under systemd inside the VM.
    Run(run::RunArgs),

    /// Delete managed VMs, Services and Secrets
    ///
    /// Resources are found by label, so cleanup works after a crashed or
    /// interrupted run.
    Cleanup(cleanup::CleanupArgs),
}

impl Cli {
    /// Run the selected command with resolved settings
    pub async fn run(self, config: Config) -> Result<()> {
        let cancel = shutdown_token();
        match self.command {
            Commands::Run(args) => run::run(&config, args, &cancel).await,
            Commands::Cleanup(args) => cleanup::run(&config, args, &cancel).await,
        }
    }
}

/// Token cancelled on Ctrl-C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            trigger.cancel();
        }
    });
    token
}

/// Connect to the cluster and wrap the client in a gateway
pub async fn connect(config: &Config) -> Result<ResourceGateway> {
    let client = create_client(config.kubeconfig.as_deref()).await?;
    debug!(kubeconfig = ?config.kubeconfig, "Connected to cluster");
    Ok(ResourceGateway::new(Arc::new(KubeClusterClient::new(client))))
}

/// Open the configured audit store.
///
/// A store that cannot be opened is logged and replaced by a no-op auditor.
pub fn open_auditor(config: &Config) -> Arc<dyn Auditor> {
    if !config.audit_enabled {
        return Arc::new(NoopAuditor);
    }
    match SqliteAuditor::open(&config.audit_db_path) {
        Ok(auditor) => Arc::new(auditor),
        Err(e) => {
            warn!(
                path = %config.audit_db_path.display(),
                error = %e,
                "Audit database unavailable, continuing without audit trail"
            );
            Arc::new(NoopAuditor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_options_work_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "virtwork",
            "cleanup",
            "--namespace",
            "ns1",
            "--audit-db",
            "/tmp/audit.db",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.global.namespace.as_deref(), Some("ns1"));
        assert_eq!(cli.global.audit_db, Some(PathBuf::from("/tmp/audit.db")));
        assert!(cli.global.verbose);
        assert!(matches!(cli.command, Commands::Cleanup(_)));
    }

    #[test]
    fn a_command_is_required() {
        assert!(Cli::try_parse_from(["virtwork"]).is_err());
    }

    #[test]
    fn disabled_audit_uses_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let config = Config::from_layers(
            &GlobalArgs {
                no_audit: true,
                audit_db: Some(path.clone()),
                ..Default::default()
            },
            Default::default(),
        );
        let auditor = open_auditor(&config);
        assert_eq!(auditor.start_execution(&Default::default()).unwrap(), 0);
        assert!(!path.exists());
    }
}
