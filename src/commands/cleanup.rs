//! `virtwork cleanup`: delete managed resources by label

use clap::Args;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{connect, open_auditor};
use crate::audit::{AuditSession, ExecutionRecord, ExecutionStatus};
use crate::cleanup::CleanupEngine;
use crate::config::Config;
use crate::Result;

/// Arguments for `virtwork cleanup`
#[derive(Args, Debug, Clone, Default)]
pub struct CleanupArgs {
    /// Also delete the namespace
    #[arg(long, env = "VIRTWORK_DELETE_NAMESPACE")]
    pub delete_namespace: bool,

    /// Only delete resources created by this run
    #[arg(long, env = "VIRTWORK_RUN_ID")]
    pub run_id: Option<String>,
}

impl CleanupArgs {
    /// The run filter, ignoring an empty value
    pub fn run_filter(&self) -> Option<&str> {
        self.run_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Run the `cleanup` command.
///
/// Individual delete failures are printed as warnings and do not fail the
/// command.
pub async fn run(config: &Config, args: CleanupArgs, cancel: &CancellationToken) -> Result<()> {
    let run_filter = args.run_filter();
    let record = ExecutionRecord {
        run_id: Uuid::new_v4().to_string(),
        command: "cleanup".to_string(),
        namespace: config.namespace.clone(),
        kubeconfig_path: config
            .kubeconfig
            .as_ref()
            .map(|p| p.display().to_string()),
        cleanup_mode: Some(if run_filter.is_some() { "run-id" } else { "all" }.to_string()),
        ..Default::default()
    };
    let audit = AuditSession::start(open_auditor(config), &record);

    let gateway = match connect(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            audit.complete(ExecutionStatus::Failed, Some(&e.to_string()));
            return Err(e);
        }
    };

    let result = CleanupEngine::new(gateway)
        .with_audit(audit.clone())
        .cleanup_all(&config.namespace, args.delete_namespace, run_filter, cancel)
        .await;

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            audit.complete(ExecutionStatus::Failed, Some(&e.to_string()));
            return Err(e);
        }
    };

    audit.cleanup(&result.counts(), &result.run_ids);
    let summary = (!result.errors.is_empty()).then(|| result.errors.join("; "));
    audit.complete(ExecutionStatus::Completed, summary.as_deref());

    println!("{}", result);
    for error in &result.errors {
        eprintln!("warning: {}", error);
    }
    Ok(())
}
