//! Cleanup Engine: label-scoped teardown
//!
//! Cleanup needs no state from the run that created the resources. It lists
//! every VM, Service and Secret carrying the managed-by label (and the run-id
//! label when a run is targeted), deletes each one, and optionally deletes the
//! namespace last.
//!
//! A failed delete is recorded and the pass moves on. Only a failed listing
//! or cancellation aborts, since the scope of the work is then unknown.

use std::collections::BTreeSet;
use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditSession, CleanupCounts, EventRecord, EventType};
use crate::gateway::{ResourceGateway, ResourceKind};
use crate::labels::{run_id_of, LabelSet};
use crate::{Error, Result};

/// Kinds deleted by a cleanup pass, in deletion order
pub const CLEANUP_ORDER: [ResourceKind; 3] = [
    ResourceKind::VirtualMachine,
    ResourceKind::Service,
    ResourceKind::Secret,
];

/// Outcome of a cleanup pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// VMs deleted (or already gone)
    pub vms_deleted: usize,
    /// Services deleted
    pub services_deleted: usize,
    /// Secrets deleted
    pub secrets_deleted: usize,
    /// Whether the namespace was deleted
    pub namespace_deleted: bool,
    /// One entry per resource that could not be deleted
    pub errors: Vec<String>,
    /// Run identifiers found on the matched resources, sorted
    pub run_ids: Vec<String>,
}

impl CleanupResult {
    /// Counters in the form the audit trail stores
    pub fn counts(&self) -> CleanupCounts {
        CleanupCounts {
            vms_deleted: self.vms_deleted,
            services_deleted: self.services_deleted,
            secrets_deleted: self.secrets_deleted,
            namespace_deleted: self.namespace_deleted,
        }
    }

    fn record_deleted(&mut self, kind: ResourceKind) {
        match kind {
            ResourceKind::VirtualMachine => self.vms_deleted += 1,
            ResourceKind::Service => self.services_deleted += 1,
            ResourceKind::Secret => self.secrets_deleted += 1,
            ResourceKind::Namespace => self.namespace_deleted = true,
            ResourceKind::VirtualMachineInstance => {}
        }
    }
}

impl fmt::Display for CleanupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<20}{}", "VMs deleted", self.vms_deleted)?;
        writeln!(f, "{:<20}{}", "Services deleted", self.services_deleted)?;
        writeln!(f, "{:<20}{}", "Secrets deleted", self.secrets_deleted)?;
        write!(
            f,
            "{:<20}{}",
            "Namespace deleted",
            if self.namespace_deleted { "yes" } else { "no" }
        )?;
        if !self.run_ids.is_empty() {
            write!(f, "\n{:<20}{}", "Runs", self.run_ids.join(", "))?;
        }
        Ok(())
    }
}

/// Deletes managed resources through a [`ResourceGateway`]
pub struct CleanupEngine {
    gateway: ResourceGateway,
    audit: AuditSession,
}

impl CleanupEngine {
    /// Engine without an audit trail
    pub fn new(gateway: ResourceGateway) -> Self {
        Self {
            gateway,
            audit: AuditSession::disabled(),
        }
    }

    /// Record cleanup events in `audit`
    pub fn with_audit(mut self, audit: AuditSession) -> Self {
        self.audit = audit;
        self
    }

    /// Delete every managed resource in `namespace`, or only those of `run_id`.
    ///
    /// Returns an error only when listing fails or `cancel` fires;
    /// per-resource failures are collected in [`CleanupResult::errors`].
    pub async fn cleanup_all(
        &self,
        namespace: &str,
        delete_namespace: bool,
        run_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CleanupResult> {
        let selector = LabelSet::cleanup_selector(run_id);
        info!(namespace = %namespace, selector = %selector.selector(), "Starting cleanup");
        self.audit.event(EventRecord::new(
            EventType::CleanupStarted,
            format!("cleanup of {} ({})", namespace, selector.selector()),
        ));

        let mut result = CleanupResult::default();
        let mut run_ids = BTreeSet::new();

        for kind in CLEANUP_ORDER {
            ensure_not_cancelled(cancel, "listing resources to clean up")?;
            let objects = self
                .gateway
                .list_by_labels(kind, namespace, &selector)
                .await?;

            for object in objects {
                if let Some(id) = run_id_of(&object.labels) {
                    run_ids.insert(id.to_string());
                }
                ensure_not_cancelled(cancel, "deleting resources")?;

                match self
                    .gateway
                    .delete(kind, namespace, &object.name, cancel)
                    .await
                {
                    Ok(()) => result.record_deleted(kind),
                    Err(e) if e.is_cancelled() => {
                        return Err(self.interrupted(&result, "deleting resources"));
                    }
                    Err(e) => {
                        warn!(kind = %kind, name = %object.name, error = %e, "Failed to delete");
                        let message = format!("{} {}: {}", kind, object.name, e);
                        self.audit.event(
                            EventRecord::new(EventType::CleanupError, format!("deleting {} {}", kind, object.name))
                                .with_error(e.to_string()),
                        );
                        result.errors.push(message);
                    }
                }
            }
        }

        result.run_ids = run_ids.into_iter().collect();

        if delete_namespace {
            ensure_not_cancelled(cancel, "deleting namespace")?;
            match self.gateway.delete_namespace(namespace, cancel).await {
                Ok(()) => result.record_deleted(ResourceKind::Namespace),
                Err(e) if e.is_cancelled() => {
                    return Err(self.interrupted(&result, "deleting namespace"));
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Failed to delete namespace");
                    result.errors.push(format!("Namespace {}: {}", namespace, e));
                }
            }
        }

        info!(
            vms = result.vms_deleted,
            services = result.services_deleted,
            secrets = result.secrets_deleted,
            namespace_deleted = result.namespace_deleted,
            errors = result.errors.len(),
            "Cleanup finished"
        );
        self.audit.event(EventRecord::new(
            EventType::CleanupCompleted,
            format!(
                "deleted {} VMs, {} services, {} secrets",
                result.vms_deleted, result.services_deleted, result.secrets_deleted
            ),
        ));

        Ok(result)
    }

    /// Log how far an interrupted pass got and build the cancellation error
    fn interrupted(&self, result: &CleanupResult, operation: &str) -> Error {
        warn!(
            vms = result.vms_deleted,
            services = result.services_deleted,
            secrets = result.secrets_deleted,
            "Cleanup interrupted"
        );
        Error::cancelled(operation)
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken, operation: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled(operation));
    }
    Ok(())
}
