//! Resource Gateway: the single choke point for cluster reads and mutations
//!
//! [`ClusterClient`] is the raw seam: typed create/list/delete/get calls that
//! report failures as classified [`ApiError`]s. [`ResourceGateway`] layers the
//! idempotency and retry contract on top:
//!
//! - create treats "already exists" as success
//! - delete treats "not found" as success
//! - VM create and every delete retry transient failures with backoff
//! - list and get are never retried; callers re-issue them from their own loop

mod client;

pub use self::client::{create_client, create_client_with_timeout, KubeClusterClient};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::{ApiError, ApiErrorKind};
use crate::labels::LabelSet;
use crate::retry::{retry_on_transient, RetryConfig};
use crate::vm::VirtualMachine;
use crate::{Error, Result};

/// Kinds of cluster object the gateway handles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// core/v1 Namespace (cluster scoped)
    Namespace,
    /// core/v1 Service
    Service,
    /// core/v1 Secret
    Secret,
    /// kubevirt.io/v1 VirtualMachine
    VirtualMachine,
    /// kubevirt.io/v1 VirtualMachineInstance
    VirtualMachineInstance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Namespace => "Namespace",
            Self::Service => "Service",
            Self::Secret => "Secret",
            Self::VirtualMachine => "VirtualMachine",
            Self::VirtualMachineInstance => "VirtualMachineInstance",
        };
        f.write_str(s)
    }
}

/// A listed object: identity plus labels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object kind
    pub kind: ResourceKind,
    /// Namespace (empty for cluster-scoped kinds)
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Labels as stored on the object
    pub labels: BTreeMap<String, String>,
}

/// Raw cluster access with classified errors.
///
/// Implementations translate their transport's failures into [`ApiError`];
/// nothing above this trait inspects transport error types.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a Namespace
    async fn create_namespace(&self, namespace: &Namespace) -> std::result::Result<(), ApiError>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> std::result::Result<(), ApiError>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> std::result::Result<(), ApiError>;

    /// Create a VirtualMachine
    async fn create_vm(&self, vm: &VirtualMachine) -> std::result::Result<(), ApiError>;

    /// Delete an object. `namespace` is ignored for cluster-scoped kinds.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<(), ApiError>;

    /// List objects of a kind matching every label in `selector`
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSet,
    ) -> std::result::Result<Vec<ObjectRef>, ApiError>;

    /// Phase of the VirtualMachineInstance backing a VM (empty if unreported)
    async fn get_vmi_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<String, ApiError>;
}

fn describe(kind: ResourceKind, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{} {}", kind, name)
    } else {
        format!("{} {}/{}", kind, namespace, name)
    }
}

/// `Ok(true)` on success, `Ok(false)` when the error is the idempotent kind
fn ignore(
    kind: ApiErrorKind,
    result: std::result::Result<(), ApiError>,
) -> std::result::Result<bool, ApiError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind == kind => Ok(false),
        Err(e) => Err(e),
    }
}

/// Idempotent, retrying facade over a [`ClusterClient`]
#[derive(Clone)]
pub struct ResourceGateway {
    client: Arc<dyn ClusterClient>,
    retry: RetryConfig,
}

impl ResourceGateway {
    /// Gateway with the default retry schedule
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry schedule
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create the namespace if absent
    pub async fn ensure_namespace(&self, name: &str, labels: &LabelSet) -> Result<()> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.as_map().clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = ignore(
            ApiErrorKind::AlreadyExists,
            self.client.create_namespace(&ns).await,
        )
        .map_err(|e| Error::api("creating", describe(ResourceKind::Namespace, "", name), e))?;

        if created {
            info!(namespace = %name, "Created namespace");
        } else {
            debug!(namespace = %name, "Namespace already exists");
        }
        Ok(())
    }

    /// Create a Service; an existing one is left as is
    pub async fn create_service(&self, service: &Service) -> Result<()> {
        let (ns, name) = object_key(&service.metadata);
        let created = ignore(
            ApiErrorKind::AlreadyExists,
            self.client.create_service(service).await,
        )
        .map_err(|e| Error::api("creating", describe(ResourceKind::Service, ns, name), e))?;

        debug!(service = %name, namespace = %ns, created, "Service ensured");
        Ok(())
    }

    /// Create a Secret; an existing one is left as is
    pub async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let (ns, name) = object_key(&secret.metadata);
        let created = ignore(
            ApiErrorKind::AlreadyExists,
            self.client.create_secret(secret).await,
        )
        .map_err(|e| Error::api("creating", describe(ResourceKind::Secret, ns, name), e))?;

        debug!(secret = %name, namespace = %ns, created, "Secret ensured");
        Ok(())
    }

    /// Create a VirtualMachine, retrying transient failures
    pub async fn create_vm(&self, vm: &VirtualMachine, cancel: &CancellationToken) -> Result<()> {
        let resource = describe(
            ResourceKind::VirtualMachine,
            &vm.metadata.namespace,
            &vm.metadata.name,
        );
        let operation = format!("creating {}", resource);

        let created = retry_on_transient(&self.retry, cancel, &operation, || async {
            ignore(ApiErrorKind::AlreadyExists, self.client.create_vm(vm).await)
                .map_err(|e| Error::api("creating", resource.clone(), e))
        })
        .await?;

        if created {
            info!(vm = %vm.metadata.name, namespace = %vm.metadata.namespace, "Created VM");
        } else {
            debug!(vm = %vm.metadata.name, namespace = %vm.metadata.namespace, "VM already exists");
        }
        Ok(())
    }

    /// Delete a VirtualMachine (missing is success)
    pub async fn delete_vm(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.delete(ResourceKind::VirtualMachine, namespace, name, cancel)
            .await
    }

    /// Delete a Service (missing is success)
    pub async fn delete_service(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.delete(ResourceKind::Service, namespace, name, cancel).await
    }

    /// Delete a Secret (missing is success)
    pub async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.delete(ResourceKind::Secret, namespace, name, cancel).await
    }

    /// Delete a Namespace (missing is success)
    pub async fn delete_namespace(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.delete(ResourceKind::Namespace, "", name, cancel).await
    }

    /// Idempotent, retrying delete of any kind
    pub async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let resource = describe(kind, namespace, name);
        let operation = format!("deleting {}", resource);

        let deleted = retry_on_transient(&self.retry, cancel, &operation, || async {
            ignore(
                ApiErrorKind::NotFound,
                self.client.delete(kind, namespace, name).await,
            )
            .map_err(|e| Error::api("deleting", resource.clone(), e))
        })
        .await?;

        if deleted {
            info!(kind = %kind, name = %name, namespace = %namespace, "Deleted");
        } else {
            debug!(kind = %kind, name = %name, namespace = %namespace, "Already gone");
        }
        Ok(())
    }

    /// List objects of `kind` carrying every label in `selector`
    pub async fn list_by_labels(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSet,
    ) -> Result<Vec<ObjectRef>> {
        self.client
            .list(kind, namespace, selector)
            .await
            .map_err(|e| {
                Error::api(
                    "listing",
                    format!("{} in {} ({})", kind, namespace, selector.selector()),
                    e,
                )
            })
    }

    /// Current VMI phase; a missing VMI surfaces as a not-found error
    pub async fn get_vmi_phase(&self, namespace: &str, name: &str) -> Result<String> {
        self.client
            .get_vmi_phase(namespace, name)
            .await
            .map_err(|e| {
                Error::api(
                    "reading",
                    describe(ResourceKind::VirtualMachineInstance, namespace, name),
                    e,
                )
            })
    }
}

fn object_key(meta: &ObjectMeta) -> (&str, &str) {
    (
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}
