//! kube-rs implementation of [`ClusterClient`]
//!
//! Core kinds go through typed `Api<K>` handles. KubeVirt kinds have no
//! published Rust types, so they go through `Api<DynamicObject>` with a fixed
//! [`ApiResource`]. This is the only place `kube::Error` is inspected.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::{ClusterClient, ObjectRef, ResourceKind};
use crate::error::{ApiError, ApiErrorKind};
use crate::labels::LabelSet;
use crate::vm::VirtualMachine;
use crate::Error;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Default connection timeout for the kube client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for the kube client
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const KUBEVIRT_GROUP: &str = "kubevirt.io";
const KUBEVIRT_VERSION: &str = "v1";

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from an optional kubeconfig path.
///
/// Without a path the configuration is inferred: in-cluster service account
/// first, then `$KUBECONFIG` / `~/.kube/config`.
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer cluster config: {}", e)))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    Client::try_from(config).map_err(|e| Error::config(format!("failed to create client: {}", e)))
}

/// Normalize a kube-rs error into the gateway's classification
fn classify(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(resp) => ApiError::new(
            ApiErrorKind::classify(resp.code, &resp.reason),
            resp.code,
            resp.message,
        ),
        other => ApiError::new(ApiErrorKind::Other, 0, other.to_string()),
    }
}

fn kubevirt_resource(kind: &str, plural: &str) -> ApiResource {
    let gvk = GroupVersionKind::gvk(KUBEVIRT_GROUP, KUBEVIRT_VERSION, kind);
    ApiResource::from_gvk_with_plural(&gvk, plural)
}

fn to_refs<K>(kind: ResourceKind, items: Vec<K>) -> Vec<ObjectRef>
where
    K: Resource,
{
    items
        .into_iter()
        .map(|obj| ObjectRef {
            kind,
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            labels: obj.labels().clone(),
        })
        .collect()
}

/// [`ClusterClient`] backed by a kube-rs [`Client`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    vm_resource: ApiResource,
    vmi_resource: ApiResource,
}

impl KubeClusterClient {
    /// Wrap a connected client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            vm_resource: kubevirt_resource("VirtualMachine", "virtualmachines"),
            vmi_resource: kubevirt_resource("VirtualMachineInstance", "virtualmachineinstances"),
        }
    }

    fn dynamic(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let ar = match kind {
            ResourceKind::VirtualMachineInstance => &self.vmi_resource,
            _ => &self.vm_resource,
        };
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }

    async fn create_namespaced<K>(&self, obj: &K) -> ApiResult<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        K::DynamicType: Default,
    {
        let namespace = obj.meta().namespace.as_deref().ok_or_else(|| {
            ApiError::new(
                ApiErrorKind::Other,
                0,
                format!("{} has no namespace", obj.name_any()),
            )
        })?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), obj)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn list_namespaced<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        params: &ListParams,
    ) -> ApiResult<Vec<ObjectRef>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(params).await.map_err(classify)?;
        Ok(to_refs(kind, list.items))
    }

    async fn delete_namespaced<K>(&self, namespace: &str, name: &str) -> ApiResult<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_namespace(&self, namespace: &Namespace) -> ApiResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn create_service(&self, service: &Service) -> ApiResult<()> {
        self.create_namespaced(service).await
    }

    async fn create_secret(&self, secret: &Secret) -> ApiResult<()> {
        self.create_namespaced(secret).await
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> ApiResult<()> {
        let obj: DynamicObject = serde_json::to_value(vm)
            .and_then(serde_json::from_value)
            .map_err(|e| {
                ApiError::new(
                    ApiErrorKind::Other,
                    0,
                    format!("encoding VirtualMachine {}: {}", vm.metadata.name, e),
                )
            })?;

        self.dynamic(ResourceKind::VirtualMachine, &vm.metadata.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ApiResult<()> {
        trace!(kind = %kind, namespace = %namespace, name = %name, "delete");
        match kind {
            ResourceKind::Namespace => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                api.delete(name, &DeleteParams::default())
                    .await
                    .map(|_| ())
                    .map_err(classify)
            }
            ResourceKind::Service => self.delete_namespaced::<Service>(namespace, name).await,
            ResourceKind::Secret => self.delete_namespaced::<Secret>(namespace, name).await,
            ResourceKind::VirtualMachine | ResourceKind::VirtualMachineInstance => self
                .dynamic(kind, namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(classify),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSet,
    ) -> ApiResult<Vec<ObjectRef>> {
        let params = ListParams::default().labels(&selector.selector());
        trace!(kind = %kind, namespace = %namespace, selector = %selector.selector(), "list");

        match kind {
            ResourceKind::Namespace => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                let list = api.list(&params).await.map_err(classify)?;
                Ok(to_refs(kind, list.items))
            }
            ResourceKind::Service => {
                self.list_namespaced::<Service>(kind, namespace, &params)
                    .await
            }
            ResourceKind::Secret => self.list_namespaced::<Secret>(kind, namespace, &params).await,
            ResourceKind::VirtualMachine | ResourceKind::VirtualMachineInstance => {
                let list = self
                    .dynamic(kind, namespace)
                    .list(&params)
                    .await
                    .map_err(classify)?;
                Ok(to_refs(kind, list.items))
            }
        }
    }

    async fn get_vmi_phase(&self, namespace: &str, name: &str) -> ApiResult<String> {
        let vmi = self
            .dynamic(ResourceKind::VirtualMachineInstance, namespace)
            .get(name)
            .await
            .map_err(classify)?;

        Ok(vmi
            .data
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string())
    }
}
