//! In-memory [`ClusterClient`] with fault injection
//!
//! Objects are keyed by kind, namespace and name and keep their labels, which
//! is all the gateway, readiness poller and cleanup engine ever look at. Every
//! call is appended to a log so tests can assert ordering.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use virtwork::error::ApiError;
use virtwork::gateway::{ClusterClient, ObjectRef, ResourceKind};
use virtwork::labels::LabelSet;
use virtwork::vm::VirtualMachine;

/// Kind of call made against the fake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Create,
    Delete,
    List,
    GetPhase,
}

/// One recorded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub kind: ResourceKind,
    pub name: String,
}

struct Fault {
    op: Op,
    name: String,
    error: ApiError,
    remaining: Option<u32>,
}

type Key = (ResourceKind, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, BTreeMap<String, String>>,
    phases: BTreeMap<String, String>,
    faults: Vec<Fault>,
    calls: Vec<Call>,
}

/// In-memory cluster
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object without logging a call
    pub fn seed(&self, kind: ResourceKind, namespace: &str, name: &str, labels: &LabelSet) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(
            (kind, namespace.to_string(), name.to_string()),
            labels.as_map().clone(),
        );
    }

    /// Fail `op` on `name` with `error`, `times` times or forever when `None`
    pub fn fail(&self, op: Op, name: &str, error: ApiError, times: Option<u32>) {
        self.state.lock().unwrap().faults.push(Fault {
            op,
            name: name.to_string(),
            error,
            remaining: times,
        });
    }

    /// Phase reported for a VM's instance once the VM exists (default `Running`)
    pub fn set_phase(&self, vm: &str, phase: &str) {
        self.state
            .lock()
            .unwrap()
            .phases
            .insert(vm.to_string(), phase.to_string());
    }

    /// Names of stored objects of a kind, sorted
    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .objects
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Labels of a stored object
    pub fn labels(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls matching `op` and `kind`
    pub fn calls_of(&self, op: Op, kind: ResourceKind) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op && c.kind == kind)
            .map(|c| c.name)
            .collect()
    }

    /// Position of the first matching call in the log
    pub fn position(&self, op: Op, kind: ResourceKind, name: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.op == op && c.kind == kind && c.name == name)
    }

    fn begin(&self, op: Op, kind: ResourceKind, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op,
            kind,
            name: name.to_string(),
        });

        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.name == name && f.remaining != Some(0));
        match fault {
            Some(fault) => {
                if let Some(n) = fault.remaining.as_mut() {
                    *n -= 1;
                }
                Err(fault.error.clone())
            }
            None => Ok(()),
        }
    }

    fn insert(
        &self,
        kind: ResourceKind,
        meta: &ObjectMeta,
    ) -> Result<(), ApiError> {
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        let labels = meta.labels.clone().unwrap_or_default();
        self.insert_raw(kind, namespace, name, labels)
    }

    fn insert_raw(
        &self,
        kind: ResourceKind,
        namespace: String,
        name: String,
        labels: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        self.begin(Op::Create, kind, &name)?;
        let mut state = self.state.lock().unwrap();
        let key = (kind, namespace, name);
        if state.objects.contains_key(&key) {
            return Err(ApiError::already_exists(format!("{} {} already exists", kind, key.2)));
        }
        state.objects.insert(key, labels);
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), ApiError> {
        self.insert(ResourceKind::Namespace, &namespace.metadata)
    }

    async fn create_service(&self, service: &Service) -> Result<(), ApiError> {
        self.insert(ResourceKind::Service, &service.metadata)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), ApiError> {
        self.insert(ResourceKind::Secret, &secret.metadata)
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<(), ApiError> {
        self.insert_raw(
            ResourceKind::VirtualMachine,
            vm.metadata.namespace.clone(),
            vm.metadata.name.clone(),
            vm.metadata.labels.clone(),
        )
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.begin(Op::Delete, kind, name)?;
        let mut state = self.state.lock().unwrap();
        match state
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(ApiError::not_found(format!("{} {} not found", kind, name))),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSet,
    ) -> Result<Vec<ObjectRef>, ApiError> {
        self.begin(Op::List, kind, namespace)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), labels)| *k == kind && ns == namespace && selector.matches(labels))
            .map(|((k, ns, name), labels)| ObjectRef {
                kind: *k,
                namespace: ns.clone(),
                name: name.clone(),
                labels: labels.clone(),
            })
            .collect())
    }

    async fn get_vmi_phase(&self, namespace: &str, name: &str) -> Result<String, ApiError> {
        self.begin(Op::GetPhase, ResourceKind::VirtualMachineInstance, name)?;
        let state = self.state.lock().unwrap();
        let key = (ResourceKind::VirtualMachine, namespace.to_string(), name.to_string());
        if !state.objects.contains_key(&key) {
            return Err(ApiError::not_found(format!("virtualmachineinstance {} not found", name)));
        }
        Ok(state
            .phases
            .get(name)
            .cloned()
            .unwrap_or_else(|| "Running".to_string()))
    }
}
