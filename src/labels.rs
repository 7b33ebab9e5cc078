//! Label scheme for managed resources
//!
//! Every resource virtwork creates carries `app.kubernetes.io/managed-by=virtwork`.
//! Resources created by a run additionally carry `virtwork/run-id=<uuid>`, which
//! is what makes crash-safe, run-scoped cleanup possible without any local state.
//! The namespace only carries managed-by since it outlives individual runs.

use std::collections::BTreeMap;

use crate::TOOL_NAME;

/// Kubernetes recommended app name label
pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
/// Kubernetes recommended managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Kubernetes recommended component label (workload kind)
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Per-invocation run identifier
pub const LABEL_RUN_ID: &str = "virtwork/run-id";
/// Role of a VM in a multi-role workload (`server` / `client`)
pub const LABEL_ROLE: &str = "virtwork/role";

/// Value of the managed-by label
pub const MANAGED_BY_VALUE: &str = TOOL_NAME;

/// An ordered label map with builder helpers.
///
/// `BTreeMap` keeps selector strings and rendered manifests deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Empty label set
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels carried by every managed resource
    pub fn managed() -> Self {
        Self::new().with(LABEL_MANAGED_BY, MANAGED_BY_VALUE)
    }

    /// Managed labels plus the run identifier
    pub fn for_run(run_id: &str) -> Self {
        Self::managed().with(LABEL_RUN_ID, run_id)
    }

    /// Selector used by cleanup: managed-by always, run-id when filtering
    pub fn cleanup_selector(run_id: Option<&str>) -> Self {
        match run_id {
            Some(id) if !id.is_empty() => Self::for_run(id),
            _ => Self::managed(),
        }
    }

    /// Add a label
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a label value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether every label in `self` is present with the same value in `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as an equality-based label selector (`k1=v1,k2=v2`)
    pub fn selector(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Extract the run identifier label, ignoring empty values
pub fn run_id_of(labels: &BTreeMap<String, String>) -> Option<&str> {
    labels
        .get(LABEL_RUN_ID)
        .map(String::as_str)
        .filter(|id| !id.is_empty())
}
