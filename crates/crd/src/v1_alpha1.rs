//! v1Alpha1 CRD resources

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation overriding the identifier used on the remote side
pub const EXTERNAL_NAME_ANNOTATION: &str = "policyward.dev/external-name";

/// Spec object for the `System` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[serde(rename_all = "camelCase")]
#[kube(kind = "System", group = "policyward.dev", version = "v1alpha1")]
#[kube(status = "PolicySyncStatus", shortname = "sys")]
#[kube(namespaced)]
pub struct SystemSpec {
    /// Category of the system (e.g., "kubernetes", "envoy", "custom"),
    /// recorded under the reserved `system-type` label
    #[schemars(length(min = 1, max = 63))]
    #[serde(rename = "type")]
    pub system_type: String,
    /// Human readable description
    pub description: Option<String>,
    /// Labels stored as policy next to the system
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Spec object for the `Stack` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[serde(rename_all = "camelCase")]
#[kube(kind = "Stack", group = "policyward.dev", version = "v1alpha1")]
#[kube(status = "PolicySyncStatus", shortname = "stk")]
#[kube(namespaced)]
pub struct StackSpec {
    /// Category of the systems this stack applies to
    #[schemars(length(min = 1, max = 63))]
    #[serde(rename = "type")]
    pub stack_type: String,
    /// Human readable description
    pub description: Option<String>,
    /// Label selectors a system must match to be part of the stack
    #[serde(default)]
    pub selector_include: BTreeMap<String, Vec<String>>,
    /// Label selectors that remove a system from the stack
    #[serde(default)]
    pub selector_exclude: BTreeMap<String, Vec<String>>,
}

/// Status shared by every resource whose state is kept as policy source
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicySyncStatus {
    /// Path of the policy holding the generated module
    pub policy_path: String,
    /// Whether the stored policy matched the spec after the last reconciliation
    pub up_to_date: bool,
    /// RFC 3339 timestamp of the last successful reconciliation
    pub last_synced: Option<String>,
    /// Generation of the resource observed by the last reconciliation
    pub observed_generation: Option<i64>,
    /// Outcome of the last reconciliation
    pub message: Option<String>,
}

fn external_name_of(resource: &impl ResourceExt) -> String {
    resource
        .annotations()
        .get(EXTERNAL_NAME_ANNOTATION)
        .filter(|name| !name.is_empty())
        .cloned()
        .unwrap_or_else(|| resource.name_any())
}

impl System {
    /// Identifier of the system on the remote side
    #[must_use]
    pub fn external_name(&self) -> String {
        external_name_of(self)
    }
}

impl Stack {
    /// Identifier of the stack on the remote side
    #[must_use]
    pub fn external_name(&self) -> String {
        external_name_of(self)
    }
}
