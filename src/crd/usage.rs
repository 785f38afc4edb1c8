use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer held on every Usage while it may still pin a resource.
/// Stable across releases; changing it strands in-flight deletions.
pub const FINALIZER: &str = "usage.apiextensions.usageguard.io";

/// Marker label on a used resource while at least one Usage targets it.
pub const IN_USE_LABEL: &str = "usageguard.io/in-use";
pub const IN_USE_VALUE: &str = "true";

/// Label written by the composition engine on members of the same
/// composite parent. Read-only here; drives deletion ordering.
pub const COMPOSITE_LABEL: &str = "usageguard.io/composite";

/// A Usage declares that one resource (`by`) depends on another (`of`).
/// While the Usage exists the `of` resource cannot be deleted.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "apiextensions.usageguard.io",
    version = "v1alpha1",
    kind = "Usage",
    plural = "usages",
    status = "UsageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct UsageSpec {
    /// The used resource, whose deletion this Usage blocks.
    pub of: ResourceUse,
    /// The using resource, whose lifetime bounds this Usage. Absent for
    /// an unowned pin that holds until the Usage itself is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<ResourceUse>,
}

/// One side of a Usage relation. Exactly one of `resource_ref` and
/// `selector` is provided by the user; the resolver fills `resource_ref`
/// in when a selector was given.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUse {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ResourceSelector>,
}

impl ResourceUse {
    /// The concrete resource name, once known. `None` until the selector
    /// has been resolved.
    pub fn resolved_name(&self) -> Option<&str> {
        self.resource_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|n| !n.is_empty())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// Labels the candidate resource must carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    /// Restrict candidates to objects sharing this Usage's controlling
    /// owner, i.e. members of the same composite parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_controller_ref: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    Synced,
    Ready,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}
