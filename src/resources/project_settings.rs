use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sibling resource to `AgenticSession`. Its full RBAC-reconciliation
/// behavior is explicitly out of scope for this core (see spec.md §1); only
/// the shape needed for namespace bootstrap to create a default instance is
/// modeled here.
#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "vteam.ambient-code",
    version = "v1alpha1",
    kind = "ProjectSettings",
    namespaced,
    status = "ProjectSettingsStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettingsSpec {
    #[serde(default)]
    pub groups: Vec<GroupAccess>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupAccess {
    pub name: String,
    pub role: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettingsStatus {
    pub reconciled: Option<bool>,
}

pub const DEFAULT_NAME: &str = "default";

pub fn default_instance(namespace: &str) -> ProjectSettings {
    let mut settings = ProjectSettings::new(DEFAULT_NAME, ProjectSettingsSpec::default());
    settings.metadata.namespace = Some(namespace.to_string());
    settings
}
