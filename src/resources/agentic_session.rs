use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::utils::Condition as ConditionTrait;

/// Arbitrary, schema-unconstrained JSON used only for the free-form
/// environment-variable passthrough map. Kept narrow (see SPEC_FULL.md,
/// "Design Notes") rather than letting the whole spec degrade to dynamic
/// typing the way the source implementation does.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct EnvironmentVariables(pub BTreeMap<String, String>);

impl JsonSchema for EnvironmentVariables {
    fn schema_name() -> String {
        "EnvironmentVariables".to_string()
    }

    fn json_schema(r#gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        <BTreeMap<String, String> as JsonSchema>::json_schema(r#gen)
    }
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "vteam.ambient-code",
    version = "v1alpha1",
    kind = "AgenticSession",
    namespaced,
    status = "AgenticSessionStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"ReposReconciled","type":"string","jsonPath":".status.conditions[?(@.type==\"ReposReconciled\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionSpec {
    /// Only consumed on the first runner invocation.
    pub initial_prompt: String,

    /// Ordered list of repositories that must be present in the workspace.
    #[serde(default)]
    pub repos: Vec<RepoSpec>,

    /// The currently desired workflow, if any.
    pub active_workflow: Option<WorkflowSpec>,

    #[serde(default)]
    pub llm_settings: LlmSettings,

    /// When true the session is expected to remain alive after the initial prompt.
    #[serde(default)]
    pub interactive: bool,

    /// Seconds budget for the runner.
    pub timeout: i64,

    #[serde(default)]
    pub environment_variables: EnvironmentVariables,

    pub user_context: Option<UserContext>,

    pub main_repo_name: Option<String>,
    pub main_repo_index: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

impl RepoSpec {
    pub fn branch_or_default(&self) -> &str {
        self.branch.as_deref().unwrap_or("main")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub git_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub path: String,
}

impl WorkflowSpec {
    pub fn branch_or_default(&self) -> &str {
        self.branch.as_deref().unwrap_or("main")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettings {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Creating,
    Running,
    Completed,
    Failed,
    Stopped,
    Stopping,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Stopped)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionStatus {
    pub phase: Option<Phase>,
    pub observed_generation: Option<i64>,

    #[serde(with = "crate::resources::custom_rfc3339", default)]
    #[schemars(with = "Option<String>")]
    pub start_time: Option<DateTime<FixedOffset>>,

    #[serde(with = "crate::resources::custom_rfc3339", default)]
    #[schemars(with = "Option<String>")]
    pub completion_time: Option<DateTime<FixedOffset>>,

    #[serde(default)]
    pub reconciled_repos: Vec<ReconciledRepo>,

    pub reconciled_workflow: Option<ReconciledWorkflow>,

    #[serde(default)]
    pub conditions: Vec<AgenticSessionCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum RepoStatusValue {
    #[default]
    Ready,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledRepo {
    pub url: String,
    pub branch: String,
    pub status: RepoStatusValue,

    #[serde(with = "crate::resources::custom_rfc3339", default)]
    #[schemars(with = "Option<String>")]
    pub cloned_at: Option<DateTime<FixedOffset>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledWorkflow {
    pub git_url: String,
    pub branch: String,
    pub path: String,

    #[serde(with = "crate::resources::custom_rfc3339", default)]
    #[schemars(with = "Option<String>")]
    pub applied_at: Option<DateTime<FixedOffset>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,

    #[serde(with = "crate::resources::custom_rfc3339", default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<FixedOffset>>,

    pub observed_generation: Option<i64>,
}

impl ConditionTrait for AgenticSessionCondition {
    fn type_(&self) -> &str {
        &self.type_
    }

    fn status(&self) -> &str {
        &self.status
    }

    fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_spec() {
        let yaml = r#"
apiVersion: vteam.ambient-code/v1alpha1
kind: AgenticSession
metadata:
  name: demo
  namespace: proj
spec:
  initialPrompt: "hello"
  repos:
    - url: "https://g/r"
      branch: main
  interactive: true
  timeout: 600
  llmSettings:
    model: sonnet
    temperature: 0.2
    maxTokens: 1000
"#;
        let session: AgenticSession = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(session.spec.initial_prompt, "hello");
        assert_eq!(session.spec.repos.len(), 1);
        assert_eq!(session.spec.repos[0].branch_or_default(), "main");
        assert!(session.spec.interactive);
        assert_eq!(session.spec.timeout, 600);
    }

    #[test]
    fn branch_defaults_to_main_when_absent() {
        let repo = RepoSpec {
            url: "https://g/r".into(),
            branch: None,
        };
        assert_eq!(repo.branch_or_default(), "main");
    }

    #[test]
    fn status_round_trips_phase_and_conditions() {
        let status = AgenticSessionStatus {
            phase: Some(Phase::Running),
            observed_generation: Some(3),
            conditions: vec![AgenticSessionCondition {
                type_: "Ready".into(),
                status: "True".into(),
                reason: Some("RunnerStarted".into()),
                message: None,
                last_transition_time: None,
                observed_generation: Some(3),
            }],
            ..Default::default()
        };

        let json = serde_json::to_string(&status).unwrap();
        let parsed: AgenticSessionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.phase, Some(Phase::Running));
        assert_eq!(parsed.conditions.len(), 1);
    }
}
