pub mod agentic_session;
pub mod custom_rfc3339;
pub mod project_settings;

pub use agentic_session::{
    AgenticSession, AgenticSessionCondition, AgenticSessionSpec, AgenticSessionStatus, LlmSettings,
    Phase, ReconciledRepo, ReconciledWorkflow, RepoSpec, RepoStatusValue, WorkflowSpec,
};
pub use project_settings::{ProjectSettings, ProjectSettingsSpec, ProjectSettingsStatus};
