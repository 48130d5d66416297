//! Label, annotation and finalizer constants shared across controllers.
//!
//! Grouped the way the teacher groups its `labels` module constants
//! (`PLAYBOOKPLAN_NAME`, `PLAYBOOKPLAN_HASH`, ...).

pub const MANAGED_NAMESPACE_LABEL: &str = "ambient-code.io/managed";
pub const MANAGED_NAMESPACE_VALUE: &str = "true";

pub const JOB_NAME_LABEL: &str = "job-name";
pub const TEMP_CONTENT_APP_LABEL: &str = "app";
pub const TEMP_CONTENT_APP_VALUE: &str = "temp-content-service";

pub const FIELD_MANAGER: &str = "agentic-session-operator";

pub mod annotation {
    pub const DESIRED_PHASE: &str = "ambient-code.io/desired-phase";
    pub const START_REQUESTED_AT: &str = "ambient-code.io/start-requested-at";
    pub const STOP_REQUESTED_AT: &str = "ambient-code.io/stop-requested-at";
    pub const PARENT_SESSION_ID: &str = "ambient-code.io/parent-session-id";
    pub const TEMP_CONTENT_REQUESTED: &str = "ambient-code.io/temp-content-requested";
    pub const TEMP_CONTENT_LAST_ACCESSED: &str = "ambient-code.io/temp-content-last-accessed";
    pub const RUNNER_TOKEN_SECRET: &str = "ambient-code.io/runner-token-secret";
    pub const RUNNER_SA: &str = "ambient-code.io/runner-sa";
    pub const RUNNER_PROGRESS: &str = "ambient-code.io/runner-progress";
    pub const SDK_SESSION_ID: &str = "ambient-code.io/sdk-session-id";
    pub const TOKEN_REFRESHED_AT: &str = "ambient-code.io/token-refreshed-at";
    pub const COPIED_FROM: &str = "ambient-code.io/copied-from";
}

pub fn workspace_pvc_name(session: &str) -> String {
    format!("ambient-workspace-{session}")
}

pub fn runner_token_secret_name(session: &str) -> String {
    format!("ambient-runner-token-{session}")
}

pub fn service_account_name(session: &str) -> String {
    format!("ambient-session-{session}")
}

pub fn job_name(session: &str) -> String {
    format!("{session}-job")
}

pub fn per_job_service_name(session: &str) -> String {
    format!("ambient-content-{session}")
}

pub fn temp_content_pod_name(session: &str) -> String {
    format!("temp-content-{session}")
}

pub fn job_name_selector(session: &str) -> String {
    format!("{JOB_NAME_LABEL}={}", job_name(session))
}

/// Derives a short display name from a repo URL (last path segment, no `.git`).
pub fn repo_display_name(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}
