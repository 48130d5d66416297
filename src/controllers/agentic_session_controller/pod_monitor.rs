//! Per-(namespace, job) pod monitor (spec.md §4.6): once a job is created,
//! a dedicated tokio task polls its pod's container statuses every
//! `monitor_tick_interval` and maps them onto `AgenticSession` phase and
//! conditions, until the job reaches a terminal state and is cleaned up.

use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{Pod, Secret, Service, ServiceAccount},
};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, PropagationPolicy},
};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    config::OperatorConfig,
    labels,
    resources::{AgenticSession, Phase},
};

use super::{
    secrets::{self, LANGFUSE_SECRET_NAME, VERTEX_SECRET_NAME},
    status::{ConditionStatus, StatusPatch},
    token,
};

/// Tracks which (namespace, job) pairs already have a monitor task running
/// so a reconcile tick never spawns a duplicate.
#[derive(Default, Clone)]
pub struct MonitorRegistry {
    inflight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call newly claimed the slot (caller should spawn).
    pub fn try_claim(&self, namespace: &str, job_name: &str) -> bool {
        self.inflight
            .lock()
            .insert((namespace.to_string(), job_name.to_string()))
    }

    pub fn release(&self, namespace: &str, job_name: &str) {
        self.inflight
            .lock()
            .remove(&(namespace.to_string(), job_name.to_string()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodOutcome {
    StillRunning,
    RunnerRunning,
    Succeeded,
    FailedWaiting { reason: String },
    FailedExitCode(i32),
}

/// Maps a pod's container statuses onto an outcome, per spec.md §4.6 step 6:
/// a permanent `Waiting` reason never self-resolves and is reported
/// verbatim as the `Failed` condition's reason.
pub fn classify_pod(pod: &Pod) -> PodOutcome {
    const PERMANENT_WAITING_REASONS: &[&str] = &[
        "ImagePullBackOff",
        "ErrImagePull",
        "CrashLoopBackOff",
        "CreateContainerConfigError",
        "InvalidImageName",
    ];

    let Some(status) = &pod.status else {
        return PodOutcome::StillRunning;
    };
    let Some(container_statuses) = &status.container_statuses else {
        return PodOutcome::StillRunning;
    };

    for container in container_statuses {
        if let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            if let Some(reason) = &waiting.reason {
                if PERMANENT_WAITING_REASONS.contains(&reason.as_str()) {
                    return PodOutcome::FailedWaiting {
                        reason: reason.clone(),
                    };
                }
            }
        }
    }

    for container in container_statuses {
        if container.name != "ambient-code-runner" {
            continue;
        }
        if let Some(terminated) = container.state.as_ref().and_then(|s| s.terminated.as_ref()) {
            return if terminated.exit_code == 0 {
                PodOutcome::Succeeded
            } else {
                PodOutcome::FailedExitCode(terminated.exit_code)
            };
        }
        if container
            .state
            .as_ref()
            .and_then(|s| s.running.as_ref())
            .is_some()
        {
            return PodOutcome::RunnerRunning;
        }
    }

    PodOutcome::StillRunning
}

fn now() -> chrono::DateTime<chrono::FixedOffset> {
    chrono::Utc::now().fixed_offset()
}

pub async fn run_monitor(
    client: Client,
    namespace: String,
    session_name: String,
    job_name: String,
    config: OperatorConfig,
    registry: MonitorRegistry,
) {
    let sessions: Api<AgenticSession> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let secrets_api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let service_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);

    let mut ticker = tokio::time::interval(config.monitor_tick_interval);
    loop {
        ticker.tick().await;

        // Step 1: re-fetch the session; exit once gone or already Stopped
        // (a user-initiated stop wins over any late pod observation).
        let Some(session) = sessions.get_opt(&session_name).await.ok().flatten() else {
            break;
        };
        let current_phase = session.status.as_ref().and_then(|s| s.phase.clone());
        if matches!(current_phase, Some(Phase::Stopped)) {
            break;
        }

        // Step 2: runner token freshness (spec.md §4.8, I7, P5).
        if let Err(err) =
            token::ensure_token_freshness(&service_accounts, &secrets_api, &session, &config).await
        {
            warn!(session = %session_name, error = %err, "token freshness check failed");
        }

        let generation = session.metadata.generation.unwrap_or(0);
        let mut patch = StatusPatch::new(session.status.clone().unwrap_or_default(), generation);

        // Step 3/4: re-fetch the Job and check its terminal counters first.
        let job = match jobs.get_opt(&job_name).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(err) => {
                warn!(job = %job_name, error = %err, "pod monitor job lookup failed");
                continue;
            }
        };
        let job_status = job.status.clone().unwrap_or_default();

        if job_status.succeeded.unwrap_or(0) > 0 {
            patch.set_phase(Phase::Completed);
            patch.set_completion_time(now());
            patch.add_condition("Ready", ConditionStatus::False, Some("Completed"), None);
            patch.set_spec_interactive(true);
            finish(
                &sessions,
                &session,
                patch,
                &jobs,
                &services,
                &pods,
                &secrets_api,
                &session_name,
                &job_name,
            )
            .await;
            break;
        }

        if job_status.failed.unwrap_or(0) >= config.job_backoff_limit {
            patch.set_phase(Phase::Failed);
            patch.set_completion_time(now());
            patch.add_condition(
                "Failed",
                ConditionStatus::True,
                Some("BackoffLimitExceeded"),
                None,
            );
            finish(
                &sessions,
                &session,
                patch,
                &jobs,
                &services,
                &pods,
                &secrets_api,
                &session_name,
                &job_name,
            )
            .await;
            break;
        }

        // Step 5: a missing pod with no active/succeeded/failed counts on
        // the Job is a permanent loss (I4); otherwise the pod simply hasn't
        // been scheduled yet this tick.
        let list = match pods
            .list(&ListParams::default().labels(&labels::job_name_selector(&session_name)))
            .await
        {
            Ok(list) => list,
            Err(err) => {
                warn!(session = %session_name, error = %err, "pod monitor list failed");
                continue;
            }
        };

        let Some(pod) = list.items.into_iter().next() else {
            let has_counts = job_status.active.unwrap_or(0) > 0
                || job_status.succeeded.unwrap_or(0) > 0
                || job_status.failed.unwrap_or(0) > 0;
            if has_counts {
                continue;
            }
            patch.set_phase(Phase::Failed);
            patch.set_completion_time(now());
            patch.add_condition("Failed", ConditionStatus::True, Some("PodMissing"), None);
            finish(
                &sessions,
                &session,
                patch,
                &jobs,
                &services,
                &pods,
                &secrets_api,
                &session_name,
                &job_name,
            )
            .await;
            break;
        };

        // Step 6: inspect the runner container.
        match classify_pod(&pod) {
            PodOutcome::StillRunning => continue,
            PodOutcome::RunnerRunning => {
                if current_phase.as_ref().map(Phase::is_terminal).unwrap_or(false) {
                    continue;
                }
                patch.set_phase(Phase::Running);
                patch.add_condition("RunnerStarted", ConditionStatus::True, None, None);
                patch.add_condition("Ready", ConditionStatus::True, None, None);
                if let Err(err) = patch.apply(&sessions, &session).await {
                    warn!(session = %session_name, error = %err, "failed to persist running status");
                }
            }
            PodOutcome::Succeeded => {
                patch.set_phase(Phase::Completed);
                patch.set_completion_time(now());
                patch.add_condition("Ready", ConditionStatus::False, Some("Completed"), None);
                finish(
                    &sessions,
                    &session,
                    patch,
                    &jobs,
                    &services,
                    &pods,
                    &secrets_api,
                    &session_name,
                    &job_name,
                )
                .await;
                break;
            }
            PodOutcome::FailedWaiting { reason } => {
                patch.set_phase(Phase::Failed);
                patch.set_completion_time(now());
                patch.add_condition(
                    "Failed",
                    ConditionStatus::True,
                    Some(&reason),
                    Some(&format!("runner container waiting: {reason}")),
                );
                finish(
                    &sessions,
                    &session,
                    patch,
                    &jobs,
                    &services,
                    &pods,
                    &secrets_api,
                    &session_name,
                    &job_name,
                )
                .await;
                break;
            }
            PodOutcome::FailedExitCode(2) => {
                patch.set_phase(Phase::Failed);
                patch.set_completion_time(now());
                patch.add_condition(
                    "Failed",
                    ConditionStatus::True,
                    Some("PrerequisiteFailed"),
                    Some("runner exited with code 2"),
                );
                finish(
                    &sessions,
                    &session,
                    patch,
                    &jobs,
                    &services,
                    &pods,
                    &secrets_api,
                    &session_name,
                    &job_name,
                )
                .await;
                break;
            }
            PodOutcome::FailedExitCode(code) => {
                patch.set_phase(Phase::Failed);
                patch.set_completion_time(now());
                patch.add_condition(
                    "Failed",
                    ConditionStatus::True,
                    Some("RunnerExit"),
                    Some(&format!("runner exited with code {code}")),
                );
                finish(
                    &sessions,
                    &session,
                    patch,
                    &jobs,
                    &services,
                    &pods,
                    &secrets_api,
                    &session_name,
                    &job_name,
                )
                .await;
                break;
            }
        }
    }

    registry.release(&namespace, &job_name);
}

/// Persists the terminal status patch, then runs the cleanup contract.
#[allow(clippy::too_many_arguments)]
async fn finish(
    sessions: &Api<AgenticSession>,
    session: &AgenticSession,
    patch: StatusPatch,
    jobs: &Api<Job>,
    services: &Api<Service>,
    pods: &Api<Pod>,
    secrets_api: &Api<Secret>,
    session_name: &str,
    job_name: &str,
) {
    if let Err(err) = patch.apply(sessions, session).await {
        warn!(session = %session_name, error = %err, "failed to persist terminal status");
    }
    cleanup_job_and_service(jobs, services, pods, secrets_api, session_name, job_name).await;
    info!(session = %session_name, job = %job_name, "pod monitor reached terminal state, exiting");
}

/// `deleteJobAndPerJobService` (spec.md §4.6 cleanup contract): the per-job
/// Service, the Job itself (background propagation), any orphan pods still
/// carrying the job's label, and best-effort removal of the copied platform
/// secrets this session owns. The workspace PVC is intentionally preserved
/// to support a restart.
async fn cleanup_job_and_service(
    jobs: &Api<Job>,
    services: &Api<Service>,
    pods: &Api<Pod>,
    secrets_api: &Api<Secret>,
    session_name: &str,
    job_name: &str,
) {
    let service_name = labels::per_job_service_name(session_name);
    if let Err(err) = services.delete(&service_name, &DeleteParams::default()).await {
        if !is_not_found(&err) {
            warn!(service = %service_name, error = %err, "failed to delete per-job service");
        }
    }

    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };
    if let Err(err) = jobs.delete(job_name, &params).await {
        if !is_not_found(&err) {
            warn!(job = %job_name, error = %err, "failed to delete job");
        }
    }

    match pods
        .list(&ListParams::default().labels(&labels::job_name_selector(session_name)))
        .await
    {
        Ok(list) => {
            for pod in list.items {
                let Some(pod_name) = pod.metadata.name else {
                    continue;
                };
                if let Err(err) = pods.delete(&pod_name, &DeleteParams::default()).await {
                    if !is_not_found(&err) {
                        warn!(pod = %pod_name, error = %err, "failed to delete orphan pod");
                    }
                }
            }
        }
        Err(err) => warn!(job = %job_name, error = %err, "failed to list orphan pods for cleanup"),
    }

    for name in [VERTEX_SECRET_NAME, LANGFUSE_SECRET_NAME] {
        if let Err(err) = secrets::delete_copy_if_owned(secrets_api, name).await {
            warn!(secret = %name, error = %err, "failed to delete copied secret");
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, PodStatus,
    };

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn classify_defaults_to_still_running_without_statuses() {
        assert_eq!(classify_pod(&Pod::default()), PodOutcome::StillRunning);
    }

    #[test]
    fn classify_detects_permanent_backoff_reasons() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "ambient-code-runner".into(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ImagePullBackOff".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            classify_pod(&pod),
            PodOutcome::FailedWaiting {
                reason: "ImagePullBackOff".into()
            }
        );
    }

    #[test]
    fn classify_detects_create_container_config_error() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "ambient-code-runner".into(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("CreateContainerConfigError".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            classify_pod(&pod),
            PodOutcome::FailedWaiting {
                reason: "CreateContainerConfigError".into()
            }
        );
    }

    #[test]
    fn classify_maps_runner_exit_code() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "ambient-code-runner".into(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 2,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(classify_pod(&pod), PodOutcome::FailedExitCode(2));
    }

    #[test]
    fn classify_succeeded_on_zero_exit() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "ambient-code-runner".into(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 0,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(classify_pod(&pod), PodOutcome::Succeeded);
    }

    #[test]
    fn classify_detects_runner_running() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "ambient-code-runner".into(),
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(classify_pod(&pod), PodOutcome::RunnerRunning);
    }

    #[test]
    fn registry_prevents_duplicate_claims() {
        let registry = MonitorRegistry::new();
        assert!(registry.try_claim("ns", "job"));
        assert!(!registry.try_claim("ns", "job"));
        registry.release("ns", "job");
        assert!(registry.try_claim("ns", "job"));
    }
}
