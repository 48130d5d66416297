use std::{sync::Arc, time::Duration};

use futures_util::Stream;
use k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{Pod, Secret, Service, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};
use kube::{
    Api,
    api::PostParams,
    runtime::{Controller, controller::Action, reflector::ObjectRef, watcher},
};
use tracing::{debug, info, warn};

use crate::{
    config::OperatorConfig,
    controllers::reconcile_error::ReconcileError,
    gateway_client::GatewayClient,
    labels,
    resources::{AgenticSession, Phase},
};

use super::{
    decision::{self, CreationAction, Intent},
    drift,
    job_builder::{self, JobInputs},
    pod_monitor::{self, MonitorRegistry},
    secrets,
    status::{ConditionStatus, StatusPatch},
    temp_content, token,
};

struct ReconciliationContext {
    client: kube::Client,
    config: OperatorConfig,
    gateway: GatewayClient,
    monitors: MonitorRegistry,
}

pub fn new(
    client: kube::Client,
    config: OperatorConfig,
) -> impl Stream<
    Item = Result<
        (ObjectRef<AgenticSession>, Action),
        kube::runtime::controller::Error<ReconcileError, kube::runtime::watcher::Error>,
    >,
> {
    let gateway = GatewayClient::new(
        config.backend_service_base_url(),
        config.gateway_request_timeout,
    );
    let context = Arc::new(ReconciliationContext {
        client: client.clone(),
        config,
        gateway,
        monitors: MonitorRegistry::new(),
    });

    let sessions_api: Api<AgenticSession> = Api::all(client.clone());
    let jobs_api: Api<Job> = Api::all(client);

    Controller::new(sessions_api, watcher::Config::default())
        .owns(jobs_api, watcher::Config::default())
        .run(
            reconcile,
            |_, _, _| Action::requeue(Duration::from_secs(30)),
            context,
        )
}

async fn reconcile(
    object: Arc<AgenticSession>,
    context: Arc<ReconciliationContext>,
) -> Result<Action, ReconcileError> {
    if object.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = object
        .metadata
        .namespace
        .clone()
        .ok_or(ReconcileError::PreconditionFailed("namespace not set"))?;
    let name = object
        .metadata
        .name
        .clone()
        .ok_or(ReconcileError::PreconditionFailed("name not set"))?;
    let generation = object.metadata.generation.unwrap_or(0);

    let sessions_api = Api::<AgenticSession>::namespaced(context.client.clone(), &namespace);
    let jobs_api = Api::<Job>::namespaced(context.client.clone(), &namespace);
    let pods_api = Api::<Pod>::namespaced(context.client.clone(), &namespace);
    let secrets_api = Api::<Secret>::namespaced(context.client.clone(), &namespace);
    let backend_secrets_api =
        Api::<Secret>::namespaced(context.client.clone(), &context.config.backend_namespace);
    let service_accounts_api = Api::<ServiceAccount>::namespaced(context.client.clone(), &namespace);
    let roles_api = Api::<Role>::namespaced(context.client.clone(), &namespace);
    let role_bindings_api = Api::<RoleBinding>::namespaced(context.client.clone(), &namespace);

    let mut patch = StatusPatch::new(object.status.clone().unwrap_or_default(), generation);

    // Step 2: bootstrap.
    if decision::needs_bootstrap(patch.status().phase.as_ref()) {
        debug!(session = %name, "bootstrapping new session");
        patch.set_phase(Phase::Pending);
        patch.set_observed_generation(generation);
        patch.apply(&sessions_api, &object).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Step 3: desired-phase intent.
    let intent = decision::read_intent(object.metadata.annotations.as_ref());
    let current_phase = patch.status().phase.clone();

    match intent {
        Intent::Start if decision::should_act_on_start_intent(current_phase.as_ref()) => {
            info!(session = %name, "start intent observed from a terminal phase, restarting");

            temp_content::delete_temp_content_pod(&pods_api, &name).await?;

            let job_name = labels::job_name(&name);
            jobs_api
                .delete(&job_name, &kube::api::DeleteParams::default())
                .await
                .map(|_| ())
                .or_else(ignore_not_found)?;

            let is_continuation = object
                .metadata
                .annotations
                .as_ref()
                .map(|a| a.contains_key(labels::annotation::PARENT_SESSION_ID))
                .unwrap_or(false);
            if is_continuation {
                token::regenerate_token(&service_accounts_api, &secrets_api, &object).await?;
            }

            patch.set_phase(Phase::Pending);
            patch.set_start_time(chrono::Utc::now().fixed_offset());
            patch.clear_completion_time();
            patch.delete_annotation(labels::annotation::START_REQUESTED_AT);
            // desired-phase is deliberately left set: clearing it here would let a
            // stale Modified event race back in and act on the pre-restart phase.
            // It is only cleared once the new Job has actually been created.
            patch.apply(&sessions_api, &object).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        Intent::Stop if decision::should_act_on_stop_intent(current_phase.as_ref()) => {
            info!(session = %name, "stop intent observed, entering stopping");
            patch.set_phase(Phase::Stopping);
            patch.delete_annotation(labels::annotation::DESIRED_PHASE);
            patch.apply(&sessions_api, &object).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        _ => {}
    }

    // Step 4: stopping handler.
    if matches!(current_phase, Some(Phase::Stopping)) {
        let job_name = labels::job_name(&name);
        let job_exists = jobs_api.get_opt(&job_name).await?.is_some();
        if decision::stopping_is_complete(job_exists) {
            patch.set_phase(Phase::Stopped);
            patch.set_completion_time(chrono::Utc::now().fixed_offset());
            patch.apply(&sessions_api, &object).await?;
            return Ok(Action::requeue(Duration::from_secs(3600)));
        }
        jobs_api
            .delete(&job_name, &kube::api::DeleteParams::default())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)?;
        return Ok(Action::requeue(Duration::from_secs(3)));
    }

    // Step 5: temp-content reconciliation; terminal phases (and Pending with
    // nothing requested) stop the tick here.
    if decision::temp_content_phase_applies(current_phase.as_ref()) {
        let temp_content_requested = object
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(labels::annotation::TEMP_CONTENT_REQUESTED))
            .unwrap_or(false);

        if temp_content_requested {
            temp_content::create_temp_content_pod(&pods_api, &object, &context.config).await?;
        } else {
            temp_content::delete_temp_content_pod(&pods_api, &name).await?;
        }

        if decision::temp_content_short_circuits_tick(current_phase.as_ref()) {
            return Ok(Action::requeue(Duration::from_secs(15)));
        }
    }

    // Step 8: running sessions only run drift reconciliation.
    if decision::is_running(current_phase.as_ref()) {
        let repos_ok = drift::reconcile_repo_drift(&object, &context.gateway, &mut patch).await;
        let workflow_ok = drift::reconcile_workflow_drift(&object, &context.gateway, &mut patch).await;

        patch.add_condition(
            "ReposReconciled",
            if repos_ok { ConditionStatus::True } else { ConditionStatus::False },
            Some(if repos_ok { "Reconciled" } else { "MessageFailed" }),
            None,
        );
        patch.add_condition(
            "WorkflowReconciled",
            if workflow_ok { ConditionStatus::True } else { ConditionStatus::False },
            Some(if workflow_ok { "Reconciled" } else { "MessageFailed" }),
            None,
        );
        if repos_ok && workflow_ok {
            patch.set_observed_generation(generation);
        }
        patch.apply(&sessions_api, &object).await?;

        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    // Steps 6-7: pending/creating session needs its job created (or just its
    // monitor resumed, if a Job from a prior tick already exists).
    let job_name = labels::job_name(&name);
    let job_exists = jobs_api.get_opt(&job_name).await?.is_some();

    match decision::decide_creation_action(current_phase.as_ref(), job_exists) {
        CreationAction::ResumeMonitoring => {
            if context.monitors.try_claim(&namespace, &job_name) {
                tokio::spawn(pod_monitor::run_monitor(
                    context.client.clone(),
                    namespace.clone(),
                    name.clone(),
                    job_name,
                    context.config.clone(),
                    context.monitors.clone(),
                ));
            }
            patch.set_observed_generation(generation);
            patch.apply(&sessions_api, &object).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        CreationAction::CreateJob => {
            // Either a fresh Pending session, or a Creating one whose Job
            // vanished (spec.md §4.2 step 8) — both recreate the Job below.
            secrets::copy_vertex_secret(&backend_secrets_api, &secrets_api, &context.config).await?;
            secrets::copy_langfuse_secret(&backend_secrets_api, &secrets_api, &context.config).await;

            token::ensure_runner_identity(
                token::TokenClients {
                    service_accounts: &service_accounts_api,
                    roles: &roles_api,
                    role_bindings: &role_bindings_api,
                    secrets: &secrets_api,
                },
                &object,
                &context.config,
            )
            .await?;

            let pvc_name = labels::workspace_pvc_name(&name);
            let pvcs_api = Api::<k8s_openapi::api::core::v1::PersistentVolumeClaim>::namespaced(
                context.client.clone(),
                &namespace,
            );
            let pvc = job_builder::build_pvc(&object, &pvc_name)?;
            if pvcs_api.get_opt(&pvc_name).await?.is_none() {
                pvcs_api.create(&PostParams::default(), &pvc).await?;
            }

            // RWO PVC mutual exclusion: a leftover temp-content pod must be fully
            // gone before the runner pod can mount the same volume.
            temp_content::delete_temp_content_pod(&pods_api, &name).await?;

            let job = job_builder::build_job(JobInputs {
                session: &object,
                config: &context.config,
                workspace_pvc_name: &pvc_name,
                integration_secret_name: None,
                langfuse_secret_name: None,
            })?;
            let built_job_name = job
                .metadata
                .name
                .clone()
                .ok_or(ReconcileError::PreconditionFailed("job has no name"))?;

            jobs_api.create(&PostParams::default(), &job).await?;

            let service = job_builder::build_per_job_service(&object, &job)?;
            let services_api = Api::<Service>::namespaced(context.client.clone(), &namespace);
            if let Err(err) = services_api.create(&PostParams::default(), &service).await {
                warn!(session = %name, error = %err, "failed to create per-job service");
            }

            if context.monitors.try_claim(&namespace, &built_job_name) {
                tokio::spawn(pod_monitor::run_monitor(
                    context.client.clone(),
                    namespace.clone(),
                    name.clone(),
                    built_job_name,
                    context.config.clone(),
                    context.monitors.clone(),
                ));
            }

            patch.set_phase(Phase::Creating);
            patch.set_observed_generation(generation);
            patch.add_condition("Ready", ConditionStatus::Unknown, Some("JobCreated"), None);
            // Only now is it safe to clear desired-phase: the new Job exists, so a
            // stale Modified event can no longer race back onto the old phase.
            patch.delete_annotation(labels::annotation::DESIRED_PHASE);
            patch.apply(&sessions_api, &object).await?;

            Ok(Action::requeue(Duration::from_secs(5)))
        }
    }
}

fn ignore_not_found(err: kube::Error) -> Result<(), kube::Error> {
    match err {
        kube::Error::Api(response) if response.code == 404 => Ok(()),
        other => Err(other),
    }
}
