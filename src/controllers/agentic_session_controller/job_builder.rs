//! Job construction (spec.md §4.3): one init container plus the
//! `ambient-content` and `ambient-code-runner` main containers, wired to the
//! per-session PVC and runner token, with the four-layer environment
//! described in the spec applied in override order.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{batch::v1::Job, core::v1 as corev1},
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::OwnerReference},
};

use crate::{
    config::OperatorConfig,
    controllers::reconcile_error::ReconcileError,
    labels, resources,
};

use resources::AgenticSession;

pub struct JobInputs<'a> {
    pub session: &'a AgenticSession,
    pub config: &'a OperatorConfig,
    pub workspace_pvc_name: &'a str,
    pub integration_secret_name: Option<&'a str>,
    pub langfuse_secret_name: Option<&'a str>,
}

pub fn build_job(inputs: JobInputs<'_>) -> Result<Job, ReconcileError> {
    let session = inputs.session;
    let namespace = session
        .metadata
        .namespace
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("namespace not set"))?;
    let name = session
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("name not set"))?;
    let uid = session
        .metadata
        .uid
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("uid not set"))?;

    let job_name = labels::job_name(name);
    let config = inputs.config;

    let init_container = corev1::Container {
        name: "workspace-init".into(),
        image: Some(config.runner_image.clone()),
        command: Some(vec!["sh".into(), "-c".into()]),
        args: Some(vec![format!(
            "mkdir -p /workspace/sessions/{name}/workspace && chmod 0777 /workspace/sessions/{name}/workspace"
        )]),
        volume_mounts: Some(vec![workspace_volume_mount()]),
        ..Default::default()
    };

    let content_container = corev1::Container {
        name: "ambient-content".into(),
        image: Some(config.content_service_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        ports: Some(vec![corev1::ContainerPort {
            container_port: 8080,
            ..Default::default()
        }]),
        readiness_probe: Some(corev1::Probe {
            http_get: Some(corev1::HTTPGetAction {
                path: Some("/health".into()),
                port: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(8080),
                ..Default::default()
            }),
            ..Default::default()
        }),
        env: Some(vec![env_var("STATE_BASE_DIR", "/workspace")]),
        volume_mounts: Some(vec![workspace_volume_mount()]),
        ..Default::default()
    };

    let runner_env = build_runner_env(session, config, name, namespace);
    let mut env_from = Vec::new();
    if let Some(secret_name) = inputs.integration_secret_name {
        env_from.push(corev1::EnvFromSource {
            secret_ref: Some(corev1::SecretEnvSource {
                name: secret_name.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        });
    }
    let _ = inputs.langfuse_secret_name; // referenced via per-key secretKeyRef below

    let mut runner_volume_mounts = vec![workspace_volume_mount(), sdk_state_volume_mount(name)];
    let mut runner_volumes = vec![
        workspace_volume(inputs.workspace_pvc_name),
        sdk_state_volume(name),
    ];

    if config.vertex_enabled {
        runner_volume_mounts.push(corev1::VolumeMount {
            name: "vertex-credentials".into(),
            mount_path: "/app/vertex".into(),
            read_only: Some(true),
            ..Default::default()
        });
        runner_volumes.push(corev1::Volume {
            name: "vertex-credentials".into(),
            secret: Some(corev1::SecretVolumeSource {
                secret_name: Some(super::secrets::VERTEX_SECRET_NAME.into()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let runner_container = corev1::Container {
        name: "ambient-code-runner".into(),
        image: Some(config.runner_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        env: Some(runner_env),
        env_from: Some(env_from),
        volume_mounts: Some(runner_volume_mounts),
        security_context: Some(corev1::SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(corev1::Capabilities {
                drop: Some(vec!["ALL".into()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut volumes = vec![];
    volumes.append(&mut runner_volumes);

    let mut job_labels = BTreeMap::new();
    job_labels.insert(labels::JOB_NAME_LABEL.to_string(), job_name.clone());

    let pod_spec = corev1::PodSpec {
        restart_policy: Some("Never".into()),
        init_containers: Some(vec![init_container]),
        containers: vec![content_container, runner_container],
        volumes: Some(volumes),
        ..Default::default()
    };

    let job = Job {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(job_name),
            namespace: Some(namespace.to_string()),
            labels: Some(job_labels.clone()),
            owner_references: Some(vec![OwnerReference {
                api_version: "vteam.ambient-code/v1alpha1".into(),
                kind: "AgenticSession".into(),
                name: name.to_string(),
                uid: uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::batch::v1::JobSpec {
            backoff_limit: Some(config.job_backoff_limit),
            active_deadline_seconds: Some(config.job_active_deadline.as_secs() as i64),
            ttl_seconds_after_finished: Some(config.job_ttl_after_finished.as_secs() as i32),
            template: corev1::PodTemplateSpec {
                metadata: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    labels: Some(job_labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    };

    Ok(job)
}

fn build_runner_env(
    session: &AgenticSession,
    config: &OperatorConfig,
    name: &str,
    namespace: &str,
) -> Vec<corev1::EnvVar> {
    let spec = &session.spec;
    let mut env: Vec<corev1::EnvVar> = Vec::new();

    // (a) operator-computed base
    env.push(env_var("SESSION_ID", name));
    env.push(env_var("SESSION_NAMESPACE", namespace));
    env.push(env_var(
        "WORKSPACE_PATH",
        format!("/workspace/sessions/{name}/workspace"),
    ));
    env.push(env_var(
        "ARTIFACTS_DIR",
        format!("/workspace/sessions/{name}/artifacts"),
    ));
    env.push(env_var("TIMEOUT_SECONDS", spec.timeout.to_string()));
    if let Some(model) = &spec.llm_settings.model {
        env.push(env_var("LLM_MODEL", model));
    }
    if let Some(temperature) = spec.llm_settings.temperature {
        env.push(env_var("LLM_TEMPERATURE", temperature.to_string()));
    }
    if let Some(max_tokens) = spec.llm_settings.max_tokens {
        env.push(env_var("LLM_MAX_TOKENS", max_tokens.to_string()));
    }
    env.push(env_var("BACKEND_URL", config.backend_service_base_url()));
    env.push(env_var(
        "BACKEND_WS_URL",
        format!(
            "{}/api/projects/{namespace}/sessions/{name}/ws",
            config.backend_websocket_base_url()
        ),
    ));
    if let Some(user_context) = &spec.user_context {
        if let Some(user_id) = &user_context.user_id {
            env.push(env_var("USER_ID", user_id));
        }
        if let Some(display_name) = &user_context.display_name {
            env.push(env_var("USER_DISPLAY_NAME", display_name));
        }
    }
    if !spec.interactive {
        env.push(env_var("INITIAL_PROMPT", &spec.initial_prompt));
    } else {
        env.push(env_var("INITIAL_PROMPT", &spec.initial_prompt));
        env.push(env_var("INTERACTIVE", "true"));
    }

    // (b) per-repo REPO_i_URL / REPO_i_BRANCH plus back-compat INPUT_*/OUTPUT_*
    // pointed at whichever repo mainRepoName/mainRepoIndex designates (index
    // 0 when neither is set).
    let main_repo_index = main_repo_index(spec);
    for (index, repo) in spec.repos.iter().enumerate() {
        env.push(env_var(format!("REPO_{index}_URL"), &repo.url));
        env.push(env_var(format!("REPO_{index}_BRANCH"), repo.branch_or_default()));
        if Some(index) == main_repo_index {
            env.push(env_var("INPUT_REPO_URL", &repo.url));
            env.push(env_var("INPUT_REPO_BRANCH", repo.branch_or_default()));
            env.push(env_var("OUTPUT_REPO_URL", &repo.url));
            env.push(env_var("OUTPUT_REPO_BRANCH", repo.branch_or_default()));
        }
    }

    // (c) optional secret refs for Langfuse keys, each optional so a
    // missing key never fails pod startup
    if config.langfuse_enabled {
        for (env_name, secret_key) in [
            ("LANGFUSE_PUBLIC_KEY", "public-key"),
            ("LANGFUSE_SECRET_KEY", "secret-key"),
            ("LANGFUSE_HOST", "host"),
        ] {
            env.push(corev1::EnvVar {
                name: env_name.into(),
                value_from: Some(corev1::EnvVarSource {
                    secret_key_ref: Some(corev1::SecretKeySelector {
                        name: super::secrets::LANGFUSE_SECRET_NAME.into(),
                        key: secret_key.into(),
                        optional: Some(true),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    // (d) optional Vertex block and PARENT_SESSION_ID
    if config.vertex_enabled {
        env.push(env_var("CLAUDE_CODE_USE_VERTEX", "1"));
        if let Some(project_id) = &config.vertex_project_id {
            env.push(env_var("VERTEX_PROJECT_ID", project_id));
        }
        if let Some(region) = &config.vertex_region {
            env.push(env_var("VERTEX_REGION", region));
        }
    }
    if let Some(parent_id) = session
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::annotation::PARENT_SESSION_ID))
    {
        env.push(env_var("PARENT_SESSION_ID", parent_id));
    }

    // (e) runner token secret exposed as BOT_TOKEN
    env.push(corev1::EnvVar {
        name: "BOT_TOKEN".into(),
        value_from: Some(corev1::EnvVarSource {
            secret_key_ref: Some(corev1::SecretKeySelector {
                name: labels::runner_token_secret_name(name),
                key: "k8s-token".into(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    // (f) spec-declared environmentVariables applied last with name-based override
    let mut by_name: BTreeMap<String, corev1::EnvVar> =
        env.into_iter().map(|e| (e.name.clone(), e)).collect();
    for (key, value) in &spec.environment_variables.0 {
        by_name.insert(key.clone(), env_var(key, value));
    }

    by_name.into_values().collect()
}

/// Resolves `mainRepoName`/`mainRepoIndex` to a concrete index into
/// `spec.repos`, defaulting to the first repo when neither is set and
/// falling back gracefully when a name doesn't match anything.
fn main_repo_index(spec: &crate::resources::AgenticSessionSpec) -> Option<usize> {
    if let Some(index) = spec.main_repo_index {
        if index >= 0 && (index as usize) < spec.repos.len() {
            return Some(index as usize);
        }
    }
    if let Some(name) = &spec.main_repo_name {
        if let Some(index) = spec
            .repos
            .iter()
            .position(|r| labels::repo_display_name(&r.url) == *name)
        {
            return Some(index);
        }
    }
    if spec.repos.is_empty() { None } else { Some(0) }
}

fn env_var(name: impl Into<String>, value: impl Into<String>) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn workspace_volume(pvc_name: &str) -> corev1::Volume {
    corev1::Volume {
        name: "workspace".into(),
        persistent_volume_claim: Some(corev1::PersistentVolumeClaimVolumeSource {
            claim_name: pvc_name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn workspace_volume_mount() -> corev1::VolumeMount {
    corev1::VolumeMount {
        name: "workspace".into(),
        mount_path: "/workspace".into(),
        ..Default::default()
    }
}

fn sdk_state_volume(name: &str) -> corev1::Volume {
    let _ = name;
    corev1::Volume {
        name: "sdk-state".into(),
        empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn sdk_state_volume_mount(name: &str) -> corev1::VolumeMount {
    corev1::VolumeMount {
        name: "sdk-state".into(),
        mount_path: "/workspace/.sdk-state".into(),
        sub_path: Some(format!("sessions/{name}/.sdk-state")),
        ..Default::default()
    }
}

pub fn build_pvc(
    session: &AgenticSession,
    pvc_name: &str,
) -> Result<corev1::PersistentVolumeClaim, ReconcileError> {
    let namespace = session
        .metadata
        .namespace
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("namespace not set"))?;
    let name = session
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("name not set"))?;
    let uid = session
        .metadata
        .uid
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("uid not set"))?;

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity("5Gi".to_string()));

    Ok(corev1::PersistentVolumeClaim {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(pvc_name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "vteam.ambient-code/v1alpha1".into(),
                kind: "AgenticSession".into(),
                name: name.to_string(),
                uid: uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(corev1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(corev1::VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn build_per_job_service(
    session: &AgenticSession,
    job: &Job,
) -> Result<corev1::Service, ReconcileError> {
    let namespace = session
        .metadata
        .namespace
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("namespace not set"))?;
    let name = session
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcileError::PreconditionFailed("name not set"))?;
    let job_name = job
        .metadata
        .name
        .clone()
        .ok_or(ReconcileError::PreconditionFailed("job has no name"))?;
    let job_uid = job
        .metadata
        .uid
        .clone()
        .ok_or(ReconcileError::PreconditionFailed("job has no uid"))?;

    let mut selector = BTreeMap::new();
    selector.insert(labels::JOB_NAME_LABEL.to_string(), job_name.clone());

    Ok(corev1::Service {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(labels::per_job_service_name(name)),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "batch/v1".into(),
                kind: "Job".into(),
                name: job_name,
                uid: job_uid,
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(corev1::ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![corev1::ServicePort {
                port: 8080,
                target_port: Some(
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(8080),
                ),
                ..Default::default()
            }]),
            cluster_ip: Some("None".into()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{AgenticSessionSpec, LlmSettings, RepoSpec};

    fn session() -> AgenticSession {
        let mut session = AgenticSession::new(
            "demo",
            AgenticSessionSpec {
                initial_prompt: "hello".into(),
                repos: vec![RepoSpec {
                    url: "https://g/r".into(),
                    branch: Some("main".into()),
                }],
                llm_settings: LlmSettings {
                    model: Some("sonnet".into()),
                    temperature: Some(0.2),
                    max_tokens: Some(1000),
                },
                interactive: true,
                timeout: 600,
                ..Default::default()
            },
        );
        session.metadata.namespace = Some("proj".into());
        session.metadata.uid = Some("uid-1".into());
        session
    }

    fn config() -> OperatorConfig {
        OperatorConfig::from_env()
    }

    #[test]
    fn job_name_follows_session_job_convention() {
        let session = session();
        let job = build_job(JobInputs {
            session: &session,
            config: &config(),
            workspace_pvc_name: "ambient-workspace-demo",
            integration_secret_name: None,
            langfuse_secret_name: None,
        })
        .unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("demo-job"));
        assert_eq!(job.spec.as_ref().unwrap().backoff_limit, Some(3));
    }

    #[test]
    fn env_layers_override_in_order_with_spec_vars_winning() {
        let mut session = session();
        session
            .spec
            .environment_variables
            .0
            .insert("LLM_MODEL".into(), "overridden".into());

        let job = build_job(JobInputs {
            session: &session,
            config: &config(),
            workspace_pvc_name: "ambient-workspace-demo",
            integration_secret_name: None,
            langfuse_secret_name: None,
        })
        .unwrap();

        let runner = &job.spec.unwrap().template.spec.unwrap().containers[1];
        let model_var = runner
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "LLM_MODEL")
            .unwrap();
        assert_eq!(model_var.value.as_deref(), Some("overridden"));
    }

    #[test]
    fn per_repo_env_vars_are_generated() {
        let session = session();
        let job = build_job(JobInputs {
            session: &session,
            config: &config(),
            workspace_pvc_name: "ambient-workspace-demo",
            integration_secret_name: None,
            langfuse_secret_name: None,
        })
        .unwrap();

        let runner = &job.spec.unwrap().template.spec.unwrap().containers[1];
        let env = runner.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "REPO_0_URL"));
        assert!(env.iter().any(|e| e.name == "INPUT_REPO_URL"));
    }

    #[test]
    fn main_repo_index_honors_explicit_index_over_default() {
        let mut session = session();
        session.spec.repos.push(RepoSpec {
            url: "https://g/second".into(),
            branch: Some("main".into()),
        });
        session.spec.main_repo_index = Some(1);

        let job = build_job(JobInputs {
            session: &session,
            config: &config(),
            workspace_pvc_name: "ambient-workspace-demo",
            integration_secret_name: None,
            langfuse_secret_name: None,
        })
        .unwrap();

        let runner = &job.spec.unwrap().template.spec.unwrap().containers[1];
        let env = runner.env.as_ref().unwrap();
        let input_url = env.iter().find(|e| e.name == "INPUT_REPO_URL").unwrap();
        assert_eq!(input_url.value.as_deref(), Some("https://g/second"));
    }

    #[test]
    fn runner_container_drops_all_capabilities() {
        let session = session();
        let job = build_job(JobInputs {
            session: &session,
            config: &config(),
            workspace_pvc_name: "ambient-workspace-demo",
            integration_secret_name: None,
            langfuse_secret_name: None,
        })
        .unwrap();

        let runner = &job.spec.unwrap().template.spec.unwrap().containers[1];
        let security_context = runner.security_context.as_ref().unwrap();
        assert_eq!(security_context.allow_privilege_escalation, Some(false));
        assert_eq!(
            security_context.capabilities.as_ref().unwrap().drop,
            Some(vec!["ALL".to_string()])
        );
    }
}
