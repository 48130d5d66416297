//! Temporary content pod (spec.md §4.4): a short-lived read-only preview
//! pod requested via the `temp-content-requested` annotation, torn down
//! either by the reconciler (on its own request flag flipping) or by the
//! sweeper once `temp-content-last-accessed` exceeds the configured TTL.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, PostParams},
};
use tracing::{info, warn};

use crate::{
    config::OperatorConfig, controllers::reconcile_error::ReconcileError, labels,
    resources::AgenticSession,
};

pub async fn create_temp_content_pod(
    api: &Api<Pod>,
    session: &AgenticSession,
    config: &OperatorConfig,
) -> Result<(), ReconcileError> {
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

    let pod_name = labels::temp_content_pod_name(name);
    if api.get_opt(&pod_name).await?.is_some() {
        return Ok(());
    }

    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(
        labels::TEMP_CONTENT_APP_LABEL.to_string(),
        labels::TEMP_CONTENT_APP_VALUE.to_string(),
    );
    pod_labels.insert(labels::JOB_NAME_LABEL.to_string(), pod_name.clone());

    let pod = Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: session.metadata.namespace.clone(),
            labels: Some(pod_labels),
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
        spec: Some(k8s_openapi::api::core::v1::PodSpec {
            restart_policy: Some("Never".into()),
            containers: vec![k8s_openapi::api::core::v1::Container {
                name: "content".into(),
                image: Some(config.content_service_image.clone()),
                image_pull_policy: Some(config.image_pull_policy.clone()),
                ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                    container_port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    };

    api.create(&PostParams::default(), &pod).await?;
    info!(pod = %pod_name, "created temp-content pod");
    Ok(())
}

pub async fn delete_temp_content_pod(api: &Api<Pod>, session_name: &str) -> Result<(), ReconcileError> {
    let pod_name = labels::temp_content_pod_name(session_name);
    match api.delete(&pod_name, &DeleteParams::default()).await {
        Ok(_) => {
            wait_for_pod_deletion(api, &pod_name, Duration::from_secs(10)).await;
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn wait_for_pod_deletion(api: &Api<Pod>, pod_name: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        match api.get_opt(pod_name).await {
            Ok(None) => return,
            Ok(Some(_)) => tokio::time::sleep(Duration::from_millis(500)).await,
            Err(_) => return,
        }
    }
    warn!(pod = %pod_name, "temp-content pod still present after deletion grace period");
}

/// Sweeper (§4.4): runs once per `sweeper_interval` across every namespace,
/// deleting temp-content pods whose `last-accessed` annotation is older
/// than the configured TTL. Stamping `last-accessed` itself is the content
/// service's responsibility, not the operator's (see DESIGN.md).
pub async fn run_sweeper(client: Client, config: OperatorConfig) {
    let mut ticker = tokio::time::interval(config.sweeper_interval);
    loop {
        ticker.tick().await;
        if let Err(err) = sweep_once(&client, &config).await {
            warn!(error = %err, "temp-content sweep failed");
        }
    }
}

async fn sweep_once(client: &Client, config: &OperatorConfig) -> Result<(), ReconcileError> {
    let pods: Api<Pod> = Api::all(client.clone());
    let list = pods
        .list(&ListParams::default().labels(&format!(
            "{}={}",
            labels::TEMP_CONTENT_APP_LABEL,
            labels::TEMP_CONTENT_APP_VALUE
        )))
        .await?;

    for pod in list {
        let Some(name) = pod.metadata.name.clone() else {
            continue;
        };
        let Some(namespace) = pod.metadata.namespace.clone() else {
            continue;
        };
        let last_accessed = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(labels::annotation::TEMP_CONTENT_LAST_ACCESSED))
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok());

        let expired = match last_accessed {
            Some(ts) => {
                let age = chrono::Utc::now().signed_duration_since(ts);
                age.to_std().map(|d| d > config.temp_content_ttl).unwrap_or(false)
            }
            None => false,
        };

        if expired {
            let namespaced: Api<Pod> = Api::namespaced(client.clone(), &namespace);
            if let Err(err) = namespaced.delete(&name, &DeleteParams::default()).await {
                warn!(pod = %name, namespace = %namespace, error = %err, "failed to sweep expired temp-content pod");
            } else {
                info!(pod = %name, namespace = %namespace, "swept expired temp-content pod");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_content_pod_name_is_deterministic() {
        assert_eq!(labels::temp_content_pod_name("demo"), "temp-content-demo");
    }
}
