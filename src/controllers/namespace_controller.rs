//! Namespace bootstrap: once a namespace gains `ambient-code.io/managed=true`
//! it gets a default `ProjectSettings` and a shared workspace PVC, mirroring
//! the way the teacher's controller reacts to `Node`/`Secret` changes by
//! materializing dependent objects rather than only the primary resource.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures_util::Stream;
use k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::api::resource::Quantity};
use kube::{
    Api,
    api::PostParams,
    runtime::{Controller, controller::Action, reflector::ObjectRef, watcher},
};
use tracing::info;

use crate::{
    controllers::reconcile_error::ReconcileError,
    labels,
    resources::{ProjectSettings, project_settings},
};

struct ReconciliationContext {
    client: kube::Client,
}

pub fn new(
    client: kube::Client,
) -> impl Stream<
    Item = Result<
        (ObjectRef<Namespace>, Action),
        kube::runtime::controller::Error<ReconcileError, kube::runtime::watcher::Error>,
    >,
> {
    let context = Arc::new(ReconciliationContext {
        client: client.clone(),
    });
    let namespaces_api: Api<Namespace> = Api::all(client);

    Controller::new(namespaces_api, watcher::Config::default()).run(
        reconcile,
        |_, _, _| Action::requeue(Duration::from_secs(60)),
        context,
    )
}

async fn reconcile(
    object: Arc<Namespace>,
    context: Arc<ReconciliationContext>,
) -> Result<Action, ReconcileError> {
    let name = object
        .metadata
        .name
        .clone()
        .ok_or(ReconcileError::PreconditionFailed("namespace has no name"))?;

    let managed = object
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(labels::MANAGED_NAMESPACE_LABEL))
        .map(|value| value == labels::MANAGED_NAMESPACE_VALUE)
        .unwrap_or(false);

    if !managed {
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    let settings_api: Api<ProjectSettings> = Api::namespaced(context.client.clone(), &name);
    if settings_api
        .get_opt(project_settings::DEFAULT_NAME)
        .await?
        .is_none()
    {
        info!(namespace = %name, "bootstrapping default ProjectSettings");
        settings_api
            .create(&PostParams::default(), &project_settings::default_instance(&name))
            .await?;
    }

    ensure_shared_pvc(&context.client, &name).await?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn ensure_shared_pvc(client: &kube::Client, namespace: &str) -> Result<(), ReconcileError> {
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
    };

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    const SHARED_PVC_NAME: &str = "ambient-shared-workspace";

    if pvcs.get_opt(SHARED_PVC_NAME).await?.is_some() {
        return Ok(());
    }

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity("20Gi".to_string()));

    let pvc = PersistentVolumeClaim {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(SHARED_PVC_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    pvcs.create(&PostParams::default(), &pvc).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn managed_namespace_label_matches_expected_value() {
        assert_eq!(crate::labels::MANAGED_NAMESPACE_VALUE, "true");
    }
}
