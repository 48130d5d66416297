//! Copied secrets (spec.md §4.9): the Vertex credential secret (fatal if
//! missing while Vertex is enabled) and the Langfuse secret (best-effort)
//! are copied from the backend namespace into the session's namespace so
//! the runner job can mount them locally. A copy is only ever deleted if
//! it still carries the `copied-from` annotation this controller wrote,
//! so a user-managed secret of the same name is never touched.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, api::PostParams};
use tracing::warn;

use crate::{config::OperatorConfig, controllers::reconcile_error::ReconcileError, labels};

pub const VERTEX_SECRET_NAME: &str = "ambient-vertex";
pub const LANGFUSE_SECRET_NAME: &str = "ambient-langfuse";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    AlreadyPresent,
    SourceMissing,
}

pub async fn copy_vertex_secret(
    backend_secrets: &Api<Secret>,
    namespace_secrets: &Api<Secret>,
    config: &OperatorConfig,
) -> Result<CopyOutcome, ReconcileError> {
    if !config.vertex_enabled {
        return Ok(CopyOutcome::AlreadyPresent);
    }

    let outcome = copy_secret(backend_secrets, namespace_secrets, VERTEX_SECRET_NAME).await?;
    if outcome == CopyOutcome::SourceMissing {
        return Err(ReconcileError::PreconditionFailed(
            "vertex enabled but ambient-vertex secret is missing in backend namespace",
        ));
    }
    Ok(outcome)
}

pub async fn copy_langfuse_secret(
    backend_secrets: &Api<Secret>,
    namespace_secrets: &Api<Secret>,
    config: &OperatorConfig,
) -> CopyOutcome {
    if !config.langfuse_enabled {
        return CopyOutcome::AlreadyPresent;
    }

    match copy_secret(backend_secrets, namespace_secrets, LANGFUSE_SECRET_NAME).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "langfuse secret copy failed, continuing without it");
            CopyOutcome::SourceMissing
        }
    }
}

async fn copy_secret(
    source_api: &Api<Secret>,
    dest_api: &Api<Secret>,
    name: &str,
) -> Result<CopyOutcome, ReconcileError> {
    if dest_api.get_opt(name).await?.is_some() {
        return Ok(CopyOutcome::AlreadyPresent);
    }

    let Some(source) = source_api.get_opt(name).await? else {
        return Ok(CopyOutcome::SourceMissing);
    };

    let mut annotations = source.metadata.annotations.clone().unwrap_or_default();
    annotations.insert(
        labels::annotation::COPIED_FROM.to_string(),
        source
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    );

    let copy = Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: source.data.clone(),
        string_data: None,
        type_: source.type_.clone(),
        immutable: None,
    };

    match dest_api.create(&PostParams::default(), &copy).await {
        Ok(_) => Ok(CopyOutcome::Copied),
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(CopyOutcome::AlreadyPresent),
        Err(err) => Err(err.into()),
    }
}

/// Deletes a namespace's copy only if it still carries the `copied-from`
/// annotation this controller stamped (invariant P8): a secret a user
/// created or renamed into the same name is left alone.
pub async fn delete_copy_if_owned(api: &Api<Secret>, name: &str) -> Result<(), ReconcileError> {
    let Some(existing) = api.get_opt(name).await? else {
        return Ok(());
    };

    let is_owned_copy = existing
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(labels::annotation::COPIED_FROM))
        .unwrap_or(false);

    if is_owned_copy {
        api.delete(name, &kube::api::DeleteParams::default()).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_outcome_variants_are_distinguishable() {
        assert_ne!(CopyOutcome::Copied, CopyOutcome::AlreadyPresent);
        assert_ne!(CopyOutcome::AlreadyPresent, CopyOutcome::SourceMissing);
    }
}
