//! Runner token issuance and rotation (spec.md §4.8): a per-session
//! ServiceAccount/Role/RoleBinding trio, an issued `TokenRequest`, and the
//! resulting bearer token stashed in a Secret the job mounts as `BOT_TOKEN`.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    authentication::v1::{TokenRequest, TokenRequestSpec},
    core::v1::{Secret, ServiceAccount},
    rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Api, api::PostParams};

use crate::{
    config::OperatorConfig, controllers::reconcile_error::ReconcileError, labels,
    resources::AgenticSession, utils::create_or_update,
};

pub struct TokenClients<'a> {
    pub service_accounts: &'a Api<ServiceAccount>,
    pub roles: &'a Api<Role>,
    pub role_bindings: &'a Api<RoleBinding>,
    pub secrets: &'a Api<Secret>,
}

fn owner_reference(_session: &AgenticSession, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "vteam.ambient-code/v1alpha1".into(),
        kind: "AgenticSession".into(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Ensures the SA, a namespace-scoped Role granting only what the runner
/// needs, and the RoleBinding tying them together all exist, then issues a
/// fresh `TokenRequest` and stores it as a Secret if the existing one is
/// absent or older than `token_freshness_threshold`.
pub async fn ensure_runner_identity(
    clients: TokenClients<'_>,
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
    let owner = owner_reference(session, name, uid);

    let sa_name = labels::service_account_name(name);
    let sa = ServiceAccount {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(sa_name.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        ..Default::default()
    };
    create_or_update(clients.service_accounts, labels::FIELD_MANAGER, &sa_name, sa, |_, _| {}).await?;

    let role_name = format!("{sa_name}-role");
    let role = Role {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(role_name.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["vteam.ambient-code".into()]),
            resources: Some(vec!["agenticsessions".into(), "agenticsessions/status".into()]),
            verbs: vec!["get".into(), "list".into(), "watch".into(), "patch".into()],
            ..Default::default()
        }]),
    };
    create_or_update(clients.roles, labels::FIELD_MANAGER, &role_name, role, |_, _| {}).await?;

    let binding_name = format!("{sa_name}-binding");
    let binding = RoleBinding {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(binding_name.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: role_name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: sa_name.clone(),
            namespace: session.metadata.namespace.clone(),
            ..Default::default()
        }]),
    };
    create_or_update(
        clients.role_bindings,
        labels::FIELD_MANAGER,
        &binding_name,
        binding,
        |_, _| {},
    )
    .await?;

    ensure_token_freshness(clients.service_accounts, clients.secrets, session, config).await?;

    Ok(())
}

/// Mints a fresh token into the runner token Secret if the existing one is
/// missing or older than `config.token_freshness_threshold` (spec.md §4.8,
/// invariant I7, P5). Called both from first-time identity setup and from
/// every pod-monitor tick.
pub async fn ensure_token_freshness(
    service_accounts: &Api<ServiceAccount>,
    secrets: &Api<Secret>,
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
    let sa_name = labels::service_account_name(name);

    if token_needs_rotation(secrets, name, config).await? {
        rotate_token(service_accounts, secrets, session, &sa_name, name, uid).await?;
    }

    Ok(())
}

/// Unconditionally mints a fresh token, bypassing the freshness check.
/// Used by the restart path for continuation sessions (spec.md §4.2 step 3,
/// §4.8: "if continuation regenerate runner token").
pub async fn regenerate_token(
    service_accounts: &Api<ServiceAccount>,
    secrets: &Api<Secret>,
    session: &AgenticSession,
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
    let sa_name = labels::service_account_name(name);

    rotate_token(service_accounts, secrets, session, &sa_name, name, uid).await
}

async fn token_needs_rotation(
    secrets: &Api<Secret>,
    session_name: &str,
    config: &OperatorConfig,
) -> Result<bool, ReconcileError> {
    let secret_name = labels::runner_token_secret_name(session_name);
    let Some(existing) = secrets.get_opt(&secret_name).await? else {
        return Ok(true);
    };

    let refreshed_at = existing
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::annotation::TOKEN_REFRESHED_AT))
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok());

    Ok(match refreshed_at {
        Some(ts) => {
            let age = chrono::Utc::now().signed_duration_since(ts);
            age.to_std()
                .map(|d| d > config.token_freshness_threshold)
                .unwrap_or(true)
        }
        None => true,
    })
}

async fn rotate_token(
    service_accounts: &Api<ServiceAccount>,
    secrets: &Api<Secret>,
    session: &AgenticSession,
    sa_name: &str,
    session_name: &str,
    session_uid: &str,
) -> Result<(), ReconcileError> {
    let request = TokenRequest {
        spec: TokenRequestSpec {
            expiration_seconds: Some(24 * 60 * 60),
            ..Default::default()
        },
        ..Default::default()
    };

    let response: TokenRequest = service_accounts
        .create_subresource("token", sa_name, &PostParams::default(), serde_json::to_vec(&request)?)
        .await?;

    let token = response
        .status
        .map(|s| s.token)
        .filter(|t| !t.is_empty())
        .ok_or(ReconcileError::TokenRequestEmpty)?;

    let mut data = BTreeMap::new();
    data.insert(
        "k8s-token".to_string(),
        k8s_openapi::ByteString(token.into_bytes()),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(
        labels::annotation::TOKEN_REFRESHED_AT.to_string(),
        chrono::Utc::now().to_rfc3339(),
    );

    let secret_name = labels::runner_token_secret_name(session_name);
    let secret = Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: session.metadata.namespace.clone(),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "vteam.ambient-code/v1alpha1".into(),
                kind: "AgenticSession".into(),
                name: session_name.to_string(),
                uid: session_uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    create_or_update(secrets, labels::FIELD_MANAGER, &secret_name, secret, |_, _| {}).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_account_and_secret_names_are_distinct_but_derived() {
        assert_eq!(labels::service_account_name("demo"), "ambient-session-demo");
        assert_eq!(
            labels::runner_token_secret_name("demo"),
            "ambient-runner-token-demo"
        );
    }
}
