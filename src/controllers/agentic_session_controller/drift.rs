//! Repo/workflow drift reconciliation (spec.md §4.5): for a `Running`
//! session, diff the desired repos/workflow against what was last
//! reconciled and forward any delta to the runner via the gateway's
//! control-message channel, only recording the new reconciled state once
//! the message is accepted.

use std::collections::BTreeSet;

use chrono::Utc;

use crate::{
    gateway_client::{ControlMessage, GatewayClient},
    labels::repo_display_name,
    resources::{AgenticSession, ReconciledRepo, ReconciledWorkflow, RepoStatusValue},
};

use super::status::StatusPatch;

pub async fn reconcile_repo_drift(
    session: &AgenticSession,
    gateway: &GatewayClient,
    patch: &mut StatusPatch,
) -> bool {
    let namespace = session.metadata.namespace.as_deref().unwrap_or_default();
    let name = session.metadata.name.as_deref().unwrap_or_default();

    let desired: BTreeSet<&str> = session.spec.repos.iter().map(|r| r.url.as_str()).collect();
    let reconciled: BTreeSet<&str> = patch
        .status()
        .reconciled_repos
        .iter()
        .map(|r| r.url.as_str())
        .collect();

    let added: Vec<_> = session
        .spec
        .repos
        .iter()
        .filter(|r| !reconciled.contains(r.url.as_str()))
        .collect();
    let removed: Vec<&str> = reconciled
        .iter()
        .filter(|url| !desired.contains(*url))
        .copied()
        .collect();

    if added.is_empty() && removed.is_empty() {
        return true;
    }

    let mut ok = true;
    let mut next_repos: Vec<ReconciledRepo> = patch
        .status()
        .reconciled_repos
        .iter()
        .filter(|r| desired.contains(r.url.as_str()))
        .cloned()
        .collect();

    for repo in &added {
        let message = ControlMessage::RepoAdded {
            url: repo.url.clone(),
            branch: repo.branch_or_default().to_string(),
            name: repo_display_name(&repo.url),
        };
        match gateway.send_control_message(namespace, name, &message).await {
            Ok(()) => next_repos.push(ReconciledRepo {
                url: repo.url.clone(),
                branch: repo.branch_or_default().to_string(),
                status: RepoStatusValue::Ready,
                cloned_at: Some(Utc::now().fixed_offset()),
            }),
            Err(_) => ok = false,
        }
    }

    for url in &removed {
        let branch = patch
            .status()
            .reconciled_repos
            .iter()
            .find(|r| r.url == *url)
            .map(|r| r.branch.clone())
            .unwrap_or_else(|| "main".to_string());
        let message = ControlMessage::RepoRemoved {
            url: url.to_string(),
            branch,
            name: repo_display_name(url),
        };
        if gateway.send_control_message(namespace, name, &message).await.is_err() {
            ok = false;
        }
    }

    patch.set_reconciled_repos(next_repos);
    ok
}

pub async fn reconcile_workflow_drift(
    session: &AgenticSession,
    gateway: &GatewayClient,
    patch: &mut StatusPatch,
) -> bool {
    let namespace = session.metadata.namespace.as_deref().unwrap_or_default();
    let name = session.metadata.name.as_deref().unwrap_or_default();

    let desired = session.spec.active_workflow.as_ref();
    let reconciled = patch.status().reconciled_workflow.clone();

    let matches = match (desired, &reconciled) {
        (Some(desired), Some(reconciled)) => {
            desired.git_url == reconciled.git_url
                && desired.branch_or_default() == reconciled.branch
                && desired.path == reconciled.path
        }
        (None, None) => true,
        _ => false,
    };

    if matches {
        return true;
    }

    match desired {
        Some(workflow) => {
            let message = ControlMessage::WorkflowChange {
                git_url: workflow.git_url.clone(),
                branch: workflow.branch_or_default().to_string(),
                path: workflow.path.clone(),
            };
            match gateway.send_control_message(namespace, name, &message).await {
                Ok(()) => {
                    patch.set_reconciled_workflow(ReconciledWorkflow {
                        git_url: workflow.git_url.clone(),
                        branch: workflow.branch_or_default().to_string(),
                        path: workflow.path.clone(),
                        applied_at: Some(Utc::now().fixed_offset()),
                    });
                    true
                }
                Err(_) => false,
            }
        }
        None => {
            patch.delete_field_reconciled_workflow();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_display_name_strips_git_suffix() {
        assert_eq!(repo_display_name("https://github.com/org/repo.git"), "repo");
        assert_eq!(repo_display_name("https://github.com/org/repo"), "repo");
    }
}
