//! Outbound control-message protocol (spec.md §4.7): the operator cannot
//! reach the runner's WebSocket directly, so it posts a small JSON message
//! to the in-cluster API gateway, which relays it in-band.

use serde::Serialize;
use std::time::Duration;

const PROJECTED_SA_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("failed to read projected service-account token: {0}")]
    TokenReadError(#[from] std::io::Error),

    #[error("request to API gateway failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("API gateway returned unexpected status {0}")]
    UnexpectedStatus(u16),
}

#[derive(Serialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "repo_added")]
    RepoAdded {
        url: String,
        branch: String,
        name: String,
    },
    #[serde(rename = "repo_removed")]
    RepoRemoved {
        url: String,
        branch: String,
        name: String,
    },
    #[serde(rename = "workflow_change")]
    WorkflowChange {
        #[serde(rename = "gitUrl")]
        git_url: String,
        branch: String,
        path: String,
    },
}

pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client builder should not fail with this configuration");

        Self { http, base_url }
    }

    /// Posts a control message to `/projects/<ns>/sessions/<name>/messages`.
    /// Accepted response codes are 200 and 202; anything else is a failure
    /// that must not advance `observedGeneration` on the caller's side.
    pub async fn send_control_message(
        &self,
        namespace: &str,
        session_name: &str,
        message: &ControlMessage,
    ) -> Result<(), GatewayError> {
        let token = read_sa_token()?;
        let url = format!(
            "{}/api/projects/{namespace}/sessions/{session_name}/messages",
            self.base_url
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 200 || status.as_u16() == 202 {
            Ok(())
        } else {
            Err(GatewayError::UnexpectedStatus(status.as_u16()))
        }
    }
}

fn read_sa_token() -> Result<String, std::io::Error> {
    std::fs::read_to_string(PROJECTED_SA_TOKEN_PATH).map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_serializes_with_tag() {
        let message = ControlMessage::RepoAdded {
            url: "https://g/r".into(),
            branch: "main".into(),
            name: "r".into(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "repo_added");
        assert_eq!(json["url"], "https://g/r");
    }

    #[test]
    fn workflow_change_serializes_git_url_field() {
        let message = ControlMessage::WorkflowChange {
            git_url: "https://g/wf".into(),
            branch: "main".into(),
            path: "workflows/a.yaml".into(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "workflow_change");
        assert_eq!(json["gitUrl"], "https://g/wf");
    }
}
