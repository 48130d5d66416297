use std::time::Duration;

/// Operator-wide configuration loaded once from the environment at startup.
///
/// Mirrors the teacher binary's pattern of reading image/pull-policy
/// configuration from the environment rather than from a ConfigMap, but
/// widened to the full set of knobs this controller needs.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub namespace: String,
    pub backend_namespace: String,
    pub runner_image: String,
    pub content_service_image: String,
    pub image_pull_policy: String,
    pub vertex_enabled: bool,
    pub vertex_project_id: Option<String>,
    pub vertex_region: Option<String>,
    pub langfuse_enabled: bool,

    pub token_freshness_threshold: Duration,
    pub temp_content_ttl: Duration,
    pub job_active_deadline: Duration,
    pub job_ttl_after_finished: Duration,
    pub job_backoff_limit: i32,
    pub watch_retry_backoff: Duration,
    pub monitor_tick_interval: Duration,
    pub sweeper_interval: Duration,
    pub gateway_request_timeout: Duration,
    pub secret_copy_timeout: Duration,
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        let namespace = env_or("NAMESPACE", "ambient-code");
        let backend_namespace = std::env::var("BACKEND_NAMESPACE").unwrap_or_else(|_| namespace.clone());

        Self {
            vertex_enabled: env_bool("CLAUDE_CODE_USE_VERTEX"),
            vertex_project_id: std::env::var("VERTEX_PROJECT_ID").ok(),
            vertex_region: std::env::var("VERTEX_REGION").ok(),
            langfuse_enabled: env_bool("LANGFUSE_ENABLED"),
            runner_image: env_or(
                "AMBIENT_CODE_RUNNER_IMAGE",
                "quay.io/ambient-code/ambient-code-runner:latest",
            ),
            content_service_image: env_or(
                "CONTENT_SERVICE_IMAGE",
                "quay.io/ambient-code/ambient-content:latest",
            ),
            image_pull_policy: env_or("IMAGE_PULL_POLICY", "IfNotPresent"),
            backend_namespace,
            namespace,

            token_freshness_threshold: Duration::from_secs(45 * 60),
            temp_content_ttl: Duration::from_secs(10 * 60),
            job_active_deadline: Duration::from_secs(4 * 60 * 60),
            job_ttl_after_finished: Duration::from_secs(10 * 60),
            job_backoff_limit: 3,
            watch_retry_backoff: Duration::from_secs(3),
            monitor_tick_interval: Duration::from_secs(5),
            sweeper_interval: Duration::from_secs(60),
            gateway_request_timeout: Duration::from_secs(10),
            secret_copy_timeout: Duration::from_secs(30),
        }
    }

    pub fn backend_service_base_url(&self) -> String {
        format!(
            "http://backend-service.{}.svc.cluster.local:8080",
            self.backend_namespace
        )
    }

    pub fn backend_websocket_base_url(&self) -> String {
        format!(
            "ws://backend-service.{}.svc.cluster.local:8080",
            self.backend_namespace
        )
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_url_uses_backend_namespace() {
        let mut config = OperatorConfig::from_env();
        config.backend_namespace = "backend-ns".into();

        assert_eq!(
            config.backend_service_base_url(),
            "http://backend-service.backend-ns.svc.cluster.local:8080"
        );
    }
}
