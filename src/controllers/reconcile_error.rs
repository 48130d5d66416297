#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    KubeError(#[from] kube::Error),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(&'static str),

    #[error(transparent)]
    JsonSerializationError(#[from] serde_json::Error),

    #[error("control message to gateway failed: {0}")]
    GatewayError(#[from] crate::gateway_client::GatewayError),

    #[error("token request returned no token")]
    TokenRequestEmpty,
}
