use thiserror::Error;

/// Terminal error taxonomy for one rollout run. Validation errors fire
/// before any cluster mutation; fatal errors abort the remaining steps
/// without rolling back. Best-effort cleanup failures never surface here,
/// they are logged and swallowed at the call site.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Fatal rollout error: {0}")]
    Fatal(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Invalid request: {0}")]
    Request(#[from] validator::ValidationErrors),
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Api(String),

    #[error("Manifest encoding error: {0}")]
    Codec(String),
}

impl ClusterError {
    pub fn codec<E: std::fmt::Display>(e: E) -> Self {
        Self::Codec(e.to_string())
    }
}
