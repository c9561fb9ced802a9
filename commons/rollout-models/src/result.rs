use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

/// Per-container result of a steady-state wait. One entry per container,
/// not per pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOutcome {
    pub pod_name: String,
    pub container_id: String,
    pub status: OutcomeStatus,
}

impl ContainerOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Terminal result of one rollout invocation. Diagnostics beyond
/// success/failure live in the textual summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutResult {
    pub success: bool,
    pub controller_name: String,
    pub namespace: String,
    pub load_balancer_url: Option<String>,
    pub node_ports: Option<String>,
    pub autoscaler_yaml: Option<String>,
    pub summary: String,
}
