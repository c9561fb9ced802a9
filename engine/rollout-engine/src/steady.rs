//! Steady-state polling. After a controller is applied the rollout blocks
//! until the desired pod count is running and ready, a pod fails in a way
//! that cannot self-heal, or the budget runs out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use rollout_models::{ContainerOutcome, OutcomeStatus};
use tokio::time::{Instant, sleep};

use crate::errors::EngineError;
use crate::gateway::ClusterGateway;

/// Waiting reasons that never resolve on their own.
const FATAL_WAITING_REASONS: [&str; 3] =
    ["CrashLoopBackOff", "ErrImagePull", "ImagePullBackOff"];

enum PodState {
    Ready,
    Failed(String),
    Progressing,
}

pub struct SteadyStateWaiter {
    gateway: Arc<dyn ClusterGateway>,
    poll_interval: Duration,
}

impl SteadyStateWaiter {
    pub fn new(gateway: Arc<dyn ClusterGateway>, poll_interval: Duration) -> Self {
        Self {
            gateway,
            poll_interval,
        }
    }

    /// Polls the pods behind `selector` until `desired` of them are ready.
    /// Returns one outcome per observed container; the caller decides what
    /// a failed set means for the rollout. Pods still progressing when the
    /// budget expires are reported as failures.
    pub async fn await_steady(
        &self,
        ns: &str,
        selector: &BTreeMap<String, String>,
        desired: i32,
        timeout: Duration,
    ) -> Result<Vec<ContainerOutcome>, EngineError> {
        if desired <= 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let pods = self.gateway.list_pods(ns, selector).await?;
            let mut ready_pods = 0;
            let mut ready = Vec::new();
            let mut failed = Vec::new();
            let mut progressing = Vec::new();
            for pod in &pods {
                match classify(pod) {
                    PodState::Ready => {
                        ready_pods += 1;
                        ready.extend(outcomes(pod, OutcomeStatus::Success));
                    }
                    PodState::Failed(reason) => {
                        tracing::warn!(ns = %ns, pod = %pod_name(pod), reason = %reason, "pod failed");
                        failed.extend(outcomes(pod, OutcomeStatus::Failure));
                    }
                    PodState::Progressing => {
                        progressing.extend(outcomes(pod, OutcomeStatus::Failure));
                    }
                }
            }
            if !failed.is_empty() {
                ready.extend(failed);
                ready.extend(progressing);
                return Ok(ready);
            }
            if ready_pods >= desired {
                tracing::info!(ns = %ns, count = ready_pods, "pods reached steady state");
                return Ok(ready);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    ns = %ns,
                    ready = ready_pods,
                    desired,
                    "steady state not reached within budget"
                );
                ready.extend(progressing);
                return Ok(ready);
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Blocks until no pod matches `selector` anymore. Used after scaling a
    /// stage or stale revision to zero.
    pub async fn await_drained(
        &self,
        ns: &str,
        selector: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pods = self.gateway.list_pods(ns, selector).await?;
            if pods.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Fatal(format!(
                    "{} pods still running after drain budget",
                    pods.len()
                )));
            }
            sleep(self.poll_interval).await;
        }
    }
}

/// True when every outcome is a success and exactly `desired` pods are
/// represented. Outcomes are per container, so the pod names are deduped.
pub fn is_steady(outcomes: &[ContainerOutcome], desired: i32) -> bool {
    let pods: std::collections::BTreeSet<&str> =
        outcomes.iter().map(|o| o.pod_name.as_str()).collect();
    pods.len() as i32 == desired && outcomes.iter().all(|o| o.is_success())
}

fn classify(pod: &Pod) -> PodState {
    let Some(status) = &pod.status else {
        return PodState::Progressing;
    };
    if let Some(containers) = &status.container_statuses {
        for cs in containers {
            if let Some(state) = &cs.state {
                if let Some(waiting) = &state.waiting {
                    if let Some(reason) = &waiting.reason {
                        if FATAL_WAITING_REASONS.contains(&reason.as_str()) {
                            return PodState::Failed(reason.clone());
                        }
                    }
                }
                if let Some(terminated) = &state.terminated {
                    if terminated.exit_code != 0 {
                        return PodState::Failed(format!(
                            "terminated with exit code {}",
                            terminated.exit_code
                        ));
                    }
                }
            }
        }
    }
    let ready = status
        .conditions
        .as_ref()
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    if ready && status.phase.as_deref() == Some("Running") {
        PodState::Ready
    } else {
        PodState::Progressing
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// One entry per container status; a pod without any yet still yields a
/// single placeholder entry so it is counted.
fn outcomes(pod: &Pod, status: OutcomeStatus) -> Vec<ContainerOutcome> {
    let name = pod_name(pod);
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());
    match statuses {
        Some(cs) if !cs.is_empty() => cs
            .iter()
            .map(|c| ContainerOutcome {
                pod_name: name.to_string(),
                container_id: c.container_id.clone().unwrap_or_default(),
                status,
            })
            .collect(),
        _ => vec![ContainerOutcome {
            pod_name: name.to_string(),
            container_id: String::new(),
            status,
        }],
    }
}
