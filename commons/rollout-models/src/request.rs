use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

use crate::traffic::MeshRoutingSpec;

/// One rollout invocation. Built once by the caller, never mutated by the
/// engine; every run re-reads live cluster state instead of trusting any
/// field here to reflect reality.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeploymentRequest {
    #[validate(length(min = 1, message = "Namespace cannot be empty"))]
    pub namespace: String,
    /// Versioned controllers are named `{prefix}-{revision}`.
    #[validate(length(min = 1, message = "Controller name prefix cannot be empty"))]
    pub controller_name_prefix: String,
    /// Stable identity for this deployment target. Labels, the snapshot
    /// key and active-revision lookups all derive from it.
    #[validate(length(min = 1, message = "Release id cannot be empty"))]
    pub release_id: String,
    #[validate(nested)]
    pub image: ImageDetails,
    pub controller_kind: ControllerKind,
    pub replica_policy: ReplicaPolicy,
    pub service: Option<ServiceSpecInput>,
    /// Ingress YAML template; `${SERVICE_NAME}`, `${SERVICE_PORT}`,
    /// `${CONFIG_MAP_NAME}` and `${SECRET_MAP_NAME}` are substituted.
    pub ingress_yaml: Option<String>,
    pub autoscaler: Option<AutoscalerPolicy>,
    pub mesh_routing: Option<MeshRoutingSpec>,
    pub blue_green: Option<BlueGreenSpec>,
    pub rollback: bool,
    /// Overall steady-state budget per waiting step.
    pub timeout_minutes: u64,
    /// Plain key/values rendered into a ConfigMap named after the controller.
    #[serde(default)]
    pub config_values: HashMap<String, String>,
    /// Sensitive key/values rendered into a Secret named after the controller.
    #[serde(default)]
    pub secret_values: HashMap<String, String>,
    /// Optional controller manifest template (YAML). When absent a default
    /// single-container template is used.
    pub controller_yaml: Option<String>,
    /// Identifying annotations stamped on every managed object.
    pub app_name: Option<String>,
    pub service_name: Option<String>,
    pub env_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ImageDetails {
    #[validate(length(min = 1, message = "Image name cannot be empty"))]
    pub name: String,
    #[validate(length(min = 1, message = "Image tag cannot be empty"))]
    pub tag: String,
    pub registry_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ImageDetails {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    pub fn has_registry_credentials(&self) -> bool {
        self.registry_url.as_deref().is_some_and(|s| !s.is_empty())
            && self.username.as_deref().is_some_and(|s| !s.is_empty())
            && self.password.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Controller kinds the engine can drive. DaemonSet and StatefulSet are
/// singletons: updated in place at revision 0 rather than replaced by a
/// new revision per deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerKind {
    Deployment,
    ReplicaSet,
    ReplicationController,
    StatefulSet,
    DaemonSet,
}

impl ControllerKind {
    pub fn is_versioned(&self) -> bool {
        !matches!(self, Self::StatefulSet | Self::DaemonSet)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::ReplicationController => "ReplicationController",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
        }
    }
}

/// Desired instance count policy. `Fixed` gives the new revision exactly
/// that many pods and leaves older revisions their capacity, which is what
/// a traffic-splitting canary wants. `MaxBased` sizes the new revision to
/// the greater of the ceiling and what is already running, then caps the
/// whole family at the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaPolicy {
    Fixed(i32),
    MaxBased(i32),
}

impl ReplicaPolicy {
    pub fn max_allowed(&self) -> i32 {
        match self {
            Self::Fixed(n) | Self::MaxBased(n) => *n,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    LoadBalancer,
    NodePort,
    ExternalName,
    /// Full service manifest supplied by the user.
    Yaml,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpecInput {
    pub kind: ServiceKind,
    #[serde(default = "default_port")]
    pub port: i32,
    #[serde(default = "default_port")]
    pub target_port: i32,
    pub port_name: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub node_port: Option<i32>,
    pub cluster_ip: Option<String>,
    pub external_ips: Option<String>,
    pub external_name: Option<String>,
    pub load_balancer_ip: Option<String>,
    pub service_yaml: Option<String>,
}

fn default_port() -> i32 {
    80
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerPolicy {
    pub min_instances: i32,
    pub max_instances: i32,
    pub target_cpu_utilization_percent: i32,
    /// Full HPA manifest for custom metrics; scale-target ref is rewritten
    /// to the controller being rolled out.
    pub custom_metric_yaml: Option<String>,
}

/// Blue/green mode: two named services (primary, stage) each pinned 100%
/// to one revision, swapped rather than proportionally blended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueGreenSpec {
    pub primary_service: ServiceSpecInput,
    pub stage_service: ServiceSpecInput,
    pub ingress_yaml: Option<String>,
}
