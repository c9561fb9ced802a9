use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use rollout_models::ControllerKind;

use crate::errors::ClusterError;

pub mod controller;
pub mod kube;

pub use controller::Controller;
pub use kube::KubeGateway;

/// Cluster access boundary. The orchestrator and its helpers only ever talk
/// to Kubernetes through this trait, so tests can swap in an in-memory
/// cluster. Reads resolve a missing object to `Ok(None)`, never to an error.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn get_controller(
        &self,
        ns: &str,
        kind: ControllerKind,
        name: &str,
    ) -> Result<Option<Controller>, ClusterError>;

    async fn apply_controller(
        &self,
        ns: &str,
        controller: &Controller,
    ) -> Result<Controller, ClusterError>;

    async fn delete_controller(
        &self,
        ns: &str,
        kind: ControllerKind,
        name: &str,
    ) -> Result<(), ClusterError>;

    async fn list_controllers(
        &self,
        ns: &str,
        kind: ControllerKind,
        label_selector: &str,
    ) -> Result<Vec<Controller>, ClusterError>;

    async fn scale_controller(
        &self,
        ns: &str,
        kind: ControllerKind,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterError>;

    async fn get_config_map(&self, ns: &str, name: &str)
    -> Result<Option<ConfigMap>, ClusterError>;
    async fn apply_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<(), ClusterError>;
    async fn delete_config_map(&self, ns: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>, ClusterError>;
    async fn apply_secret(&self, ns: &str, secret: &Secret) -> Result<(), ClusterError>;
    async fn delete_secret(&self, ns: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>, ClusterError>;
    async fn apply_service(&self, ns: &str, service: &Service) -> Result<(), ClusterError>;
    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), ClusterError>;
    async fn list_services(&self, ns: &str) -> Result<Vec<Service>, ClusterError>;

    async fn get_ingress(&self, ns: &str, name: &str) -> Result<Option<Ingress>, ClusterError>;
    async fn apply_ingress(&self, ns: &str, ingress: &Ingress) -> Result<(), ClusterError>;
    async fn delete_ingress(&self, ns: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_autoscaler(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<HorizontalPodAutoscaler>, ClusterError>;
    async fn apply_autoscaler(
        &self,
        ns: &str,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<(), ClusterError>;
    async fn delete_autoscaler(&self, ns: &str, name: &str) -> Result<(), ClusterError>;

    /// Applies an Istio networking object (VirtualService or DestinationRule)
    /// given as a full manifest.
    async fn apply_mesh_resource(
        &self,
        ns: &str,
        kind: &str,
        manifest: serde_json::Value,
    ) -> Result<(), ClusterError>;
    async fn delete_mesh_resource(
        &self,
        ns: &str,
        kind: &str,
        name: &str,
    ) -> Result<(), ClusterError>;

    async fn list_pods(
        &self,
        ns: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError>;
}

/// Renders a plain-map selector as a Kubernetes label selector string.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
