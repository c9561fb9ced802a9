//! In-memory cluster used by the flow tests. Objects live in per-kind maps
//! keyed by name (the tests use a single namespace), and pods are derived
//! on the fly from the stored controllers' replica counts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerStatus, LoadBalancerIngress, LoadBalancerStatus, Pod, PodCondition,
    PodStatus, Secret, Service, ServiceStatus,
};
use k8s_openapi::api::networking::v1::Ingress;
use rollout_models::ControllerKind;

use rollout_engine::errors::ClusterError;
use rollout_engine::gateway::{ClusterGateway, Controller};

pub const LB_IP: &str = "203.0.113.10";

#[derive(Default)]
pub struct State {
    pub controllers: HashMap<String, Controller>,
    pub config_maps: HashMap<String, ConfigMap>,
    pub secrets: HashMap<String, Secret>,
    pub services: HashMap<String, Service>,
    pub ingresses: HashMap<String, Ingress>,
    pub autoscalers: HashMap<String, HorizontalPodAutoscaler>,
    pub mesh: HashMap<(String, String), serde_json::Value>,
    /// Controllers whose pods report CrashLoopBackOff instead of Ready.
    pub unhealthy: HashSet<String>,
}

#[derive(Default)]
pub struct FakeGateway {
    pub state: Mutex<State>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_controller(&self, yaml: &str) {
        let controller = Controller::from_yaml(yaml).expect("seed manifest");
        let mut state = self.state.lock().unwrap();
        state
            .controllers
            .insert(controller.name().to_string(), controller);
    }

    pub fn mark_unhealthy(&self, name: &str) {
        self.state.lock().unwrap().unhealthy.insert(name.to_string());
    }

    pub fn controller(&self, name: &str) -> Option<Controller> {
        self.state.lock().unwrap().controllers.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(name).cloned()
    }

    pub fn mesh_resource(&self, kind: &str, name: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .unwrap()
            .mesh
            .get(&(kind.to_string(), name.to_string()))
            .cloned()
    }

    fn pods_of(controller: &Controller, unhealthy: bool) -> Vec<Pod> {
        let labels = controller
            .pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| controller.pod_selector());
        (0..controller.replicas())
            .map(|i| {
                let name = format!("{}-{}", controller.name(), i);
                let status = if unhealthy {
                    PodStatus {
                        phase: Some("Running".into()),
                        container_statuses: Some(vec![ContainerStatus {
                            name: "app".into(),
                            container_id: Some(format!("containerd://{name}")),
                            state: Some(k8s_openapi::api::core::v1::ContainerState {
                                waiting: Some(
                                    k8s_openapi::api::core::v1::ContainerStateWaiting {
                                        reason: Some("CrashLoopBackOff".into()),
                                        ..Default::default()
                                    },
                                ),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }
                } else {
                    PodStatus {
                        phase: Some("Running".into()),
                        conditions: Some(vec![PodCondition {
                            type_: "Ready".into(),
                            status: "True".into(),
                            ..Default::default()
                        }]),
                        container_statuses: Some(vec![ContainerStatus {
                            name: "app".into(),
                            container_id: Some(format!("containerd://{name}")),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }
                };
                Pod {
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: Some(name),
                        labels: Some(labels.clone()),
                        ..Default::default()
                    },
                    status: Some(status),
                    ..Default::default()
                }
            })
            .collect()
    }
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn matches(labels: Option<&BTreeMap<String, String>>, wanted: &BTreeMap<String, String>) -> bool {
    let Some(labels) = labels else {
        return wanted.is_empty();
    };
    wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    async fn get_controller(
        &self,
        _ns: &str,
        kind: ControllerKind,
        name: &str,
    ) -> Result<Option<Controller>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .controllers
            .get(name)
            .filter(|c| c.kind() == kind)
            .cloned())
    }

    async fn apply_controller(
        &self,
        _ns: &str,
        controller: &Controller,
    ) -> Result<Controller, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state
            .controllers
            .insert(controller.name().to_string(), controller.clone());
        Ok(controller.clone())
    }

    async fn delete_controller(
        &self,
        _ns: &str,
        _kind: ControllerKind,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.state.lock().unwrap().controllers.remove(name);
        Ok(())
    }

    async fn list_controllers(
        &self,
        _ns: &str,
        kind: ControllerKind,
        label_selector: &str,
    ) -> Result<Vec<Controller>, ClusterError> {
        let wanted = parse_selector(label_selector);
        let state = self.state.lock().unwrap();
        let mut out: Vec<Controller> = state
            .controllers
            .values()
            .filter(|c| c.kind() == kind && matches(c.labels(), &wanted))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.name().to_string());
        Ok(out)
    }

    async fn scale_controller(
        &self,
        _ns: &str,
        _kind: ControllerKind,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if let Some(controller) = state.controllers.get_mut(name) {
            controller.set_replicas(replicas);
        }
        Ok(())
    }

    async fn get_config_map(
        &self,
        _ns: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError> {
        Ok(self.state.lock().unwrap().config_maps.get(name).cloned())
    }

    async fn apply_config_map(&self, _ns: &str, cm: &ConfigMap) -> Result<(), ClusterError> {
        let name = cm.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().config_maps.insert(name, cm.clone());
        Ok(())
    }

    async fn delete_config_map(&self, _ns: &str, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().config_maps.remove(name);
        Ok(())
    }

    async fn get_secret(&self, _ns: &str, name: &str) -> Result<Option<Secret>, ClusterError> {
        Ok(self.state.lock().unwrap().secrets.get(name).cloned())
    }

    async fn apply_secret(&self, _ns: &str, secret: &Secret) -> Result<(), ClusterError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().secrets.insert(name, secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, _ns: &str, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().secrets.remove(name);
        Ok(())
    }

    async fn get_service(&self, _ns: &str, name: &str) -> Result<Option<Service>, ClusterError> {
        Ok(self.state.lock().unwrap().services.get(name).cloned())
    }

    async fn apply_service(&self, _ns: &str, service: &Service) -> Result<(), ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut service = service.clone();
        let is_lb = service
            .spec
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            .is_some_and(|t| t == "LoadBalancer");
        if is_lb {
            service.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(LB_IP.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            });
        }
        self.state.lock().unwrap().services.insert(name, service);
        Ok(())
    }

    async fn delete_service(&self, _ns: &str, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().services.remove(name);
        Ok(())
    }

    async fn list_services(&self, _ns: &str) -> Result<Vec<Service>, ClusterError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<Service> = state.services.values().cloned().collect();
        out.sort_by_key(|s| s.metadata.name.clone());
        Ok(out)
    }

    async fn get_ingress(&self, _ns: &str, name: &str) -> Result<Option<Ingress>, ClusterError> {
        Ok(self.state.lock().unwrap().ingresses.get(name).cloned())
    }

    async fn apply_ingress(&self, _ns: &str, ingress: &Ingress) -> Result<(), ClusterError> {
        let name = ingress.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().ingresses.insert(name, ingress.clone());
        Ok(())
    }

    async fn delete_ingress(&self, _ns: &str, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().ingresses.remove(name);
        Ok(())
    }

    async fn get_autoscaler(
        &self,
        _ns: &str,
        name: &str,
    ) -> Result<Option<HorizontalPodAutoscaler>, ClusterError> {
        Ok(self.state.lock().unwrap().autoscalers.get(name).cloned())
    }

    async fn apply_autoscaler(
        &self,
        _ns: &str,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<(), ClusterError> {
        let name = hpa.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().autoscalers.insert(name, hpa.clone());
        Ok(())
    }

    async fn delete_autoscaler(&self, _ns: &str, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().autoscalers.remove(name);
        Ok(())
    }

    async fn apply_mesh_resource(
        &self,
        _ns: &str,
        kind: &str,
        manifest: serde_json::Value,
    ) -> Result<(), ClusterError> {
        let name = manifest
            .pointer("/metadata/name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| ClusterError::Codec("mesh manifest has no metadata.name".into()))?
            .to_string();
        self.state
            .lock()
            .unwrap()
            .mesh
            .insert((kind.to_string(), name), manifest);
        Ok(())
    }

    async fn delete_mesh_resource(
        &self,
        _ns: &str,
        kind: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.state
            .lock()
            .unwrap()
            .mesh
            .remove(&(kind.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_pods(
        &self,
        _ns: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError> {
        let state = self.state.lock().unwrap();
        let mut pods = Vec::new();
        for controller in state.controllers.values() {
            let unhealthy = state.unhealthy.contains(controller.name());
            for pod in Self::pods_of(controller, unhealthy) {
                if matches(pod.metadata.labels.as_ref(), selector) {
                    pods.push(pod);
                }
            }
        }
        Ok(pods)
    }
}
