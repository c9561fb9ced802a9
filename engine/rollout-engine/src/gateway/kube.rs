use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
};
use kube::{Api, Client, Resource};
use rollout_models::ControllerKind;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ClusterGateway, Controller};
use crate::errors::ClusterError;

const ISTIO_GROUP: &str = "networking.istio.io";
const ISTIO_VERSION: &str = "v1alpha3";
const SMI_GROUP: &str = "split.smi-spec.io";
const SMI_VERSION: &str = "v1alpha2";

/// Gateway backed by a real cluster connection. All writes go through
/// server-side apply under one field manager so repeated rollouts converge
/// instead of conflicting.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    field_manager: String,
}

impl KubeGateway {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn get_opt<K>(&self, ns: &str, name: &str) -> Result<Option<K>, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        self.api::<K>(ns).get_opt(name).await.map_err(api_err)
    }

    async fn apply<K>(&self, ns: &str, name: &str, obj: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
        K::DynamicType: Default,
    {
        let pp = PatchParams::apply(&self.field_manager).force();
        self.api::<K>(ns)
            .patch(name, &pp, &Patch::Apply(obj))
            .await
            .map_err(api_err)
    }

    async fn delete<K>(&self, ns: &str, name: &str) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        match self.api::<K>(ns).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn list<K>(&self, ns: &str, label_selector: &str) -> Result<Vec<K>, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let lp = ListParams::default().labels(label_selector);
        self.api::<K>(ns)
            .list(&lp)
            .await
            .map(|l| l.items)
            .map_err(api_err)
    }

    async fn scale<K>(&self, ns: &str, name: &str, replicas: i32) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.api::<K>(ns)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(api_err)
    }

    fn mesh_api(&self, ns: &str, kind: &str) -> Api<DynamicObject> {
        let (group, version) = if kind == "TrafficSplit" {
            (SMI_GROUP, SMI_VERSION)
        } else {
            (ISTIO_GROUP, ISTIO_VERSION)
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let ar = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), ns, &ar)
    }
}

fn api_err(e: kube::Error) -> ClusterError {
    ClusterError::Api(e.to_string())
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_controller(
        &self,
        ns: &str,
        kind: ControllerKind,
        name: &str,
    ) -> Result<Option<Controller>, ClusterError> {
        let found = match kind {
            ControllerKind::Deployment => {
                self.get_opt(ns, name).await?.map(Controller::Deployment)
            }
            ControllerKind::ReplicaSet => {
                self.get_opt(ns, name).await?.map(Controller::ReplicaSet)
            }
            ControllerKind::ReplicationController => self
                .get_opt(ns, name)
                .await?
                .map(Controller::ReplicationController),
            ControllerKind::StatefulSet => {
                self.get_opt(ns, name).await?.map(Controller::StatefulSet)
            }
            ControllerKind::DaemonSet => {
                self.get_opt(ns, name).await?.map(Controller::DaemonSet)
            }
        };
        Ok(found)
    }

    async fn apply_controller(
        &self,
        ns: &str,
        controller: &Controller,
    ) -> Result<Controller, ClusterError> {
        let name = controller.name().to_string();
        tracing::debug!(ns = %ns, name = %name, kind = %controller.kind().as_str(), "applying controller");
        let applied = match controller {
            Controller::Deployment(c) => {
                Controller::Deployment(self.apply(ns, &name, c).await?)
            }
            Controller::ReplicaSet(c) => {
                Controller::ReplicaSet(self.apply(ns, &name, c).await?)
            }
            Controller::ReplicationController(c) => {
                Controller::ReplicationController(self.apply(ns, &name, c).await?)
            }
            Controller::StatefulSet(c) => {
                Controller::StatefulSet(self.apply(ns, &name, c).await?)
            }
            Controller::DaemonSet(c) => {
                Controller::DaemonSet(self.apply(ns, &name, c).await?)
            }
        };
        Ok(applied)
    }

    async fn delete_controller(
        &self,
        ns: &str,
        kind: ControllerKind,
        name: &str,
    ) -> Result<(), ClusterError> {
        tracing::debug!(ns = %ns, name = %name, kind = %kind.as_str(), "deleting controller");
        match kind {
            ControllerKind::Deployment => {
                self.delete::<k8s_openapi::api::apps::v1::Deployment>(ns, name).await
            }
            ControllerKind::ReplicaSet => {
                self.delete::<k8s_openapi::api::apps::v1::ReplicaSet>(ns, name).await
            }
            ControllerKind::ReplicationController => {
                self.delete::<k8s_openapi::api::core::v1::ReplicationController>(ns, name)
                    .await
            }
            ControllerKind::StatefulSet => {
                self.delete::<k8s_openapi::api::apps::v1::StatefulSet>(ns, name).await
            }
            ControllerKind::DaemonSet => {
                self.delete::<k8s_openapi::api::apps::v1::DaemonSet>(ns, name).await
            }
        }
    }

    async fn list_controllers(
        &self,
        ns: &str,
        kind: ControllerKind,
        label_selector: &str,
    ) -> Result<Vec<Controller>, ClusterError> {
        let out = match kind {
            ControllerKind::Deployment => self
                .list(ns, label_selector)
                .await?
                .into_iter()
                .map(Controller::Deployment)
                .collect(),
            ControllerKind::ReplicaSet => self
                .list(ns, label_selector)
                .await?
                .into_iter()
                .map(Controller::ReplicaSet)
                .collect(),
            ControllerKind::ReplicationController => self
                .list(ns, label_selector)
                .await?
                .into_iter()
                .map(Controller::ReplicationController)
                .collect(),
            ControllerKind::StatefulSet => self
                .list(ns, label_selector)
                .await?
                .into_iter()
                .map(Controller::StatefulSet)
                .collect(),
            ControllerKind::DaemonSet => self
                .list(ns, label_selector)
                .await?
                .into_iter()
                .map(Controller::DaemonSet)
                .collect(),
        };
        Ok(out)
    }

    async fn scale_controller(
        &self,
        ns: &str,
        kind: ControllerKind,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        tracing::debug!(ns = %ns, name = %name, replicas, "scaling controller");
        match kind {
            ControllerKind::Deployment => {
                self.scale::<k8s_openapi::api::apps::v1::Deployment>(ns, name, replicas)
                    .await
            }
            ControllerKind::ReplicaSet => {
                self.scale::<k8s_openapi::api::apps::v1::ReplicaSet>(ns, name, replicas)
                    .await
            }
            ControllerKind::ReplicationController => {
                self.scale::<k8s_openapi::api::core::v1::ReplicationController>(
                    ns, name, replicas,
                )
                .await
            }
            ControllerKind::StatefulSet => {
                self.scale::<k8s_openapi::api::apps::v1::StatefulSet>(ns, name, replicas)
                    .await
            }
            // DaemonSets have no replica count to scale.
            ControllerKind::DaemonSet => Ok(()),
        }
    }

    async fn get_config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClusterError> {
        self.get_opt(ns, name).await
    }

    async fn apply_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<(), ClusterError> {
        let name = cm.metadata.name.clone().unwrap_or_default();
        self.apply(ns, &name, cm).await.map(|_| ())
    }

    async fn delete_config_map(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.delete::<ConfigMap>(ns, name).await
    }

    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>, ClusterError> {
        self.get_opt(ns, name).await
    }

    async fn apply_secret(&self, ns: &str, secret: &Secret) -> Result<(), ClusterError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.apply(ns, &name, secret).await.map(|_| ())
    }

    async fn delete_secret(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.delete::<Secret>(ns, name).await
    }

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>, ClusterError> {
        self.get_opt(ns, name).await
    }

    async fn apply_service(&self, ns: &str, service: &Service) -> Result<(), ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.apply(ns, &name, service).await.map(|_| ())
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.delete::<Service>(ns, name).await
    }

    async fn list_services(&self, ns: &str) -> Result<Vec<Service>, ClusterError> {
        self.list(ns, "").await
    }

    async fn get_ingress(&self, ns: &str, name: &str) -> Result<Option<Ingress>, ClusterError> {
        self.get_opt(ns, name).await
    }

    async fn apply_ingress(&self, ns: &str, ingress: &Ingress) -> Result<(), ClusterError> {
        let name = ingress.metadata.name.clone().unwrap_or_default();
        self.apply(ns, &name, ingress).await.map(|_| ())
    }

    async fn delete_ingress(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.delete::<Ingress>(ns, name).await
    }

    async fn get_autoscaler(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<HorizontalPodAutoscaler>, ClusterError> {
        self.get_opt(ns, name).await
    }

    async fn apply_autoscaler(
        &self,
        ns: &str,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<(), ClusterError> {
        let name = hpa.metadata.name.clone().unwrap_or_default();
        self.apply(ns, &name, hpa).await.map(|_| ())
    }

    async fn delete_autoscaler(&self, ns: &str, name: &str) -> Result<(), ClusterError> {
        self.delete::<HorizontalPodAutoscaler>(ns, name).await
    }

    async fn apply_mesh_resource(
        &self,
        ns: &str,
        kind: &str,
        manifest: serde_json::Value,
    ) -> Result<(), ClusterError> {
        let name = manifest
            .pointer("/metadata/name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| ClusterError::Codec("mesh manifest has no metadata.name".into()))?
            .to_string();
        tracing::debug!(ns = %ns, name = %name, kind = %kind, "applying mesh resource");
        let pp = PatchParams::apply(&self.field_manager).force();
        self.mesh_api(ns, kind)
            .patch(&name, &pp, &Patch::Apply(&manifest))
            .await
            .map(|_| ())
            .map_err(api_err)
    }

    async fn delete_mesh_resource(
        &self,
        ns: &str,
        kind: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        match self
            .mesh_api(ns, kind)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn list_pods(
        &self,
        ns: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.list(ns, &super::selector_string(selector)).await
    }
}
