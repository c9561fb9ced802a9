use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{PodTemplateSpec, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use rollout_models::ControllerKind;

use crate::convention::REVISION_LABEL_KEY;
use crate::errors::ClusterError;

/// A workload controller of any supported kind, decoded into its typed
/// representation. Every rollout step that touches controllers goes through
/// this enum so the kind dispatch lives in one place.
#[derive(Clone, Debug)]
pub enum Controller {
    Deployment(Deployment),
    ReplicaSet(ReplicaSet),
    ReplicationController(ReplicationController),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

impl Controller {
    pub fn kind(&self) -> ControllerKind {
        match self {
            Controller::Deployment(_) => ControllerKind::Deployment,
            Controller::ReplicaSet(_) => ControllerKind::ReplicaSet,
            Controller::ReplicationController(_) => ControllerKind::ReplicationController,
            Controller::StatefulSet(_) => ControllerKind::StatefulSet,
            Controller::DaemonSet(_) => ControllerKind::DaemonSet,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Controller::Deployment(c) => &c.metadata,
            Controller::ReplicaSet(c) => &c.metadata,
            Controller::ReplicationController(c) => &c.metadata,
            Controller::StatefulSet(c) => &c.metadata,
            Controller::DaemonSet(c) => &c.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Controller::Deployment(c) => &mut c.metadata,
            Controller::ReplicaSet(c) => &mut c.metadata,
            Controller::ReplicationController(c) => &mut c.metadata,
            Controller::StatefulSet(c) => &mut c.metadata,
            Controller::DaemonSet(c) => &mut c.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut().name = Some(name.to_string());
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().labels.as_ref()
    }

    /// Revision this controller was stamped with at creation time, if any.
    pub fn revision_label(&self) -> Option<i32> {
        self.labels()?.get(REVISION_LABEL_KEY)?.parse().ok()
    }

    /// Desired replica count. DaemonSets have no replica field, their
    /// desired count is whatever the scheduler reported last.
    pub fn replicas(&self) -> i32 {
        match self {
            Controller::Deployment(c) => {
                c.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
            }
            Controller::ReplicaSet(c) => {
                c.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
            }
            Controller::ReplicationController(c) => {
                c.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
            }
            Controller::StatefulSet(c) => {
                c.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
            }
            Controller::DaemonSet(c) => c
                .status
                .as_ref()
                .map(|s| s.desired_number_scheduled)
                .unwrap_or(0),
        }
    }

    /// No-op for DaemonSets.
    pub fn set_replicas(&mut self, replicas: i32) {
        match self {
            Controller::Deployment(c) => {
                c.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            Controller::ReplicaSet(c) => {
                c.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            Controller::ReplicationController(c) => {
                c.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            Controller::StatefulSet(c) => {
                c.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            }
            Controller::DaemonSet(_) => {}
        }
    }

    pub fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        match self {
            Controller::Deployment(c) => {
                &mut c.spec.get_or_insert_with(Default::default).template
            }
            Controller::ReplicaSet(c) => c
                .spec
                .get_or_insert_with(Default::default)
                .template
                .get_or_insert_with(Default::default),
            Controller::ReplicationController(c) => c
                .spec
                .get_or_insert_with(Default::default)
                .template
                .get_or_insert_with(Default::default),
            Controller::StatefulSet(c) => {
                &mut c.spec.get_or_insert_with(Default::default).template
            }
            Controller::DaemonSet(c) => {
                &mut c.spec.get_or_insert_with(Default::default).template
            }
        }
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Controller::Deployment(c) => c.spec.as_ref().map(|s| &s.template),
            Controller::ReplicaSet(c) => c.spec.as_ref().and_then(|s| s.template.as_ref()),
            Controller::ReplicationController(c) => {
                c.spec.as_ref().and_then(|s| s.template.as_ref())
            }
            Controller::StatefulSet(c) => c.spec.as_ref().map(|s| &s.template),
            Controller::DaemonSet(c) => c.spec.as_ref().map(|s| &s.template),
        }
    }

    /// Labels pods of this controller are selected by. ReplicationControllers
    /// select with a plain map, everything else with a LabelSelector.
    pub fn pod_selector(&self) -> BTreeMap<String, String> {
        match self {
            Controller::Deployment(c) => match_labels(c.spec.as_ref().map(|s| &s.selector)),
            Controller::ReplicaSet(c) => match_labels(c.spec.as_ref().map(|s| &s.selector)),
            Controller::ReplicationController(c) => c
                .spec
                .as_ref()
                .and_then(|s| s.selector.clone())
                .unwrap_or_default(),
            Controller::StatefulSet(c) => match_labels(c.spec.as_ref().map(|s| &s.selector)),
            Controller::DaemonSet(c) => match_labels(c.spec.as_ref().map(|s| &s.selector)),
        }
    }

    pub fn set_pod_selector(&mut self, labels: BTreeMap<String, String>) {
        let selector = LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        };
        match self {
            Controller::Deployment(c) => {
                c.spec.get_or_insert_with(Default::default).selector = selector;
            }
            Controller::ReplicaSet(c) => {
                c.spec.get_or_insert_with(Default::default).selector = selector;
            }
            Controller::ReplicationController(c) => {
                c.spec.get_or_insert_with(Default::default).selector = Some(labels);
            }
            Controller::StatefulSet(c) => {
                c.spec.get_or_insert_with(Default::default).selector = selector;
            }
            Controller::DaemonSet(c) => {
                c.spec.get_or_insert_with(Default::default).selector = selector;
            }
        }
    }

    /// Strips server-populated fields so the object can be re-applied or
    /// stored in a snapshot without carrying stale cluster state.
    pub fn scrub(&mut self) {
        let meta = self.metadata_mut();
        meta.resource_version = None;
        meta.uid = None;
        meta.generation = None;
        meta.creation_timestamp = None;
        meta.managed_fields = None;
        meta.owner_references = None;
        match self {
            Controller::Deployment(c) => c.status = None,
            Controller::ReplicaSet(c) => c.status = None,
            Controller::ReplicationController(c) => c.status = None,
            Controller::StatefulSet(c) => c.status = None,
            Controller::DaemonSet(c) => c.status = None,
        }
    }

    pub fn to_yaml(&self) -> Result<String, ClusterError> {
        let out = match self {
            Controller::Deployment(c) => serde_yaml::to_string(c),
            Controller::ReplicaSet(c) => serde_yaml::to_string(c),
            Controller::ReplicationController(c) => serde_yaml::to_string(c),
            Controller::StatefulSet(c) => serde_yaml::to_string(c),
            Controller::DaemonSet(c) => serde_yaml::to_string(c),
        };
        out.map_err(ClusterError::codec)
    }

    /// Decodes a manifest by its `kind` field.
    pub fn from_yaml(yaml: &str) -> Result<Self, ClusterError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(yaml).map_err(ClusterError::codec)?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| ClusterError::Codec("manifest has no kind field".into()))?
            .to_string();
        let decoded = match kind.as_str() {
            "Deployment" => serde_yaml::from_value(value)
                .map(Controller::Deployment)
                .map_err(ClusterError::codec)?,
            "ReplicaSet" => serde_yaml::from_value(value)
                .map(Controller::ReplicaSet)
                .map_err(ClusterError::codec)?,
            "ReplicationController" => serde_yaml::from_value(value)
                .map(Controller::ReplicationController)
                .map_err(ClusterError::codec)?,
            "StatefulSet" => serde_yaml::from_value(value)
                .map(Controller::StatefulSet)
                .map_err(ClusterError::codec)?,
            "DaemonSet" => serde_yaml::from_value(value)
                .map(Controller::DaemonSet)
                .map_err(ClusterError::codec)?,
            other => {
                return Err(ClusterError::Codec(format!(
                    "unsupported controller kind {other}"
                )));
            }
        };
        Ok(decoded)
    }
}

fn match_labels(selector: Option<&LabelSelector>) -> BTreeMap<String, String> {
    selector
        .and_then(|s| s.match_labels.clone())
        .unwrap_or_default()
}
