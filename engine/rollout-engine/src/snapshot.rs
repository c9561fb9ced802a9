//! Pre-rollout state capture. Before a rollout mutates anything it records
//! the current controller, config map, secret map and autoscaler manifests
//! in a Secret keyed by the release id. Rollback replays that record: a
//! present blob is re-applied, an absent one means the resource did not
//! exist and must be deleted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::convention::{MANAGED_LABEL_KEY, snapshot_key};
use crate::errors::ClusterError;
use crate::gateway::ClusterGateway;

pub const CONTROLLER_FIELD: &str = "controller.yaml";
pub const CONFIG_MAP_FIELD: &str = "config-map.yaml";
pub const SECRET_MAP_FIELD: &str = "secret-map.yaml";
pub const AUTOSCALER_FIELD: &str = "autoscaler.yaml";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolloutSnapshot {
    pub controller_yaml: Option<String>,
    pub config_map_yaml: Option<String>,
    pub secret_map_yaml: Option<String>,
    pub autoscaler_yaml: Option<String>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(
        &self,
        ns: &str,
        release_id: &str,
        snapshot: &RolloutSnapshot,
    ) -> Result<(), ClusterError>;
    async fn load(
        &self,
        ns: &str,
        release_id: &str,
    ) -> Result<Option<RolloutSnapshot>, ClusterError>;
    async fn delete(&self, ns: &str, release_id: &str) -> Result<(), ClusterError>;
}

pub struct SecretSnapshotStore {
    gateway: Arc<dyn ClusterGateway>,
}

impl SecretSnapshotStore {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SnapshotStore for SecretSnapshotStore {
    async fn save(
        &self,
        ns: &str,
        release_id: &str,
        snapshot: &RolloutSnapshot,
    ) -> Result<(), ClusterError> {
        let secret = to_secret(release_id, snapshot);
        tracing::debug!(ns = %ns, name = %snapshot_key(release_id), "saving rollout snapshot");
        self.gateway.apply_secret(ns, &secret).await
    }

    async fn load(
        &self,
        ns: &str,
        release_id: &str,
    ) -> Result<Option<RolloutSnapshot>, ClusterError> {
        match self.gateway.get_secret(ns, &snapshot_key(release_id)).await? {
            Some(secret) => Ok(Some(from_secret(&secret)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, ns: &str, release_id: &str) -> Result<(), ClusterError> {
        self.gateway.delete_secret(ns, &snapshot_key(release_id)).await
    }
}

fn to_secret(release_id: &str, snapshot: &RolloutSnapshot) -> Secret {
    let mut fields = BTreeMap::new();
    let blobs = [
        (CONTROLLER_FIELD, &snapshot.controller_yaml),
        (CONFIG_MAP_FIELD, &snapshot.config_map_yaml),
        (SECRET_MAP_FIELD, &snapshot.secret_map_yaml),
        (AUTOSCALER_FIELD, &snapshot.autoscaler_yaml),
    ];
    for (key, blob) in blobs {
        if let Some(yaml) = blob {
            fields.insert(key.to_string(), yaml.clone());
        }
    }
    Secret {
        metadata: ObjectMeta {
            name: Some(snapshot_key(release_id)),
            labels: Some(BTreeMap::from([(
                MANAGED_LABEL_KEY.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        string_data: Some(fields),
        ..Default::default()
    }
}

fn from_secret(secret: &Secret) -> Result<RolloutSnapshot, ClusterError> {
    Ok(RolloutSnapshot {
        controller_yaml: field(secret, CONTROLLER_FIELD)?,
        config_map_yaml: field(secret, CONFIG_MAP_FIELD)?,
        secret_map_yaml: field(secret, SECRET_MAP_FIELD)?,
        autoscaler_yaml: field(secret, AUTOSCALER_FIELD)?,
    })
}

/// Reads one snapshot field. The server stores fields base64-decoded under
/// `data`; a store that never round-tripped through the API may still hold
/// them under `stringData`. Empty blobs count as absent.
fn field(secret: &Secret, key: &str) -> Result<Option<String>, ClusterError> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        let text = String::from_utf8(bytes.0.clone()).map_err(ClusterError::codec)?;
        return Ok(non_empty(text));
    }
    Ok(secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
        .and_then(non_empty))
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() { None } else { Some(text) }
}

/// Drops server-populated metadata so a captured manifest can be replayed.
pub fn strip_server_fields(meta: &mut ObjectMeta) {
    meta.resource_version = None;
    meta.uid = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.owner_references = None;
}
