//! Builds the controller manifest for a new revision. The request may carry
//! a full manifest with placeholders, or nothing, in which case a minimal
//! single-container workload of the requested kind is generated. Either way
//! the result gets the release labels, the revision-scoped selector, the
//! image and the injected environment before it is applied.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, Container, ContainerPort, EnvVar, EnvVarSource, LocalObjectReference,
    SecretKeySelector,
};
use rollout_models::{ControllerKind, DeploymentRequest};

use crate::convention::{
    self, CONFIG_MAP_NAME_PLACEHOLDER, MANAGED_LABEL_KEY, RELEASE_LABEL_KEY,
    REVISION_LABEL_KEY, SECRET_MAP_NAME_PLACEHOLDER, SERVICE_NAME_PLACEHOLDER,
    SERVICE_PORT_PLACEHOLDER, label_value, sanitize_name,
};
use crate::errors::EngineError;
use crate::gateway::Controller;

const MAX_ENV_VALUE_LEN: usize = 4000;

/// Everything the builder needs beyond the request itself, resolved by the
/// orchestrator before the build step.
pub struct DefinitionContext<'a> {
    pub request: &'a DeploymentRequest,
    pub controller_name: String,
    pub revision: i32,
    pub replicas: i32,
    pub config_map_name: Option<String>,
    pub secret_map_name: Option<String>,
    pub registry_secret: Option<String>,
}

pub fn build_controller(
    ctx: &DefinitionContext<'_>,
    existing: Option<&Controller>,
) -> Result<Controller, EngineError> {
    let mut controller = match &ctx.request.controller_yaml {
        Some(yaml) => {
            let substituted = substitute_placeholders(yaml, ctx);
            let parsed = Controller::from_yaml(&substituted)?;
            if parsed.kind() != ctx.request.controller_kind {
                return Err(EngineError::Validation(format!(
                    "controller manifest is a {} but the request asks for a {}",
                    parsed.kind().as_str(),
                    ctx.request.controller_kind.as_str()
                )));
            }
            parsed
        }
        None => default_controller(ctx),
    };

    controller.scrub();
    controller.set_name(&ctx.controller_name);
    controller.metadata_mut().namespace = Some(ctx.request.namespace.clone());

    let managed = managed_labels(&ctx.request.release_id, ctx.revision);
    merge_labels(
        controller
            .metadata_mut()
            .labels
            .get_or_insert_with(Default::default),
        &managed,
    );

    stamp_template(&mut controller, &managed, ctx)?;
    controller.set_replicas(ctx.replicas);

    if ctx.request.controller_kind == ControllerKind::StatefulSet {
        if let Some(existing) = existing {
            return Ok(merge_stateful_set(existing, &controller));
        }
        // First rollout of a StatefulSet. The selector set now is immutable,
        // so it excludes the revision label.
        let mut selector = BTreeMap::new();
        selector.insert(RELEASE_LABEL_KEY.to_string(), label_value(&ctx.request.release_id));
        if controller.pod_selector().is_empty() {
            controller.set_pod_selector(selector);
        }
        return Ok(controller);
    }

    if ctx.request.controller_kind.is_versioned() {
        // Pods of each revision must be addressable on their own for
        // traffic shifting, so the selector pins the revision.
        let mut selector = BTreeMap::new();
        selector.insert(RELEASE_LABEL_KEY.to_string(), label_value(&ctx.request.release_id));
        selector.insert(REVISION_LABEL_KEY.to_string(), ctx.revision.to_string());
        controller.set_pod_selector(selector);
    } else if controller.pod_selector().is_empty() {
        let mut selector = BTreeMap::new();
        selector.insert(RELEASE_LABEL_KEY.to_string(), label_value(&ctx.request.release_id));
        controller.set_pod_selector(selector);
    }

    Ok(controller)
}

fn managed_labels(release_id: &str, revision: i32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL_KEY.to_string(), "true".to_string()),
        (RELEASE_LABEL_KEY.to_string(), label_value(release_id)),
        (REVISION_LABEL_KEY.to_string(), revision.to_string()),
    ])
}

/// Template-provided labels stay, managed keys overwrite on collision.
fn merge_labels(target: &mut BTreeMap<String, String>, managed: &BTreeMap<String, String>) {
    for (k, v) in managed {
        target.insert(k.clone(), v.clone());
    }
}

fn stamp_template(
    controller: &mut Controller,
    managed: &BTreeMap<String, String>,
    ctx: &DefinitionContext<'_>,
) -> Result<(), EngineError> {
    let image = ctx.request.image.reference();
    let registry_secret = ctx.registry_secret.clone();
    let env = injected_env(ctx);

    let template = controller.pod_template_mut();
    let meta = template.metadata.get_or_insert_with(Default::default);
    merge_labels(meta.labels.get_or_insert_with(Default::default), managed);

    let spec = template.spec.get_or_insert_with(Default::default);
    if spec.containers.is_empty() {
        return Err(EngineError::Validation(
            "controller manifest has no containers".into(),
        ));
    }
    spec.containers[0].image = Some(image);
    for container in &mut spec.containers {
        let target = container.env.get_or_insert_with(Default::default);
        for var in &env {
            target.retain(|e| e.name != var.name);
            target.push(var.clone());
        }
    }
    if let Some(secret) = registry_secret {
        let pull = spec.image_pull_secrets.get_or_insert_with(Default::default);
        if !pull.iter().any(|r| r.name == secret) {
            pull.push(LocalObjectReference { name: secret });
        }
    }
    Ok(())
}

/// Environment variables from the request. Both maps are injected by
/// reference so the manifest never carries the values themselves. Invalid
/// names or oversized values are skipped with a warning rather than
/// failing the rollout.
fn injected_env(ctx: &DefinitionContext<'_>) -> Vec<EnvVar> {
    let mut env = Vec::new();
    if let Some(config_map) = &ctx.config_map_name {
        for (name, value) in &ctx.request.config_values {
            if !injectable(name, value, "config") {
                continue;
            }
            env.push(EnvVar {
                name: name.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    config_map_key_ref: Some(ConfigMapKeySelector {
                        name: config_map.clone(),
                        key: name.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            });
        }
    }
    if let Some(secret_map) = &ctx.secret_map_name {
        for (name, value) in &ctx.request.secret_values {
            if !injectable(name, value, "secret") {
                continue;
            }
            env.push(EnvVar {
                name: name.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_map.clone(),
                        key: name.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            });
        }
    }
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env
}

fn injectable(name: &str, value: &str, source: &str) -> bool {
    if !valid_env_name(name) {
        tracing::warn!(name = %name, source = %source, "skipping value with invalid env name");
        return false;
    }
    if value.len() > MAX_ENV_VALUE_LEN {
        tracing::warn!(name = %name, source = %source, len = value.len(), "skipping oversized value");
        return false;
    }
    true
}

fn valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn substitute_placeholders(yaml: &str, ctx: &DefinitionContext<'_>) -> String {
    let prefix = &ctx.request.controller_name_prefix;
    let port = ctx
        .request
        .service
        .as_ref()
        .map(|s| s.port)
        .unwrap_or(80)
        .to_string();
    let mut out = yaml
        .replace(SERVICE_NAME_PLACEHOLDER, &convention::service_name(prefix))
        .replace(SERVICE_PORT_PLACEHOLDER, &port)
        .replace(
            convention::PRIMARY_SERVICE_NAME_PLACEHOLDER,
            &convention::primary_service_name(prefix),
        )
        .replace(convention::PRIMARY_SERVICE_PORT_PLACEHOLDER, &port)
        .replace(
            convention::STAGE_SERVICE_NAME_PLACEHOLDER,
            &convention::stage_service_name(prefix),
        )
        .replace(convention::STAGE_SERVICE_PORT_PLACEHOLDER, &port);
    if let Some(cm) = &ctx.config_map_name {
        out = out.replace(CONFIG_MAP_NAME_PLACEHOLDER, cm);
    }
    if let Some(sm) = &ctx.secret_map_name {
        out = out.replace(SECRET_MAP_NAME_PLACEHOLDER, sm);
    }
    out
}

fn default_controller(ctx: &DefinitionContext<'_>) -> Controller {
    let mut controller = match ctx.request.controller_kind {
        ControllerKind::Deployment => Controller::Deployment(Default::default()),
        ControllerKind::ReplicaSet => Controller::ReplicaSet(Default::default()),
        ControllerKind::ReplicationController => {
            Controller::ReplicationController(Default::default())
        }
        ControllerKind::StatefulSet => Controller::StatefulSet(Default::default()),
        ControllerKind::DaemonSet => Controller::DaemonSet(Default::default()),
    };
    let ports = ctx.request.service.as_ref().map(|s| {
        vec![ContainerPort {
            container_port: s.target_port,
            protocol: Some(s.protocol.clone()),
            ..Default::default()
        }]
    });
    let template = controller.pod_template_mut();
    template.spec.get_or_insert_with(Default::default).containers = vec![Container {
        name: sanitize_name(&ctx.request.controller_name_prefix),
        ports,
        ..Default::default()
    }];
    controller
}

/// StatefulSets are updated in place instead of getting a sibling per
/// revision. Only the mutable parts of the spec are taken from the new
/// build; the selector stays as the server has it, and the pod labels are
/// re-aligned with it so the pods keep matching.
fn merge_stateful_set(existing: &Controller, built: &Controller) -> Controller {
    let (Controller::StatefulSet(existing), Controller::StatefulSet(built)) = (existing, built)
    else {
        return built.clone();
    };
    let mut merged = existing.clone();
    let spec = merged.spec.get_or_insert_with(Default::default);
    if let Some(built_spec) = &built.spec {
        spec.replicas = built_spec.replicas;
        spec.template = built_spec.template.clone();
        spec.update_strategy = built_spec.update_strategy.clone();
    }
    if let Some(selector_labels) = &spec.selector.match_labels {
        let meta = spec.template.metadata.get_or_insert_with(Default::default);
        let labels = meta.labels.get_or_insert_with(Default::default);
        for (k, v) in selector_labels {
            labels.insert(k.clone(), v.clone());
        }
    }
    merged.metadata.labels = built.metadata.labels.clone();
    let mut out = Controller::StatefulSet(merged);
    out.scrub();
    out
}
