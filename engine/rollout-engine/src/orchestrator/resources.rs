//! Manifest templates for everything the rollout applies besides the
//! controller itself: services, config and secret maps, the registry pull
//! secret, the autoscaler and the blue/green ingress.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use rollout_models::{
    AutoscalerPolicy, ControllerKind, ImageDetails, ServiceKind, ServiceSpecInput,
};

use crate::convention::{
    SERVICE_NAME_PLACEHOLDER, SERVICE_PORT_PLACEHOLDER, registry_secret_name,
};
use crate::errors::{ClusterError, EngineError};

fn meta(
    name: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels.clone()),
        annotations: (!annotations.is_empty()).then(|| annotations.clone()),
        ..Default::default()
    }
}

/// Builds a service of the requested kind. ClusterIPs and node ports the
/// server already allocated are kept from the existing object so a
/// re-apply does not churn them.
pub fn service(
    name: &str,
    input: &ServiceSpecInput,
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    existing: Option<&Service>,
) -> Result<Service, EngineError> {
    if input.kind == ServiceKind::Yaml {
        let yaml = input.service_yaml.as_deref().ok_or_else(|| {
            EngineError::Validation("service kind Yaml requires a service manifest".into())
        })?;
        let mut svc: Service = serde_yaml::from_str(yaml).map_err(ClusterError::codec)?;
        svc.metadata.name = Some(name.to_string());
        let spec = svc.spec.get_or_insert_with(Default::default);
        spec.selector = Some(selector.clone());
        return Ok(svc);
    }

    let type_ = match input.kind {
        ServiceKind::ClusterIp => "ClusterIP",
        ServiceKind::LoadBalancer => "LoadBalancer",
        ServiceKind::NodePort => "NodePort",
        ServiceKind::ExternalName => "ExternalName",
        ServiceKind::Yaml | ServiceKind::None => {
            return Err(EngineError::Validation(format!(
                "cannot build a typed manifest for service kind {:?}",
                input.kind
            )));
        }
    };

    let existing_spec = existing.and_then(|s| s.spec.as_ref());
    let node_port = input.node_port.or_else(|| {
        existing_spec
            .and_then(|s| s.ports.as_ref())
            .and_then(|p| p.first())
            .and_then(|p| p.node_port)
    });
    let cluster_ip = input
        .cluster_ip
        .clone()
        .or_else(|| existing_spec.and_then(|s| s.cluster_ip.clone()));

    let port = ServicePort {
        name: input.port_name.clone(),
        port: input.port,
        target_port: Some(IntOrString::Int(input.target_port)),
        protocol: Some(input.protocol.clone()),
        node_port: if input.kind == ServiceKind::NodePort || input.kind == ServiceKind::LoadBalancer
        {
            node_port
        } else {
            None
        },
        ..Default::default()
    };

    Ok(Service {
        metadata: meta(name, labels, annotations),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(vec![port]),
            selector: Some(selector.clone()),
            cluster_ip,
            external_ips: input.external_ips.as_ref().map(|ips| {
                ips.split(',').map(|ip| ip.trim().to_string()).collect()
            }),
            external_name: input.external_name.clone(),
            load_balancer_ip: input.load_balancer_ip.clone(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn config_map(
    name: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    values: &HashMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: meta(name, labels, annotations),
        data: Some(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        ..Default::default()
    }
}

pub fn secret_map(
    name: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    values: &HashMap<String, String>,
) -> Secret {
    Secret {
        metadata: meta(name, labels, annotations),
        type_: Some("Opaque".to_string()),
        string_data: Some(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        ..Default::default()
    }
}

/// Image pull secret for the request's registry. Returns nothing when the
/// image carries no credentials.
pub fn registry_secret(
    image: &ImageDetails,
    labels: &BTreeMap<String, String>,
) -> Option<Secret> {
    if !image.has_registry_credentials() {
        return None;
    }
    let registry = image.registry_url.as_deref()?;
    let docker_config = serde_json::json!({
        "auths": {
            registry: {
                "username": image.username,
                "password": image.password,
            }
        }
    });
    Some(Secret {
        metadata: ObjectMeta {
            name: Some(registry_secret_name(registry)),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        string_data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            docker_config.to_string(),
        )])),
        ..Default::default()
    })
}

/// HPA targeting the given controller. A custom-metric manifest replaces
/// the generated spec wholesale; only its name and scale-target ref are
/// rewritten.
pub fn autoscaler(
    name: &str,
    target_kind: ControllerKind,
    target_name: &str,
    policy: &AutoscalerPolicy,
    labels: &BTreeMap<String, String>,
) -> Result<HorizontalPodAutoscaler, EngineError> {
    let target_ref = CrossVersionObjectReference {
        api_version: Some(api_version_of(target_kind).to_string()),
        kind: target_kind.as_str().to_string(),
        name: target_name.to_string(),
    };

    if let Some(yaml) = &policy.custom_metric_yaml {
        let mut hpa: HorizontalPodAutoscaler =
            serde_yaml::from_str(yaml).map_err(ClusterError::codec)?;
        hpa.metadata.name = Some(name.to_string());
        hpa.metadata.labels = Some(labels.clone());
        hpa.spec.get_or_insert_with(Default::default).scale_target_ref = target_ref;
        return Ok(hpa);
    }

    Ok(HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: target_ref,
            min_replicas: Some(policy.min_instances),
            max_replicas: policy.max_instances,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(policy.target_cpu_utilization_percent),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn api_version_of(kind: ControllerKind) -> &'static str {
    match kind {
        ControllerKind::ReplicationController => "v1",
        _ => "apps/v1",
    }
}

pub fn ingress(
    yaml: &str,
    name: &str,
    service_name: &str,
    service_port: i32,
) -> Result<Ingress, ClusterError> {
    let substituted = yaml
        .replace(SERVICE_NAME_PLACEHOLDER, service_name)
        .replace(SERVICE_PORT_PLACEHOLDER, &service_port.to_string());
    let mut ingress: Ingress =
        serde_yaml::from_str(&substituted).map_err(ClusterError::codec)?;
    ingress.metadata.name = Some(name.to_string());
    Ok(ingress)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: ServiceKind) -> ServiceSpecInput {
        ServiceSpecInput {
            kind,
            port: 80,
            target_port: 8080,
            port_name: None,
            protocol: "TCP".into(),
            node_port: None,
            cluster_ip: None,
            external_ips: None,
            external_name: None,
            load_balancer_ip: None,
            service_yaml: None,
        }
    }

    #[test]
    fn node_port_service_keeps_server_allocated_port() {
        let existing = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 80,
                    node_port: Some(31942),
                    ..Default::default()
                }]),
                cluster_ip: Some("10.0.0.9".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let svc = service(
            "web",
            &input(ServiceKind::NodePort),
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            Some(&existing),
        )
        .unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.ports.unwrap()[0].node_port, Some(31942));
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn cluster_ip_service_never_sets_node_port() {
        let svc = service(
            "web",
            &ServiceSpecInput {
                node_port: Some(31000),
                ..input(ServiceKind::ClusterIp)
            },
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
        )
        .unwrap();
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].node_port, None);
    }

    #[test]
    fn yaml_service_requires_a_manifest() {
        let err = service(
            "web",
            &input(ServiceKind::Yaml),
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
        );
        assert!(matches!(err, Err(EngineError::Validation(_))));
    }

    #[test]
    fn registry_secret_skipped_without_credentials() {
        let image = ImageDetails {
            name: "web".into(),
            tag: "1".into(),
            registry_url: Some("registry.example.com".into()),
            username: None,
            password: None,
        };
        assert!(registry_secret(&image, &BTreeMap::new()).is_none());
    }

    #[test]
    fn default_autoscaler_targets_cpu_utilization() {
        let policy = AutoscalerPolicy {
            min_instances: 2,
            max_instances: 8,
            target_cpu_utilization_percent: 70,
            custom_metric_yaml: None,
        };
        let hpa = autoscaler(
            "web-3",
            ControllerKind::Deployment,
            "web-3",
            &policy,
            &BTreeMap::new(),
        )
        .unwrap();
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.scale_target_ref.kind, "Deployment");
        assert_eq!(spec.max_replicas, 8);
        let metric = &spec.metrics.unwrap()[0];
        assert_eq!(
            metric.resource.as_ref().unwrap().target.average_utilization,
            Some(70)
        );
    }

    #[test]
    fn ingress_substitutes_service_placeholders() {
        let yaml = r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: template
spec:
  defaultBackend:
    service:
      name: ${SERVICE_NAME}
      port:
        number: ${SERVICE_PORT}
"#;
        let ing = ingress(yaml, "web-ingress", "web", 80).unwrap();
        assert_eq!(ing.metadata.name.as_deref(), Some("web-ingress"));
        let backend = ing.spec.unwrap().default_backend.unwrap().service.unwrap();
        assert_eq!(backend.name, "web");
        assert_eq!(
            backend.port.unwrap().number,
            Some(80)
        );
    }
}
