mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{FakeGateway, LB_IP};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rollout_engine::config::EngineConfig;
use rollout_engine::gateway::ClusterGateway;
use rollout_engine::orchestrator::RolloutOrchestrator;
use rollout_engine::snapshot::{RolloutSnapshot, SecretSnapshotStore, SnapshotStore};
use rollout_models::{
    BlueGreenSpec, ControllerKind, DeploymentRequest, ImageDetails, MatchType, MeshRoutingSpec,
    ReplicaPolicy, RouteProvider, RuleType, ServiceKind, ServiceSpecInput, TrafficRule,
};

fn engine(gateway: Arc<FakeGateway>) -> RolloutOrchestrator {
    let cfg = EngineConfig {
        field_manager: "rollout-engine".into(),
        poll_interval_secs: 0,
        default_timeout_minutes: 1,
        healthcheck_timeout_secs: 1,
        request_file: "unused".into(),
    };
    let gw: Arc<dyn ClusterGateway> = gateway;
    let store = Arc::new(SecretSnapshotStore::new(gw.clone()));
    RolloutOrchestrator::new(gw, store, cfg)
}

fn service_input(kind: ServiceKind) -> ServiceSpecInput {
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

fn request(policy: ReplicaPolicy) -> DeploymentRequest {
    DeploymentRequest {
        namespace: "prod".into(),
        controller_name_prefix: "web".into(),
        release_id: "web-release".into(),
        image: ImageDetails {
            name: "registry.example.com/web".into(),
            tag: "2.0.0".into(),
            registry_url: None,
            username: None,
            password: None,
        },
        controller_kind: ControllerKind::Deployment,
        replica_policy: policy,
        service: Some(service_input(ServiceKind::ClusterIp)),
        ingress_yaml: None,
        autoscaler: None,
        mesh_routing: None,
        blue_green: None,
        rollback: false,
        timeout_minutes: 1,
        config_values: HashMap::new(),
        secret_values: HashMap::new(),
        controller_yaml: None,
        app_name: None,
        service_name: None,
        env_name: None,
    }
}

const SEED_REVISION_0: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web-0
  labels:
    rollouts.io/managed: "true"
    rollouts.io/release: web-release
    rollouts.io/revision: "0"
spec:
  replicas: 3
  selector:
    matchLabels:
      rollouts.io/release: web-release
      rollouts.io/revision: "0"
  template:
    metadata:
      labels:
        rollouts.io/release: web-release
        rollouts.io/revision: "0"
    spec:
      containers:
        - name: web
          image: registry.example.com/web:1.0.0
"#;

#[test_log::test(tokio::test)]
async fn first_deploy_creates_revision_zero() {
    let gateway = Arc::new(FakeGateway::new());
    let orchestrator = engine(gateway.clone());

    let mut req = request(ReplicaPolicy::Fixed(3));
    req.config_values.insert("FEATURE".into(), "on".into());

    let result = orchestrator.run(&req).await;
    assert!(result.success, "{}", result.summary);
    assert_eq!(result.controller_name, "web-0");

    let controller = gateway.controller("web-0").expect("controller applied");
    assert_eq!(controller.replicas(), 3);
    assert_eq!(controller.revision_label(), Some(0));

    let state = gateway.state.lock().unwrap();
    assert!(state.config_maps.contains_key("web-0"));
    assert!(
        state.secrets.contains_key("web-release-rollout-state"),
        "snapshot recorded before mutation"
    );
    let service = state.services.get("web").expect("stable service");
    let selector = service.spec.as_ref().unwrap().selector.clone().unwrap();
    assert_eq!(
        selector.get("rollouts.io/release").map(String::as_str),
        Some("web-release")
    );
    assert!(!selector.contains_key("rollouts.io/revision"));
}

#[test_log::test(tokio::test)]
async fn canary_deploy_splits_traffic_by_replica_count() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.seed_controller(SEED_REVISION_0);
    let orchestrator = engine(gateway.clone());

    let mut req = request(ReplicaPolicy::Fixed(1));
    req.mesh_routing = Some(MeshRoutingSpec {
        provider: RouteProvider::Istio,
        hosts: vec![],
        gateways: vec![],
        rules: vec![TrafficRule {
            rule_type: RuleType::Header,
            name: Some("x-canary".into()),
            value: Some("true".into()),
            values: vec![],
            match_type: Some(MatchType::Exact),
        }],
    });

    let result = orchestrator.run(&req).await;
    assert!(result.success, "{}", result.summary);
    assert_eq!(result.controller_name, "web-1");

    // A fixed count leaves the previous revision its capacity.
    assert_eq!(gateway.controller("web-0").unwrap().replicas(), 3);
    assert_eq!(gateway.controller("web-1").unwrap().replicas(), 1);

    let vs = gateway
        .mesh_resource("VirtualService", "web")
        .expect("virtual service applied");
    let route = &vs["spec"]["http"][0]["route"];
    assert_eq!(route[0]["destination"]["subset"], "r0");
    assert_eq!(route[0]["weight"], 75);
    assert_eq!(route[1]["destination"]["subset"], "r1");
    assert_eq!(route[1]["weight"], 25);

    let dr = gateway
        .mesh_resource("DestinationRule", "web")
        .expect("destination rule applied");
    let subsets = dr["spec"]["subsets"].as_array().unwrap();
    assert_eq!(subsets.len(), 2);
}

#[test_log::test(tokio::test)]
async fn unhealthy_old_revision_is_retired() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.seed_controller(SEED_REVISION_0);
    gateway.mark_unhealthy("web-0");
    let orchestrator = engine(gateway.clone());

    let result = orchestrator.run(&request(ReplicaPolicy::Fixed(2))).await;
    assert!(result.success, "{}", result.summary);

    assert!(gateway.controller("web-0").is_none(), "drained revision deleted");
    assert_eq!(gateway.controller("web-1").unwrap().replicas(), 2);
}

#[test_log::test(tokio::test)]
async fn max_based_deploy_replaces_old_capacity() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.seed_controller(SEED_REVISION_0);
    let orchestrator = engine(gateway.clone());

    let result = orchestrator.run(&request(ReplicaPolicy::MaxBased(3))).await;
    assert!(result.success, "{}", result.summary);

    assert_eq!(gateway.controller("web-1").unwrap().replicas(), 3);
    assert!(
        gateway.controller("web-0").is_none(),
        "old revision downsized to zero and cleaned up"
    );
}

#[test_log::test(tokio::test)]
async fn load_balancer_endpoint_is_reported() {
    let gateway = Arc::new(FakeGateway::new());
    let orchestrator = engine(gateway.clone());

    let mut req = request(ReplicaPolicy::Fixed(1));
    req.service = Some(service_input(ServiceKind::LoadBalancer));

    let result = orchestrator.run(&req).await;
    assert!(result.success, "{}", result.summary);
    assert_eq!(result.load_balancer_url.as_deref(), Some(LB_IP));
}

#[test_log::test(tokio::test)]
async fn blue_green_stage_moves_and_primary_stays() {
    let gateway = Arc::new(FakeGateway::new());
    let orchestrator = engine(gateway.clone());

    let mut req = request(ReplicaPolicy::Fixed(1));
    req.service = None;
    req.blue_green = Some(BlueGreenSpec {
        primary_service: service_input(ServiceKind::ClusterIp),
        stage_service: service_input(ServiceKind::ClusterIp),
        ingress_yaml: None,
    });

    let result = orchestrator.run(&req).await;
    assert!(result.success, "{}", result.summary);

    let revision_of = |gateway: &FakeGateway, name: &str| {
        gateway
            .service(name)
            .and_then(|s| s.spec)
            .and_then(|s| s.selector)
            .and_then(|sel| sel.get("rollouts.io/revision").cloned())
    };
    assert_eq!(revision_of(&gateway, "web-stage").as_deref(), Some("0"));
    assert_eq!(revision_of(&gateway, "web-primary").as_deref(), Some("0"));

    // Second deploy: stage follows the new revision, primary keeps serving
    // the one it already points to.
    let result = orchestrator.run(&req).await;
    assert!(result.success, "{}", result.summary);
    assert_eq!(revision_of(&gateway, "web-stage").as_deref(), Some("1"));
    assert_eq!(revision_of(&gateway, "web-primary").as_deref(), Some("0"));
}

#[test_log::test(tokio::test)]
async fn rollback_replays_the_snapshot() {
    let gateway = Arc::new(FakeGateway::new());
    let gw: Arc<dyn ClusterGateway> = gateway.clone();
    let store = SecretSnapshotStore::new(gw);

    // State as it was before the bad rollout: revision 0 at 2 replicas,
    // no config map and no secret map.
    let snapshot = RolloutSnapshot {
        controller_yaml: Some(SEED_REVISION_0.replace("replicas: 3", "replicas: 2")),
        ..Default::default()
    };
    store.save("prod", "web-release", &snapshot).await.unwrap();

    // The bad rollout left revision 1 running together with its config map
    // and secret map, and revision 0 drained.
    gateway.seed_controller(&SEED_REVISION_0.replace("replicas: 3", "replicas: 0"));
    gateway.seed_controller(
        &SEED_REVISION_0
            .replace("web-0", "web-1")
            .replace("\"0\"", "\"1\""),
    );
    {
        let mut state = gateway.state.lock().unwrap();
        state.config_maps.insert("web-1".into(), Default::default());
        state.secrets.insert("web-1".into(), Default::default());
    }

    let orchestrator = engine(gateway.clone());
    let mut req = request(ReplicaPolicy::Fixed(1));
    req.rollback = true;

    let result = orchestrator.run(&req).await;
    assert!(result.success, "{}", result.summary);
    assert_eq!(result.controller_name, "web-0");

    assert_eq!(gateway.controller("web-0").unwrap().replicas(), 2);
    assert!(gateway.controller("web-1").is_none(), "failed revision deleted");
    let state = gateway.state.lock().unwrap();
    assert!(
        !state.config_maps.contains_key("web-1"),
        "failed revision's config map removed with it"
    );
    assert!(!state.secrets.contains_key("web-1"));
    assert!(!state.config_maps.contains_key("web-0"));
}

#[test_log::test(tokio::test)]
async fn autoscaler_of_an_older_revision_is_snapshotted_before_removal() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.seed_controller(SEED_REVISION_0);
    gateway.seed_controller(
        &SEED_REVISION_0
            .replace("web-0", "web-1")
            .replace("\"0\"", "\"1\"")
            .replace("replicas: 3", "replicas: 1"),
    );
    // The autoscaler still sits on revision 0; revision 1 never got one.
    let hpa = HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some("web-0".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    gateway
        .state
        .lock()
        .unwrap()
        .autoscalers
        .insert("web-0".into(), hpa);

    let orchestrator = engine(gateway.clone());
    let result = orchestrator.run(&request(ReplicaPolicy::Fixed(1))).await;
    assert!(result.success, "{}", result.summary);

    let gw: Arc<dyn ClusterGateway> = gateway.clone();
    let store = SecretSnapshotStore::new(gw);
    let snapshot = store
        .load("prod", "web-release")
        .await
        .unwrap()
        .expect("snapshot recorded");
    let hpa_yaml = snapshot
        .autoscaler_yaml
        .expect("older revision's autoscaler captured");
    assert!(hpa_yaml.contains("web-0"));
    assert!(
        !gateway.state.lock().unwrap().autoscalers.contains_key("web-0"),
        "captured autoscaler removed before the new revision scales"
    );
}

#[test_log::test(tokio::test)]
async fn rollback_without_a_snapshot_fails() {
    let gateway = Arc::new(FakeGateway::new());
    let orchestrator = engine(gateway.clone());

    let mut req = request(ReplicaPolicy::Fixed(1));
    req.rollback = true;

    let result = orchestrator.run(&req).await;
    assert!(!result.success);
    assert!(result.summary.contains("no rollout snapshot"));
}

#[test_log::test(tokio::test)]
async fn invalid_traffic_rules_stop_the_rollout_before_any_mutation() {
    let gateway = Arc::new(FakeGateway::new());
    let orchestrator = engine(gateway.clone());

    let mut req = request(ReplicaPolicy::Fixed(1));
    req.mesh_routing = Some(MeshRoutingSpec {
        provider: RouteProvider::Istio,
        hosts: vec![],
        gateways: vec![],
        rules: vec![TrafficRule {
            rule_type: RuleType::Uri,
            name: None,
            value: Some("/api".into()),
            values: vec![],
            match_type: None,
        }],
    });

    let result = orchestrator.run(&req).await;
    assert!(!result.success);

    let state = gateway.state.lock().unwrap();
    assert!(state.controllers.is_empty());
    assert!(state.secrets.is_empty(), "no snapshot written either");
}
