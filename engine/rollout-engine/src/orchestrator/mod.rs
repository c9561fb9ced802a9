//! The rollout flow. One run discovers the revision family, captures a
//! snapshot of the replaceable state, applies the new revision and its
//! satellites in order, waits for steady state, then reconciles traffic
//! and retires stale revisions. A rollback run replays the snapshot
//! instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use rollout_models::{
    ControllerKind, DeploymentRequest, ReplicaPolicy, RolloutResult, RouteProvider,
    ServiceKind,
};
use tokio::time::{Instant, sleep};
use tracing::instrument;
use validator::Validate;

use crate::config::EngineConfig;
use crate::convention::{
    self, MANAGED_LABEL_KEY, RELEASE_LABEL_KEY, REVISION_LABEL_KEY, label_value,
};
use crate::definition::{self, DefinitionContext};
use crate::errors::{ClusterError, EngineError};
use crate::gateway::{ClusterGateway, Controller};
use crate::revision::{self, ActiveRevision};
use crate::snapshot::{RolloutSnapshot, SnapshotStore, strip_server_fields};
use crate::steady::{self, SteadyStateWaiter};
use crate::traffic;

pub mod resources;

pub struct RolloutOrchestrator {
    gateway: Arc<dyn ClusterGateway>,
    store: Arc<dyn SnapshotStore>,
    waiter: SteadyStateWaiter,
    cfg: EngineConfig,
}

impl RolloutOrchestrator {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        store: Arc<dyn SnapshotStore>,
        cfg: EngineConfig,
    ) -> Self {
        let waiter = SteadyStateWaiter::new(gateway.clone(), cfg.poll_interval());
        Self {
            gateway,
            store,
            waiter,
            cfg,
        }
    }

    /// Runs one rollout (or rollback) to completion. Never panics and never
    /// returns an error; failures come back as an unsuccessful result.
    #[instrument(skip_all, fields(ns = %request.namespace, release = %request.release_id))]
    pub async fn run(&self, request: &DeploymentRequest) -> RolloutResult {
        match self.execute(request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "rollout failed");
                RolloutResult {
                    success: false,
                    namespace: request.namespace.clone(),
                    summary: e.to_string(),
                    ..Default::default()
                }
            }
        }
    }

    async fn execute(&self, request: &DeploymentRequest) -> Result<RolloutResult, EngineError> {
        request.validate()?;
        if request.rollback {
            return self.rollback(request).await;
        }
        if let Some(mesh) = &request.mesh_routing {
            traffic::validate_rules(mesh.provider, &mesh.rules)?;
        }
        if request.blue_green.is_some()
            && request
                .service
                .as_ref()
                .is_some_and(|s| s.kind != ServiceKind::None)
        {
            return Err(EngineError::Validation(
                "blue/green mode manages its own services; set the service kind to None".into(),
            ));
        }

        let ns = &request.namespace;
        let prefix = &request.controller_name_prefix;
        let kind = request.controller_kind;
        let budget = self.cfg.step_timeout(request.timeout_minutes);
        let labels = release_labels(request);
        let annotations = object_annotations(request);

        let registry_secret =
            match resources::registry_secret(&request.image, &labels) {
                Some(secret) => {
                    let name = secret.metadata.name.clone().unwrap_or_default();
                    self.gateway.apply_secret(ns, &secret).await?;
                    Some(name)
                }
                None => None,
            };

        let family =
            revision::list_release_controllers(self.gateway.as_ref(), ns, kind, &request.release_id)
                .await?;
        let active = revision::active_revisions(&family);
        let revision_num = if kind.is_versioned() {
            revision::next_revision(&family)
        } else {
            0
        };
        let controller_name = if kind.is_versioned() {
            convention::controller_name(prefix, revision_num)
        } else {
            prefix.clone()
        };
        tracing::info!(name = %controller_name, revision = revision_num, "starting rollout");

        // Everything recorded from here on must predate any mutation, and
        // a stale record from an earlier run must not survive into it.
        self.store.delete(ns, &request.release_id).await?;
        let (snapshot, active_autoscaler) = self.capture(request, &family).await?;
        self.store.save(ns, &request.release_id, &snapshot).await?;

        if request.blue_green.is_some() {
            self.retire_stage_revision(request, &family).await;
        }

        let config_map_name = if request.config_values.is_empty() {
            None
        } else {
            let cm = resources::config_map(
                &controller_name,
                &labels,
                &annotations,
                &request.config_values,
            );
            self.gateway.apply_config_map(ns, &cm).await?;
            Some(controller_name.clone())
        };
        let secret_map_name = if request.secret_values.is_empty() {
            None
        } else {
            let secret = resources::secret_map(
                &controller_name,
                &labels,
                &annotations,
                &request.secret_values,
            );
            self.gateway.apply_secret(ns, &secret).await?;
            Some(controller_name.clone())
        };

        let desired = desired_replicas(
            &request.replica_policy,
            revision::total_active_replicas(&active),
        );
        let existing = if kind.is_versioned() {
            None
        } else {
            self.gateway.get_controller(ns, kind, &controller_name).await?
        };
        let ctx = DefinitionContext {
            request,
            controller_name: controller_name.clone(),
            revision: revision_num,
            replicas: desired,
            config_map_name,
            secret_map_name,
            registry_secret,
        };
        let controller = definition::build_controller(&ctx, existing.as_ref())?;

        // The previous autoscaler would fight the replica counts below, so
        // it goes first, safely in the snapshot by now. A fresh one is
        // created only once the new revision is fully up.
        if let Some(name) = &active_autoscaler {
            if let Err(e) = self.gateway.delete_autoscaler(ns, name).await {
                tracing::warn!(name = %name, error = %e, "failed to delete previous autoscaler");
            }
        }

        let applied = self.gateway.apply_controller(ns, &controller).await?;

        let mut load_balancer_url = None;
        let mut node_ports = None;
        if let Some(bg) = &request.blue_green {
            self.apply_blue_green(request, bg, &labels, &annotations, revision_num)
                .await?;
        } else if let Some(input) = &request.service {
            if input.kind == ServiceKind::None {
                self.remove_managed_service(ns, &convention::service_name(prefix))
                    .await;
            } else {
                let svc_name = convention::service_name(prefix);
                let selector = stable_selector(request);
                let existing_svc = self.gateway.get_service(ns, &svc_name).await?;
                let svc = resources::service(
                    &svc_name,
                    input,
                    &selector,
                    &labels,
                    &annotations,
                    existing_svc.as_ref(),
                )?;
                self.gateway.apply_service(ns, &svc).await?;
                if let Some(yaml) = &request.ingress_yaml {
                    let ingress = resources::ingress(
                        yaml,
                        &convention::ingress_name(prefix),
                        &svc_name,
                        input.port,
                    )?;
                    self.gateway.apply_ingress(ns, &ingress).await?;
                }
                if input.kind == ServiceKind::LoadBalancer {
                    load_balancer_url = self.await_load_balancer(ns, &svc_name).await?;
                }
                if matches!(input.kind, ServiceKind::NodePort | ServiceKind::LoadBalancer) {
                    node_ports = self.collect_node_ports(ns, &svc_name).await?;
                }
            }
        }

        let expected = match kind {
            ControllerKind::DaemonSet => applied.replicas().max(1),
            _ => desired,
        };
        let outcomes = self
            .waiter
            .await_steady(ns, &controller.pod_selector(), expected, budget)
            .await?;
        if !steady::is_steady(&outcomes, expected) {
            let ready = outcomes
                .iter()
                .filter(|o| o.is_success())
                .map(|o| o.pod_name.as_str())
                .collect::<std::collections::BTreeSet<_>>()
                .len();
            return Err(EngineError::Fatal(format!(
                "{} did not reach steady state: {ready}/{expected} pods ready",
                controller_name
            )));
        }

        let autoscaler_yaml = match &request.autoscaler {
            Some(policy) => {
                let hpa = resources::autoscaler(
                    &controller_name,
                    kind,
                    &controller_name,
                    policy,
                    &labels,
                )?;
                self.gateway.apply_autoscaler(ns, &hpa).await?;
                Some(serde_yaml::to_string(&hpa).map_err(ClusterError::codec)?)
            }
            None => None,
        };

        if kind.is_versioned() {
            self.downsize_and_cleanup(request, revision_num, desired).await;
        }

        if request.mesh_routing.is_some() {
            self.reconcile_traffic(request, revision_num).await?;
        } else {
            self.remove_traffic_objects(request).await;
        }

        tracing::info!(name = %controller_name, "rollout complete");
        Ok(RolloutResult {
            success: true,
            controller_name,
            namespace: ns.clone(),
            load_balancer_url,
            node_ports,
            autoscaler_yaml,
            summary: format!(
                "deployed revision {revision_num} of {prefix} with {desired} desired pods"
            ),
        })
    }

    /// Records whatever the latest revision currently looks like. A blob is
    /// absent exactly when the resource does not exist, which is what tells
    /// rollback to delete instead of restore. Also returns the name of the
    /// autoscaler that was captured, since that is the one the swap step
    /// may delete.
    async fn capture(
        &self,
        request: &DeploymentRequest,
        family: &[Controller],
    ) -> Result<(RolloutSnapshot, Option<String>), EngineError> {
        let ns = &request.namespace;
        let kind = request.controller_kind;
        let current: Option<Controller> = if kind.is_versioned() {
            family
                .iter()
                .filter(|c| revision::revision_of(c).is_some())
                .max_by_key(|c| revision::revision_of(c).unwrap_or(-1))
                .cloned()
        } else {
            self.gateway
                .get_controller(ns, kind, &request.controller_name_prefix)
                .await?
        };

        let (controller_yaml, current_name) = match current {
            Some(mut c) => {
                c.scrub();
                let name = c.name().to_string();
                (Some(c.to_yaml()?), name)
            }
            None => (None, request.controller_name_prefix.clone()),
        };

        let config_map_yaml = match self.gateway.get_config_map(ns, &current_name).await? {
            Some(mut cm) => {
                strip_server_fields(&mut cm.metadata);
                Some(serde_yaml::to_string(&cm).map_err(ClusterError::codec)?)
            }
            None => None,
        };
        let secret_map_yaml = match self.gateway.get_secret(ns, &current_name).await? {
            Some(mut secret) => {
                strip_server_fields(&mut secret.metadata);
                Some(serde_yaml::to_string(&secret).map_err(ClusterError::codec)?)
            }
            None => None,
        };
        // Versioned kinds may carry the autoscaler on an older active
        // revision than the one being replaced, so the scan walks the
        // active revisions newest first and records the first hit.
        let mut candidates: Vec<String> = if kind.is_versioned() {
            let mut active = revision::active_revisions(family);
            active.reverse();
            active.into_iter().map(|a| a.name).collect()
        } else {
            vec![current_name.clone()]
        };
        if candidates.is_empty() {
            candidates.push(current_name.clone());
        }
        let mut autoscaler_yaml = None;
        let mut autoscaler_name = None;
        for name in candidates {
            if let Some(mut hpa) = self.gateway.get_autoscaler(ns, &name).await? {
                strip_server_fields(&mut hpa.metadata);
                hpa.status = None;
                autoscaler_yaml = Some(serde_yaml::to_string(&hpa).map_err(ClusterError::codec)?);
                autoscaler_name = Some(name);
                break;
            }
        }

        Ok((
            RolloutSnapshot {
                controller_yaml,
                config_map_yaml,
                secret_map_yaml,
                autoscaler_yaml,
            },
            autoscaler_name,
        ))
    }

    async fn rollback(&self, request: &DeploymentRequest) -> Result<RolloutResult, EngineError> {
        let ns = &request.namespace;
        let prefix = &request.controller_name_prefix;
        let kind = request.controller_kind;
        let budget = self.cfg.step_timeout(request.timeout_minutes);

        let snapshot = self
            .store
            .load(ns, &request.release_id)
            .await?
            .ok_or_else(|| {
                EngineError::Fatal("no rollout snapshot recorded for this release".into())
            })?;

        let family =
            revision::list_release_controllers(self.gateway.as_ref(), ns, kind, &request.release_id)
                .await?;
        let latest_name = if kind.is_versioned() {
            family
                .iter()
                .filter_map(revision::revision_of)
                .max()
                .map(|rev| convention::controller_name(prefix, rev))
                .unwrap_or_else(|| prefix.clone())
        } else {
            prefix.clone()
        };
        tracing::info!(latest = %latest_name, "rolling back");

        let restored_name = match &snapshot.controller_yaml {
            Some(yaml) => {
                let mut controller = Controller::from_yaml(yaml)?;
                controller.scrub();
                let name = controller.name().to_string();
                self.gateway.apply_controller(ns, &controller).await?;
                if kind.is_versioned() && latest_name != name {
                    if let Err(e) = self.gateway.delete_controller(ns, kind, &latest_name).await
                    {
                        tracing::warn!(name = %latest_name, error = %e, "failed to delete failed revision");
                    }
                }
                let expected = controller.replicas();
                let outcomes = self
                    .waiter
                    .await_steady(ns, &controller.pod_selector(), expected, budget)
                    .await?;
                if !steady::is_steady(&outcomes, expected) {
                    return Err(EngineError::Fatal(format!(
                        "restored controller {name} did not reach steady state"
                    )));
                }
                name
            }
            None => {
                // Nothing existed before this release; the rollout itself
                // is what must go.
                self.gateway.delete_controller(ns, kind, &latest_name).await?;
                latest_name.clone()
            }
        };

        // The failed revision's satellites carry its name, not the restored
        // one's, so they are removed separately.
        if latest_name != restored_name {
            for deletion in [
                self.gateway.delete_autoscaler(ns, &latest_name).await,
                self.gateway.delete_config_map(ns, &latest_name).await,
                self.gateway.delete_secret(ns, &latest_name).await,
            ] {
                if let Err(e) = deletion {
                    tracing::warn!(name = %latest_name, error = %e, "failed to delete failed revision satellite");
                }
            }
        }

        match &snapshot.config_map_yaml {
            Some(yaml) => {
                let cm: ConfigMap = serde_yaml::from_str(yaml).map_err(ClusterError::codec)?;
                self.gateway.apply_config_map(ns, &cm).await?;
            }
            None => {
                if let Err(e) = self.gateway.delete_config_map(ns, &restored_name).await {
                    tracing::warn!(error = %e, "failed to delete config map during rollback");
                }
            }
        }
        match &snapshot.secret_map_yaml {
            Some(yaml) => {
                let secret: Secret = serde_yaml::from_str(yaml).map_err(ClusterError::codec)?;
                self.gateway.apply_secret(ns, &secret).await?;
            }
            None => {
                if let Err(e) = self.gateway.delete_secret(ns, &restored_name).await {
                    tracing::warn!(error = %e, "failed to delete secret map during rollback");
                }
            }
        }
        // The autoscaler is only ever restored, never deleted here: an
        // absent blob can mean it was created after the snapshot was taken.
        if let Some(yaml) = &snapshot.autoscaler_yaml {
            let hpa = serde_yaml::from_str(yaml).map_err(ClusterError::codec)?;
            self.gateway.apply_autoscaler(ns, &hpa).await?;
        }

        Ok(RolloutResult {
            success: true,
            controller_name: restored_name.clone(),
            namespace: ns.clone(),
            summary: format!("rolled back to recorded state of {restored_name}"),
            ..Default::default()
        })
    }

    /// Scales down whatever revision the stage service currently points to,
    /// so the slot is free for the incoming one. Skipped when the primary
    /// service still routes to it.
    async fn retire_stage_revision(&self, request: &DeploymentRequest, family: &[Controller]) {
        let ns = &request.namespace;
        let prefix = &request.controller_name_prefix;
        let stage_rev = self
            .service_revision(ns, &convention::stage_service_name(prefix))
            .await;
        let Some(stage_rev) = stage_rev else { return };
        let primary_rev = self
            .service_revision(ns, &convention::primary_service_name(prefix))
            .await;
        if primary_rev == Some(stage_rev) {
            return;
        }
        let Some(controller) = family
            .iter()
            .find(|c| revision::revision_of(c) == Some(stage_rev))
        else {
            return;
        };
        if controller.replicas() == 0 {
            return;
        }
        tracing::info!(revision = stage_rev, "retiring previous stage revision");
        let name = controller.name().to_string();
        if let Err(e) = self
            .gateway
            .scale_controller(ns, request.controller_kind, &name, 0)
            .await
        {
            tracing::warn!(name = %name, error = %e, "failed to scale down stage revision");
            return;
        }
        if let Err(e) = self
            .waiter
            .await_drained(ns, &controller.pod_selector(), self.cfg.healthcheck_timeout())
            .await
        {
            tracing::warn!(name = %name, error = %e, "stage revision did not drain");
        }
    }

    async fn service_revision(&self, ns: &str, name: &str) -> Option<i32> {
        let svc = self.gateway.get_service(ns, name).await.ok()??;
        svc.spec?
            .selector?
            .get(REVISION_LABEL_KEY)?
            .parse()
            .ok()
    }

    /// Stage always moves to the new revision; primary keeps routing to
    /// whatever it already serves and is pinned to the new revision only on
    /// the very first blue/green rollout.
    async fn apply_blue_green(
        &self,
        request: &DeploymentRequest,
        bg: &rollout_models::BlueGreenSpec,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        new_revision: i32,
    ) -> Result<(), EngineError> {
        let ns = &request.namespace;
        let prefix = &request.controller_name_prefix;

        let stage_name = convention::stage_service_name(prefix);
        let stage_selector = revision_selector(request, new_revision);
        let existing_stage = self.gateway.get_service(ns, &stage_name).await?;
        let stage = resources::service(
            &stage_name,
            &bg.stage_service,
            &stage_selector,
            labels,
            annotations,
            existing_stage.as_ref(),
        )?;
        self.gateway.apply_service(ns, &stage).await?;

        let primary_name = convention::primary_service_name(prefix);
        let existing_primary = self.gateway.get_service(ns, &primary_name).await?;
        let primary_selector = existing_primary
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.selector.clone())
            .unwrap_or_else(|| revision_selector(request, new_revision));
        let primary = resources::service(
            &primary_name,
            &bg.primary_service,
            &primary_selector,
            labels,
            annotations,
            existing_primary.as_ref(),
        )?;
        self.gateway.apply_service(ns, &primary).await?;

        if let Some(yaml) = bg.ingress_yaml.as_deref().or(request.ingress_yaml.as_deref()) {
            let ingress = resources::ingress(
                yaml,
                &convention::ingress_name(prefix),
                &primary_name,
                bg.primary_service.port,
            )?;
            self.gateway.apply_ingress(ns, &ingress).await?;
        }
        Ok(())
    }

    async fn await_load_balancer(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        let deadline = Instant::now() + self.cfg.healthcheck_timeout();
        loop {
            if let Some(svc) = self.gateway.get_service(ns, name).await? {
                let endpoint = svc
                    .status
                    .and_then(|s| s.load_balancer)
                    .and_then(|lb| lb.ingress)
                    .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
                    .and_then(|ing| ing.hostname.or(ing.ip));
                if let Some(host) = endpoint {
                    return Ok(Some(host));
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(name = %name, "load balancer endpoint not provisioned in time");
                return Ok(None);
            }
            sleep(self.cfg.poll_interval()).await;
        }
    }

    async fn collect_node_ports(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        let Some(svc) = self.gateway.get_service(ns, name).await? else {
            return Ok(None);
        };
        let ports: Vec<String> = svc
            .spec
            .and_then(|s| s.ports)
            .unwrap_or_default()
            .iter()
            .filter_map(|p| p.node_port)
            .map(|p| p.to_string())
            .collect();
        Ok((!ports.is_empty()).then(|| ports.join(",")))
    }

    /// Post-deploy housekeeping across the revision family. Everything in
    /// here is best-effort: the new revision is already serving, so a
    /// failure to retire an old one must not fail the rollout.
    async fn downsize_and_cleanup(
        &self,
        request: &DeploymentRequest,
        new_revision: i32,
        desired: i32,
    ) {
        let ns = &request.namespace;
        let kind = request.controller_kind;
        let family = match revision::list_release_controllers(
            self.gateway.as_ref(),
            ns,
            kind,
            &request.release_id,
        )
        .await
        {
            Ok(family) => family,
            Err(e) => {
                tracing::warn!(error = %e, "skipping downsize, could not list revisions");
                return;
            }
        };
        let mut old: Vec<ActiveRevision> = revision::active_revisions(&family)
            .into_iter()
            .filter(|a| a.revision != new_revision)
            .collect();

        // Readiness recheck. A revision that cannot hold its own count is
        // not worth keeping traffic capacity for.
        for entry in &mut old {
            let Some(controller) = family.iter().find(|c| c.name() == entry.name) else {
                continue;
            };
            match self
                .waiter
                .await_steady(
                    ns,
                    &controller.pod_selector(),
                    entry.replicas,
                    self.cfg.healthcheck_timeout(),
                )
                .await
            {
                Ok(outcomes) if steady::is_steady(&outcomes, entry.replicas) => {}
                Ok(_) => {
                    tracing::warn!(name = %entry.name, "scaling unhealthy revision to zero");
                    if self
                        .gateway
                        .scale_controller(ns, kind, &entry.name, 0)
                        .await
                        .is_ok()
                    {
                        entry.replicas = 0;
                    }
                }
                Err(e) => {
                    tracing::warn!(name = %entry.name, error = %e, "health recheck failed");
                }
            }
        }

        // Oldest revisions give up capacity first until the family fits the
        // allowed ceiling again. A fixed count carries no family ceiling, so
        // only unhealthy revisions lose capacity there.
        let allowed_old = if request.replica_policy.is_fixed() {
            i32::MAX
        } else {
            (request.replica_policy.max_allowed() - desired).max(0)
        };
        let mut total_old: i32 = old.iter().map(|a| a.replicas).sum();
        for entry in &mut old {
            if total_old <= allowed_old {
                break;
            }
            let excess = total_old - allowed_old;
            let target = (entry.replicas - excess).max(0);
            if target == entry.replicas {
                continue;
            }
            tracing::info!(name = %entry.name, from = entry.replicas, to = target, "downsizing old revision");
            match self.gateway.scale_controller(ns, kind, &entry.name, target).await {
                Ok(()) => {
                    total_old -= entry.replicas - target;
                    entry.replicas = target;
                }
                Err(e) => {
                    tracing::warn!(name = %entry.name, error = %e, "failed to downsize old revision");
                }
            }
        }

        // Fully drained revisions and their satellites go away.
        let family = match revision::list_release_controllers(
            self.gateway.as_ref(),
            ns,
            kind,
            &request.release_id,
        )
        .await
        {
            Ok(family) => family,
            Err(e) => {
                tracing::warn!(error = %e, "skipping cleanup, could not list revisions");
                return;
            }
        };
        for controller in &family {
            let is_old = revision::revision_of(controller)
                .is_some_and(|rev| rev != new_revision);
            if !is_old || controller.replicas() != 0 {
                continue;
            }
            let name = controller.name().to_string();
            tracing::info!(name = %name, "deleting drained revision");
            for deletion in [
                self.gateway.delete_controller(ns, kind, &name).await,
                self.gateway.delete_autoscaler(ns, &name).await,
                self.gateway.delete_config_map(ns, &name).await,
                self.gateway.delete_secret(ns, &name).await,
            ] {
                if let Err(e) = deletion {
                    tracing::warn!(name = %name, error = %e, "cleanup deletion failed");
                }
            }
        }

        self.delete_orphan_services(request).await;
    }

    /// Managed services that no longer select any pod are left over from
    /// older naming schemes or abandoned experiments. The stable, primary
    /// and stage names are always kept.
    async fn delete_orphan_services(&self, request: &DeploymentRequest) {
        let ns = &request.namespace;
        let prefix = &request.controller_name_prefix;
        let keep = [
            convention::service_name(prefix),
            convention::primary_service_name(prefix),
            convention::stage_service_name(prefix),
        ];
        let services = match self.gateway.list_services(ns).await {
            Ok(services) => services,
            Err(e) => {
                tracing::warn!(error = %e, "skipping orphan service sweep");
                return;
            }
        };
        let release = label_value(&request.release_id);
        for svc in services {
            let name = svc.metadata.name.clone().unwrap_or_default();
            if keep.contains(&name) {
                continue;
            }
            let ours = svc
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(RELEASE_LABEL_KEY))
                .is_some_and(|v| *v == release);
            if !ours {
                continue;
            }
            let Some(selector) = svc.spec.as_ref().and_then(|s| s.selector.clone()) else {
                continue;
            };
            match self.gateway.list_pods(ns, &selector).await {
                Ok(pods) if pods.is_empty() => {
                    tracing::info!(name = %name, "deleting orphan service");
                    if let Err(e) = self.gateway.delete_service(ns, &name).await {
                        tracing::warn!(name = %name, error = %e, "failed to delete orphan service");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "could not inspect orphan candidate");
                }
            }
        }
    }

    /// An explicit service kind of `None` retires a previously managed
    /// stable service; a service this engine never created is left alone.
    async fn remove_managed_service(&self, ns: &str, name: &str) {
        let existing = match self.gateway.get_service(ns, name).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "could not look up service to retire");
                return;
            }
        };
        let managed = existing
            .as_ref()
            .and_then(|s| s.metadata.labels.as_ref())
            .and_then(|l| l.get(MANAGED_LABEL_KEY))
            .is_some_and(|v| v == "true");
        if !managed {
            return;
        }
        tracing::info!(name = %name, "removing managed service per request");
        if let Err(e) = self.gateway.delete_service(ns, name).await {
            tracing::warn!(name = %name, error = %e, "failed to remove managed service");
        }
    }

    /// With mesh routing disabled, previously applied routing objects for
    /// this release are removed so stale splits cannot linger.
    async fn remove_traffic_objects(&self, request: &DeploymentRequest) {
        let ns = &request.namespace;
        let name = convention::service_name(&request.controller_name_prefix);
        for kind in [
            traffic::VIRTUAL_SERVICE_KIND,
            traffic::DESTINATION_RULE_KIND,
            traffic::TRAFFIC_SPLIT_KIND,
        ] {
            if let Err(e) = self.gateway.delete_mesh_resource(ns, kind, &name).await {
                tracing::warn!(kind = %kind, error = %e, "failed to remove mesh object");
            }
        }
    }

    /// Re-reads the family and points the mesh at the current replica
    /// proportions.
    async fn reconcile_traffic(
        &self,
        request: &DeploymentRequest,
        new_revision: i32,
    ) -> Result<(), EngineError> {
        let Some(mesh) = &request.mesh_routing else {
            return Ok(());
        };
        let ns = &request.namespace;
        let prefix = &request.controller_name_prefix;
        let family = revision::list_release_controllers(
            self.gateway.as_ref(),
            ns,
            request.controller_kind,
            &request.release_id,
        )
        .await?;
        let active = revision::active_revisions(&family);
        let weights = traffic::compute_weights(&active, new_revision);
        tracing::info!(?weights, "reconciling traffic split");
        match mesh.provider {
            RouteProvider::Istio => {
                let dr = traffic::destination_rule(prefix, &weights, new_revision);
                self.gateway
                    .apply_mesh_resource(ns, traffic::DESTINATION_RULE_KIND, dr)
                    .await?;
                let vs = traffic::virtual_service(prefix, mesh, &weights);
                self.gateway
                    .apply_mesh_resource(ns, traffic::VIRTUAL_SERVICE_KIND, vs)
                    .await?;
            }
            RouteProvider::Smi => {
                let split = traffic::traffic_split(prefix, &weights);
                self.gateway
                    .apply_mesh_resource(ns, traffic::TRAFFIC_SPLIT_KIND, split)
                    .await?;
            }
        }
        Ok(())
    }
}

fn desired_replicas(policy: &ReplicaPolicy, total_active: i32) -> i32 {
    match policy {
        ReplicaPolicy::Fixed(n) => *n,
        ReplicaPolicy::MaxBased(ceiling) => (*ceiling).max(total_active),
    }
}

fn release_labels(request: &DeploymentRequest) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL_KEY.to_string(), "true".to_string()),
        (
            RELEASE_LABEL_KEY.to_string(),
            label_value(&request.release_id),
        ),
    ])
}

fn stable_selector(request: &DeploymentRequest) -> BTreeMap<String, String> {
    BTreeMap::from([(
        RELEASE_LABEL_KEY.to_string(),
        label_value(&request.release_id),
    )])
}

fn revision_selector(request: &DeploymentRequest, revision: i32) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            RELEASE_LABEL_KEY.to_string(),
            label_value(&request.release_id),
        ),
        (REVISION_LABEL_KEY.to_string(), revision.to_string()),
    ])
}

fn object_annotations(request: &DeploymentRequest) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    if let Some(app) = &request.app_name {
        annotations.insert(convention::APP_ANNOTATION_KEY.to_string(), app.clone());
    }
    if let Some(service) = &request.service_name {
        annotations.insert(convention::SERVICE_ANNOTATION_KEY.to_string(), service.clone());
    }
    if let Some(env) = &request.env_name {
        annotations.insert(convention::ENV_ANNOTATION_KEY.to_string(), env.clone());
    }
    annotations
}
