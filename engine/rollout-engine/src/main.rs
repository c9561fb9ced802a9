use std::sync::Arc;

use envconfig::Envconfig;
use rollout_engine::config::EngineConfig;
use rollout_engine::gateway::{ClusterGateway, KubeGateway};
use rollout_engine::orchestrator::RolloutOrchestrator;
use rollout_engine::snapshot::SecretSnapshotStore;
use rollout_models::DeploymentRequest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rollout_engine::init_tracing("rollout_engine=info");
    let cfg = EngineConfig::init_from_env()?;

    let raw = tokio::fs::read_to_string(&cfg.request_file).await?;
    let request: DeploymentRequest = serde_yaml::from_str(&raw)?;

    let client = kube::Client::try_default().await?;
    let gateway: Arc<dyn ClusterGateway> =
        Arc::new(KubeGateway::new(client, cfg.field_manager.clone()));
    let store = Arc::new(SecretSnapshotStore::new(gateway.clone()));
    let orchestrator = RolloutOrchestrator::new(gateway, store, cfg);

    let result = orchestrator.run(&request).await;
    print!("{}", serde_yaml::to_string(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
