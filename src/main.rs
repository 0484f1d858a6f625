use std::sync::Arc;

use encryption_controller::config::{
    EncryptionControllerConfig, ENCRYPTION_NAMESPACE, ENCRYPTION_POD_SELECTOR,
    ENCRYPTION_TARGET_NAMESPACE,
};
use encryption_controller::controllers::{
    ConditionController, ControlLoop, Controller, KeyController, MigrationController,
    PruneController, StateController,
};
use encryption_controller::deployer::{Deployer, RevisionLabelPodDeployer};
use encryption_controller::keys::{EventRecorder, KeyStore, KubeKeyStore, TracingEventRecorder};
use encryption_controller::migration::{InProcessMigrator, KubeObjectRewriter, Migrator};
use encryption_controller::{settings, settings_from_env};
use encryption_controller::state::StateSource;
use encryption_controller::status::{KubeOperatorStatus, StatusSink};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = EncryptionControllerConfig::from_env()?;
    // Fail fast on an unknown ENCRYPTION_MODE
    let defaults = settings_from_env()?;
    let (settings_tx, settings_rx) = watch::channel(defaults.clone());

    let client = kube::Client::try_default().await?;
    settings::spawn(
        client.clone(),
        ENCRYPTION_NAMESPACE.as_str(),
        &config.component,
        defaults,
        settings_tx,
    );

    let key_store = KubeKeyStore::new(client.clone(), ENCRYPTION_NAMESPACE.as_str(), config.component.clone());
    key_store.start_watching();
    let deployer = RevisionLabelPodDeployer::new(
        client.clone(),
        ENCRYPTION_TARGET_NAMESPACE.as_str(),
        ENCRYPTION_POD_SELECTOR.as_str(),
    );
    deployer.start_watching();

    let store: Arc<dyn KeyStore> = Arc::new(key_store);
    let deployer: Arc<dyn Deployer> = Arc::new(deployer);
    let migrator: Arc<dyn Migrator> = Arc::new(InProcessMigrator::new(KubeObjectRewriter::new(client.clone())));
    let operator_status = KubeOperatorStatus::new(client.clone(), ENCRYPTION_NAMESPACE.as_str(), config.component.clone());
    if let Err(error) = operator_status.load().await {
        tracing::warn!(%error, "could not read previous operator status");
    }
    let status: Arc<dyn StatusSink> = Arc::new(operator_status);
    let events: Arc<dyn EventRecorder> = Arc::new(TracingEventRecorder);
    let source = StateSource::new(store.clone(), deployer.clone(), config.resources.clone());

    let controllers: Vec<Arc<dyn Controller>> = vec![
        Arc::new(KeyController::new(
            source.clone(),
            settings_rx.clone(),
            events.clone(),
            config.clone(),
        )),
        Arc::new(StateController::new(source.clone(), events.clone(), config.clone())),
        Arc::new(MigrationController::new(
            source.clone(),
            migrator.clone(),
            status.clone(),
            events.clone(),
            config.clone(),
        )),
        Arc::new(PruneController::new(source.clone(), events.clone(), config.clone())),
        Arc::new(ConditionController::new(source, status.clone())),
    ];

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(controllers.len());
    for controller in controllers {
        let handle = ControlLoop::new(controller, status.clone(), config.resync_interval)
            .watch_broadcast(store.subscribe())
            .watch_broadcast(deployer.subscribe())
            .watch_broadcast(migrator.subscribe())
            .watch_value(settings_rx.clone())
            .spawn(shutdown_rx.clone());
        handles.push(handle);
    }
    tracing::info!(
        component = %config.component,
        resources = config.resources.len(),
        "encryption controllers running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down encryption controllers");
    shutdown_tx.send(true)?;
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::warn!(?error, "control loop task panicked");
        }
    }

    Ok(())
}
