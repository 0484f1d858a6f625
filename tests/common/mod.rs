#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use encryption_controller::config::EncryptionControllerConfig;
use encryption_controller::controllers::{
    ConditionController, Controller, KeyController, MigrationController, PruneController,
    StateController,
};
use encryption_controller::deployer::MemoryDeployer;
use encryption_controller::error::EncryptionResult;
use encryption_controller::keys::record::{key_id_from_name, to_stored_key};
use encryption_controller::keys::{
    EncryptionSettings, EncryptionState, GroupResource, GroupResourceState, KeyMode, KeyState,
    KeyStore, MemoryEventRecorder, MemoryKeyStore,
};
use encryption_controller::migration::{MigrationEvent, MigrationRecord, Migrator};
use encryption_controller::state::{from_encryption_state, EncryptionConfig, StateSource};
use encryption_controller::status::OperatorStatus;
use tokio::sync::{broadcast, watch};

pub const COMPONENT: &str = "kube-apiserver";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
}

pub fn secrets() -> GroupResource {
    GroupResource::core("secrets")
}

pub fn configmaps() -> GroupResource {
    GroupResource::core("configmaps")
}

/// A backed key with deterministic material, migrated for `migrated` at
/// `migrated_at` when given.
pub fn key(
    id: u64,
    mode: KeyMode,
    migrated: &[GroupResource],
    migrated_at: Option<DateTime<Utc>>,
) -> KeyState {
    let mut key = KeyState::new(id, mode, vec![id as u8; mode.key_len()]);
    key.migrated.resources = migrated.iter().cloned().collect();
    key.migrated.timestamp = migrated_at;
    key.backed = true;
    key
}

type JobKey = (GroupResource, String);

/// Migrator whose jobs only finish when a test says so.
pub struct ScriptedMigrator {
    jobs: Mutex<BTreeMap<JobKey, MigrationRecord>>,
    ensured: Mutex<Vec<JobKey>>,
    pruned: Mutex<Vec<GroupResource>>,
    events: broadcast::Sender<MigrationEvent>,
}

impl Default for ScriptedMigrator {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            ensured: Mutex::new(Vec::new()),
            pruned: Mutex::new(Vec::new()),
            events,
        }
    }
}

impl ScriptedMigrator {
    /// Finishes a known job; `error` makes it a failure.
    pub fn finish(
        &self,
        resource: &GroupResource,
        key_id: &str,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&(resource.clone(), key_id.to_string()))
            .expect("job must be started before it can finish");
        job.finished = true;
        job.result = error.map(str::to_string);
        job.finished_at = Some(finished_at);
        let _ = self.events.send(MigrationEvent::Finished {
            resource: resource.clone(),
            key_id: key_id.to_string(),
        });
    }

    pub fn job(&self, resource: &GroupResource, key_id: &str) -> Option<MigrationRecord> {
        self.jobs
            .lock()
            .unwrap()
            .get(&(resource.clone(), key_id.to_string()))
            .cloned()
    }

    pub fn ensured(&self) -> Vec<JobKey> {
        self.ensured.lock().unwrap().clone()
    }

    pub fn pruned(&self) -> Vec<GroupResource> {
        self.pruned.lock().unwrap().clone()
    }
}

#[async_trait]
impl Migrator for ScriptedMigrator {
    async fn ensure_migration(
        &self,
        resource: &GroupResource,
        key_id: &str,
    ) -> EncryptionResult<MigrationRecord> {
        let key = (resource.clone(), key_id.to_string());
        self.ensured.lock().unwrap().push(key.clone());
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .entry(key)
            .or_insert_with(|| MigrationRecord::started(resource.clone(), key_id, now()));
        Ok(job.clone())
    }

    async fn prune_migration(&self, resource: &GroupResource) -> EncryptionResult<()> {
        self.pruned.lock().unwrap().push(resource.clone());
        self.jobs
            .lock()
            .unwrap()
            .retain(|(other, _), _| other != resource);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }
}

/// Every controller wired to in-memory collaborators.
pub struct Harness {
    pub store: MemoryKeyStore,
    pub deployer: MemoryDeployer,
    pub migrator: Arc<ScriptedMigrator>,
    pub status: OperatorStatus,
    pub events: MemoryEventRecorder,
    pub settings: watch::Sender<EncryptionSettings>,
    pub config: EncryptionControllerConfig,
    pub key: KeyController,
    pub state: StateController,
    pub migration: MigrationController,
    pub prune: PruneController,
    pub condition: ConditionController,
}

impl Harness {
    /// Replicas start converged on a revision without any encryption config.
    pub fn new(resources: Vec<GroupResource>) -> Self {
        Self::with_settings(resources, EncryptionSettings::default())
    }

    pub fn with_settings(resources: Vec<GroupResource>, settings: EncryptionSettings) -> Self {
        let store = MemoryKeyStore::new(COMPONENT);
        let deployer = MemoryDeployer::new();
        deployer.deploy(None);
        let migrator = Arc::new(ScriptedMigrator::default());
        let status = OperatorStatus::new();
        let events = MemoryEventRecorder::new();
        let (settings_tx, settings_rx) = watch::channel(settings);
        let config = EncryptionControllerConfig::for_component(COMPONENT, resources.clone());

        let source = StateSource::new(
            Arc::new(store.clone()),
            Arc::new(deployer.clone()),
            resources,
        );
        let key = KeyController::new(
            source.clone(),
            settings_rx,
            Arc::new(events.clone()),
            config.clone(),
        );
        let state = StateController::new(source.clone(), Arc::new(events.clone()), config.clone());
        let migration = MigrationController::new(
            source.clone(),
            migrator.clone(),
            Arc::new(status.clone()),
            Arc::new(events.clone()),
            config.clone(),
        );
        let prune = PruneController::new(source.clone(), Arc::new(events.clone()), config.clone());
        let condition = ConditionController::new(source, Arc::new(status.clone()));

        Self {
            store,
            deployer,
            migrator,
            status,
            events,
            settings: settings_tx,
            config,
            key,
            state,
            migration,
            prune,
            condition,
        }
    }

    pub fn seed(&self, key: &KeyState) -> anyhow::Result<()> {
        self.store.seed_key(to_stored_key(COMPONENT, key)?);
        Ok(())
    }

    /// Replicas converge on a config whose only key is `write_key`.
    pub fn deploy_write_key(&self, write_key: &KeyState) {
        let state: EncryptionState = self
            .config
            .resources
            .iter()
            .map(|resource| {
                let grs = GroupResourceState {
                    write_key: Some(write_key.clone()),
                    read_keys: vec![write_key.clone()],
                };
                (resource.clone(), grs)
            })
            .collect();
        self.deployer.deploy(Some(from_encryption_state(&state)));
    }

    /// Publishes the desired config and rolls it out until the deployed
    /// config stops changing.
    pub async fn settle(&self) -> anyhow::Result<()> {
        for _ in 0..5 {
            self.state.sync().await?;
            if self.deployer.rollout_from_store(&self.store).await?.is_none() {
                return Ok(());
            }
        }
        anyhow::bail!("deployed config did not settle")
    }

    pub async fn key_ids(&self) -> anyhow::Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .store
            .list_keys()
            .await?
            .iter()
            .filter_map(|record| key_id_from_name(COMPONENT, &record.name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn published(&self) -> anyhow::Result<Option<EncryptionConfig>> {
        Ok(match self.store.get_config().await? {
            Some(stored) => Some(EncryptionConfig::from_json(&stored.payload)?),
            None => None,
        })
    }

    /// `(mode, key id)` of every provider for `resource` in the published config.
    pub async fn published_providers(
        &self,
        resource: &GroupResource,
    ) -> anyhow::Result<Vec<(KeyMode, String)>> {
        let config = self
            .published()
            .await?
            .ok_or_else(|| anyhow::anyhow!("no published config"))?;
        let entry = config
            .resource(resource)
            .ok_or_else(|| anyhow::anyhow!("{resource} missing from published config"))?;
        Ok(entry
            .providers
            .iter()
            .map(|provider| (provider.mode, provider.key_id.clone()))
            .collect())
    }
}
