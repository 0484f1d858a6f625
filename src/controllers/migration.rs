use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::EncryptionControllerConfig;
use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::record::{key_record_name, mark_migrated};
use crate::keys::{retry_on_conflict, EncryptionEventReason, EventRecorder, GroupResource, KeyState};
use crate::migration::{MigrationRecord, Migrator};
use crate::state::{Assembly, StateSource};
use crate::status::{
    Condition, ConditionStatus, StatusSink, MIGRATION_CONTROLLER_DEGRADED,
    MIGRATION_CONTROLLER_PROGRESSING,
};

use super::{Controller, SyncOutcome};

/// key: encryption-migration-controller
/// Re-encrypts stored data once every replica writes with a new key, then
/// records on the key that its kinds are migrated.
pub struct MigrationController {
    source: StateSource,
    migrator: Arc<dyn Migrator>,
    status: Arc<dyn StatusSink>,
    events: Arc<dyn EventRecorder>,
    config: EncryptionControllerConfig,
}

impl MigrationController {
    pub fn new(
        source: StateSource,
        migrator: Arc<dyn Migrator>,
        status: Arc<dyn StatusSink>,
        events: Arc<dyn EventRecorder>,
        config: EncryptionControllerConfig,
    ) -> Self {
        Self {
            source,
            migrator,
            status,
            events,
            config,
        }
    }

    pub async fn sync_at(&self, now: DateTime<Utc>) -> EncryptionResult<SyncOutcome> {
        let assembly = self.source.assemble().await?;
        if let Some(reason) = &assembly.not_ready_reason {
            debug!(%reason, "migration controller waiting for deployer");
            self.report_progress(&[]).await;
            return Ok(SyncOutcome::Requeue(self.config.not_ready_requeue));
        }
        if !assembly.found_any_keys {
            self.report_progress(&[]).await;
            return Ok(SyncOutcome::Done);
        }

        if assembly.current_config.as_ref() != Some(&assembly.desired_config()) {
            debug!("deployed encryption config is behind the desired one, deferring migration");
            let pruned = self.prune_superseded(&assembly).await;
            self.report_progress(&[]).await;
            EncryptionError::aggregate(pruned)?;
            return Ok(SyncOutcome::Requeue(self.config.not_ready_requeue));
        }

        let mut errors = Vec::new();
        let mut progressing = Vec::new();
        for (resource, deployed) in &assembly.current_state {
            let Some(write_key) = &deployed.write_key else {
                continue;
            };
            if write_key.migrated_for(resource) {
                continue;
            }
            match self.migrate(resource, write_key, now).await {
                Ok(true) => {}
                Ok(false) => progressing.push(resource.qualified()),
                Err(err) => {
                    warn!(%resource, key_id = %write_key.key_id, %err, "migration step failed");
                    errors.push(err);
                }
            }
        }

        self.report_progress(&progressing).await;
        EncryptionError::aggregate(errors)?;
        Ok(SyncOutcome::Done)
    }

    /// Drops jobs of kinds whose deployed write key is about to change.
    async fn prune_superseded(&self, assembly: &Assembly) -> Vec<EncryptionError> {
        let mut errors = Vec::new();
        for (resource, desired) in &assembly.desired_state {
            let deployed = assembly
                .current_state
                .get(resource)
                .and_then(|state| state.write_key.as_ref());
            let unchanged = match (deployed, desired.write_key.as_ref()) {
                (Some(deployed), Some(desired)) => deployed.same_key(desired),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }
            if let Err(err) = self.migrator.prune_migration(resource).await {
                errors.push(err);
            }
        }
        errors
    }

    /// Returns true once `resource` is recorded as migrated to `write_key`,
    /// false while the job is still running.
    async fn migrate(
        &self,
        resource: &GroupResource,
        write_key: &KeyState,
        now: DateTime<Utc>,
    ) -> EncryptionResult<bool> {
        if !write_key.backed {
            return Err(EncryptionError::DataIntegrity(format!(
                "write key {} for {} is not backed by a key record",
                write_key.key_id,
                resource.qualified()
            )));
        }

        let mut job = self.migrator.ensure_migration(resource, &write_key.key_id).await?;
        if self.retry_due(&job, now) {
            info!(%resource, key_id = %write_key.key_id, "retrying failed migration");
            self.migrator.prune_migration(resource).await?;
            job = self.migrator.ensure_migration(resource, &write_key.key_id).await?;
        }

        if !job.finished {
            return Ok(false);
        }
        if let Some(err) = job.result {
            return Err(EncryptionError::Migration(err));
        }

        if self.mark_record_migrated(resource, write_key, now).await? {
            info!(%resource, key_id = %write_key.key_id, "resource migrated to write key");
            self.events
                .record(
                    EncryptionEventReason::EncryptionKeyMigrated,
                    format!(
                        "Migrated {} to key {}",
                        resource.qualified(),
                        write_key.key_id
                    ),
                )
                .await;
        }
        Ok(true)
    }

    fn retry_due(&self, job: &MigrationRecord, now: DateTime<Utc>) -> bool {
        match job.finished_at {
            Some(finished_at) if job.failed() => now - finished_at > self.config.migration_retry_window,
            _ => false,
        }
    }

    async fn mark_record_migrated(
        &self,
        resource: &GroupResource,
        write_key: &KeyState,
        now: DateTime<Utc>,
    ) -> EncryptionResult<bool> {
        let id = write_key.id().ok_or_else(|| EncryptionError::InvalidKey {
            name: write_key.key_id.clone(),
            reason: "key id is not numeric".to_string(),
        })?;
        let name = key_record_name(self.source.component(), id);
        let store = self.source.store().clone();
        retry_on_conflict(|| {
            let store = store.clone();
            let name = name.clone();
            async move {
                let mut stored = store
                    .get_key(&name)
                    .await?
                    .ok_or_else(|| EncryptionError::NotFound(name.clone()))?;
                if !mark_migrated(&mut stored, resource, now)? {
                    return Ok(false);
                }
                store.update_key(stored).await?;
                Ok::<_, EncryptionError>(true)
            }
        })
        .await
    }

    async fn report_progress(&self, progressing: &[String]) {
        let condition = if progressing.is_empty() {
            Condition::new(
                MIGRATION_CONTROLLER_PROGRESSING,
                ConditionStatus::False,
                "AsExpected",
                "",
            )
        } else {
            Condition::new(
                MIGRATION_CONTROLLER_PROGRESSING,
                ConditionStatus::True,
                "Migrating",
                format!(
                    "migrating resources to a new write key: [{}]",
                    progressing.join(" ")
                ),
            )
        };
        if let Err(err) = self.status.apply(condition).await {
            warn!(%err, "failed to report migration progress");
        }
    }
}

#[async_trait]
impl Controller for MigrationController {
    fn name(&self) -> &'static str {
        "EncryptionMigrationController"
    }

    fn degraded_condition(&self) -> &'static str {
        MIGRATION_CONTROLLER_DEGRADED
    }

    async fn sync(&self) -> EncryptionResult<SyncOutcome> {
        self.sync_at(Utc::now()).await
    }
}
