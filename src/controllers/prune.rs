use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::EncryptionControllerConfig;
use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::record::{key_id_from_name, key_record_name, remove_finalizer};
use crate::keys::{retry_on_conflict, EncryptionEventReason, EventRecorder};
use crate::state::{Assembly, StateSource};
use crate::status::PRUNE_CONTROLLER_DEGRADED;

use super::{Controller, SyncOutcome};

/// key: encryption-prune-controller
/// Deletes key records no longer referenced by the desired config, keeping a
/// fixed number of the most recent unused ones.
pub struct PruneController {
    source: StateSource,
    events: Arc<dyn EventRecorder>,
    config: EncryptionControllerConfig,
}

impl PruneController {
    pub fn new(
        source: StateSource,
        events: Arc<dyn EventRecorder>,
        config: EncryptionControllerConfig,
    ) -> Self {
        Self {
            source,
            events,
            config,
        }
    }

    fn in_use(&self, assembly: &Assembly) -> BTreeSet<String> {
        assembly
            .desired_state
            .values()
            .flat_map(|state| state.read_keys.iter())
            .filter_map(|key| key.id())
            .map(|id| key_record_name(self.source.component(), id))
            .collect()
    }

    /// Removes the deletion finalizer, then deletes the record.
    async fn delete_record(&self, name: &str) -> EncryptionResult<()> {
        let store = self.source.store().clone();
        retry_on_conflict(|| {
            let store = store.clone();
            async move {
                let Some(mut stored) = store.get_key(name).await? else {
                    return Ok(());
                };
                if remove_finalizer(&mut stored) {
                    store.update_key(stored).await?;
                }
                Ok::<_, EncryptionError>(())
            }
        })
        .await?;
        self.source.store().delete_key(name).await
    }
}

#[async_trait]
impl Controller for PruneController {
    fn name(&self) -> &'static str {
        "EncryptionPruneController"
    }

    fn degraded_condition(&self) -> &'static str {
        PRUNE_CONTROLLER_DEGRADED
    }

    async fn sync(&self) -> EncryptionResult<SyncOutcome> {
        let assembly = self.source.assemble().await?;
        if let Some(reason) = &assembly.not_ready_reason {
            debug!(%reason, "prune controller waiting for deployer");
            return Ok(SyncOutcome::Requeue(self.config.not_ready_requeue));
        }

        let in_use = self.in_use(&assembly);
        let component = self.source.component();
        let mut records: Vec<(u64, String)> = self
            .source
            .store()
            .list_keys()
            .await?
            .into_iter()
            .filter_map(|record| key_id_from_name(component, &record.name).map(|id| (id, record.name)))
            // records minted after the assembly was taken are not judged yet
            .filter(|(id, _)| *id <= assembly.highest_record_id)
            .collect();
        records.sort_by(|a, b| b.0.cmp(&a.0));

        let mut kept_unused = 0;
        let mut errors = Vec::new();
        for (id, name) in records {
            if in_use.contains(&name) {
                continue;
            }
            if kept_unused < self.config.keep_number_of_keys {
                kept_unused += 1;
                continue;
            }
            match self.delete_record(&name).await {
                Ok(()) => {
                    info!(%name, key_id = id, "pruned encryption key");
                    self.events
                        .record(
                            EncryptionEventReason::EncryptionKeyPruned,
                            format!("Deleted unused key {name}"),
                        )
                        .await;
                }
                Err(err) => {
                    warn!(%name, %err, "failed to prune encryption key");
                    errors.push(err);
                }
            }
        }

        EncryptionError::aggregate(errors)?;
        Ok(SyncOutcome::Done)
    }
}
