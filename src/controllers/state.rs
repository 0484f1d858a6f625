use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::EncryptionControllerConfig;
use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::{
    retry_on_conflict, EncryptionEventReason, EncryptionState, EventRecorder, KeyState, StoredConfig,
};
use crate::state::StateSource;
use crate::status::STATE_CONTROLLER_DEGRADED;

use super::{Controller, SyncOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigWrite {
    Created,
    Updated,
}

/// key: encryption-state-controller
/// Publishes the desired encryption config to the canonical config record.
pub struct StateController {
    source: StateSource,
    events: Arc<dyn EventRecorder>,
    config: EncryptionControllerConfig,
}

impl StateController {
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

    async fn publish(&self, payload: Vec<u8>) -> EncryptionResult<Option<ConfigWrite>> {
        let store = self.source.store().clone();
        retry_on_conflict(|| {
            let store = store.clone();
            let payload = payload.clone();
            async move {
                let write = match store.get_config().await? {
                    Some(current) if current.payload == payload => return Ok(None),
                    Some(current) => {
                        store
                            .apply_config(StoredConfig {
                                payload,
                                ..current
                            })
                            .await?;
                        ConfigWrite::Updated
                    }
                    None => {
                        store
                            .apply_config(StoredConfig {
                                payload,
                                ..StoredConfig::default()
                            })
                            .await?;
                        ConfigWrite::Created
                    }
                };
                Ok::<_, EncryptionError>(Some(write))
            }
        })
        .await
    }
}

fn key_ids(keys: &[KeyState]) -> Vec<&str> {
    keys.iter().map(|key| key.key_id.as_str()).collect()
}

/// Human-readable changes between two states, one per affected kind.
pub fn describe_changes(
    before: &EncryptionState,
    after: &EncryptionState,
) -> Vec<(EncryptionEventReason, String)> {
    let mut changes = Vec::new();

    for (resource, previous) in before {
        if !after.contains_key(resource) {
            changes.push((
                EncryptionEventReason::EncryptionResourceRemoved,
                format!("Resource {} was removed from encryption config", resource.qualified()),
            ));
            continue;
        }
        let next = &after[resource];
        let before_write = previous.write_key.as_ref().map(|key| key.key_id.as_str());
        let after_write = next.write_key.as_ref().map(|key| key.key_id.as_str());
        match (before_write, after_write) {
            (None, Some(id)) => changes.push((
                EncryptionEventReason::EncryptionWriteKeyPromoted,
                format!("Promoted key {id} to write key for {}", resource.qualified()),
            )),
            (Some(id), None) => changes.push((
                EncryptionEventReason::EncryptionWriteKeyRemoved,
                format!("Removed write key {id} for {}", resource.qualified()),
            )),
            (Some(old), Some(new)) if old != new => changes.push((
                EncryptionEventReason::EncryptionWriteKeyRotated,
                format!("Write key for {} rotated from {old} to {new}", resource.qualified()),
            )),
            _ => {}
        }
        if key_ids(&previous.read_keys) != key_ids(&next.read_keys) {
            changes.push((
                EncryptionEventReason::EncryptionReadKeysChanged,
                format!(
                    "Read keys for {} changed from {:?} to {:?}",
                    resource.qualified(),
                    key_ids(&previous.read_keys),
                    key_ids(&next.read_keys)
                ),
            ));
        }
    }

    for resource in after.keys().filter(|resource| !before.contains_key(*resource)) {
        changes.push((
            EncryptionEventReason::EncryptionResourceAdded,
            format!("Resource {} was added to encryption config", resource.qualified()),
        ));
    }

    changes
}

#[async_trait]
impl Controller for StateController {
    fn name(&self) -> &'static str {
        "EncryptionStateController"
    }

    fn degraded_condition(&self) -> &'static str {
        STATE_CONTROLLER_DEGRADED
    }

    async fn sync(&self) -> EncryptionResult<SyncOutcome> {
        let assembly = self.source.assemble().await?;
        if let Some(reason) = &assembly.not_ready_reason {
            debug!(%reason, "state controller waiting for deployer");
            return Ok(SyncOutcome::Requeue(self.config.not_ready_requeue));
        }

        if !assembly.found_any_keys && self.source.store().get_config().await?.is_none() {
            debug!("no encryption keys and no published config, nothing to do");
            return Ok(SyncOutcome::Done);
        }

        let desired = assembly.desired_config();
        let Some(write) = self.publish(desired.to_json()?).await? else {
            return Ok(SyncOutcome::Done);
        };

        let (reason, verb) = match write {
            ConfigWrite::Created => (EncryptionEventReason::EncryptionConfigCreated, "created"),
            ConfigWrite::Updated => (EncryptionEventReason::EncryptionConfigUpdated, "updated"),
        };
        info!(component = self.source.component(), resources = desired.resources.len(), "encryption config {verb}");
        self.events
            .record(reason, format!("Encryption config for {} {verb}", self.source.component()))
            .await;
        // diffed against what the replicas run
        for (reason, message) in describe_changes(&assembly.current_state, &assembly.desired_state) {
            self.events.record(reason, message).await;
        }

        Ok(SyncOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{GroupResource, GroupResourceState, KeyMode};

    fn state(write: Option<u64>, read: &[u64]) -> GroupResourceState {
        let key = |id: u64| KeyState::new(id, KeyMode::AesCbc, vec![id as u8; 32]);
        GroupResourceState {
            write_key: write.map(key),
            read_keys: read.iter().copied().map(key).collect(),
        }
    }

    #[test]
    fn describes_promotion_rotation_and_membership() {
        let secrets = GroupResource::core("secrets");
        let configmaps = GroupResource::core("configmaps");
        let routes = GroupResource::new("route.openshift.io", "routes");

        let mut before = EncryptionState::new();
        before.insert(secrets.clone(), state(None, &[1]));
        before.insert(configmaps.clone(), state(Some(1), &[1]));
        before.insert(routes.clone(), state(Some(1), &[1]));

        let mut after = EncryptionState::new();
        after.insert(secrets.clone(), state(Some(1), &[1]));
        after.insert(configmaps.clone(), state(Some(2), &[2, 1]));
        after.insert(GroupResource::core("events"), state(None, &[]));

        let reasons: Vec<EncryptionEventReason> = describe_changes(&before, &after)
            .into_iter()
            .map(|(reason, _)| reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                EncryptionEventReason::EncryptionWriteKeyRotated,
                EncryptionEventReason::EncryptionReadKeysChanged,
                EncryptionEventReason::EncryptionWriteKeyPromoted,
                EncryptionEventReason::EncryptionResourceRemoved,
                EncryptionEventReason::EncryptionResourceAdded,
            ]
        );
    }

    #[test]
    fn unchanged_state_describes_nothing() {
        let mut same = EncryptionState::new();
        same.insert(GroupResource::core("secrets"), state(Some(3), &[3, 2]));
        assert!(describe_changes(&same, &same).is_empty());
    }
}
