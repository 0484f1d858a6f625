use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EncryptionControllerConfig;
use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::record::{from_stored_key, key_record_name, to_stored_key};
use crate::keys::{
    EncryptionEventReason, EncryptionSettings, EventRecorder, GroupResource, KeyMode, KeyState,
};
use crate::state::StateSource;
use crate::status::KEY_CONTROLLER_DEGRADED;

use super::{Controller, SyncOutcome};

pub const REASON_KEY_DOES_NOT_EXIST: &str = "key-does-not-exist";
pub const REASON_MODE_CHANGED: &str = "encryption-mode-changed";
pub const REASON_EXTERNAL_REASON_CHANGED: &str = "external-reason-changed";
pub const REASON_ROTATION_INTERVAL: &str = "rotation-interval-has-passed";

/// Decides whether `resource` needs a fresh key. Returns the id of its latest
/// key (0 when there is none or it is invalid) and the reason.
pub fn needs_new_key(
    read_keys: &[KeyState],
    resource: &GroupResource,
    current_mode: KeyMode,
    external_reason: Option<&str>,
    resources: &[GroupResource],
    now: DateTime<Utc>,
    rotation_interval: chrono::Duration,
) -> Option<(u64, String)> {
    let Some(latest) = read_keys.first() else {
        if current_mode == KeyMode::Identity {
            return None;
        }
        return Some((0, REASON_KEY_DOES_NOT_EXIST.to_string()));
    };

    let Some(latest_id) = latest.id() else {
        warn!(key_id = %latest.key_id, "latest read key has no numeric id");
        return Some((0, "key-secret-0-is-invalid".to_string()));
    };

    if !latest.backed {
        return Some((latest_id, format!("{resource}-not-backed-by-secret")));
    }

    // too many keys in flight; wait for migration and pruning to catch up
    if read_keys.iter().filter(|key| key.backed).count() > 2 {
        return None;
    }

    if !latest.migrated_for_all(resources) {
        return None;
    }

    if latest.mode != current_mode {
        return Some((latest_id, REASON_MODE_CHANGED.to_string()));
    }

    if latest.mode == KeyMode::Identity {
        return None;
    }

    if let Some(reason) = external_reason.filter(|reason| !reason.is_empty()) {
        if reason != latest.external_reason {
            return Some((latest_id, REASON_EXTERNAL_REASON_CHANGED.to_string()));
        }
    }

    match latest.migrated.timestamp {
        Some(migrated_at) if now - migrated_at > rotation_interval => {
            Some((latest_id, REASON_ROTATION_INTERVAL.to_string()))
        }
        _ => None,
    }
}

/// key: encryption-key-controller
/// Mints a new key record whenever any protected kind needs one.
pub struct KeyController {
    source: StateSource,
    settings: watch::Receiver<EncryptionSettings>,
    events: Arc<dyn EventRecorder>,
    config: EncryptionControllerConfig,
}

impl KeyController {
    pub fn new(
        source: StateSource,
        settings: watch::Receiver<EncryptionSettings>,
        events: Arc<dyn EventRecorder>,
        config: EncryptionControllerConfig,
    ) -> Self {
        Self {
            source,
            settings,
            events,
            config,
        }
    }

    pub async fn sync_at(&self, now: DateTime<Utc>) -> EncryptionResult<SyncOutcome> {
        let assembly = self.source.assemble().await?;
        if let Some(reason) = &assembly.not_ready_reason {
            debug!(%reason, "key controller waiting for deployer");
            return Ok(SyncOutcome::Requeue(self.config.not_ready_requeue));
        }

        let settings = self.settings.borrow().clone();
        let resources = self.source.resources();
        let mut latest_ids = Vec::new();
        let mut reasons = Vec::new();
        for resource in resources {
            let read_keys = assembly
                .desired_state
                .get(resource)
                .map(|state| state.read_keys.as_slice())
                .unwrap_or_default();
            if let Some((latest_id, reason)) = needs_new_key(
                read_keys,
                resource,
                settings.mode,
                settings.external_reason.as_deref(),
                resources,
                now,
                self.config.rotation_interval,
            ) {
                latest_ids.push(latest_id);
                reasons.push(reason);
            }
        }

        if reasons.is_empty() {
            return Ok(SyncOutcome::Done);
        }

        let next_id = latest_ids
            .into_iter()
            .max()
            .unwrap_or(0)
            .max(assembly.highest_record_id)
            + 1;
        reasons.sort();
        reasons.dedup();
        self.create_key(next_id, &settings, reasons.join(", ")).await?;
        Ok(SyncOutcome::Done)
    }

    async fn create_key(
        &self,
        id: u64,
        settings: &EncryptionSettings,
        reason: String,
    ) -> EncryptionResult<()> {
        let component = self.source.component();
        let mut secret = vec![0u8; settings.mode.key_len()];
        OsRng.fill_bytes(&mut secret);

        let mut key = KeyState::new(id, settings.mode, secret);
        key.internal_reason = reason.clone();
        key.external_reason = settings.external_reason.clone().unwrap_or_default();
        let record = to_stored_key(component, &key)?;
        let name = record.name.clone();

        match self.source.store().create_key(record).await {
            Ok(_) => {
                info!(%name, key_id = id, mode = %key.mode, fingerprint = %key.fingerprint(), %reason, "created encryption key");
                self.events
                    .record(
                        EncryptionEventReason::EncryptionKeyCreated,
                        format!("Secret {name} successfully created: [\"{reason}\"]"),
                    )
                    .await;
                Ok(())
            }
            Err(err) if err.is_already_exists() => self.verify_existing(&key).await,
            Err(err) => Err(err),
        }
    }

    /// A record with our id already exists; it is fine only if it is a valid
    /// key of the same mode. It is never overwritten.
    async fn verify_existing(&self, wanted: &KeyState) -> EncryptionResult<()> {
        let component = self.source.component();
        let id = wanted.id().unwrap_or_default();
        let name = key_record_name(component, id);
        let existing = self
            .source
            .store()
            .get_key(&name)
            .await?
            .ok_or_else(|| EncryptionError::NotFound(name.clone()))?;

        match from_stored_key(component, &existing) {
            Ok(found) if found.mode == wanted.mode => {
                debug!(%name, "key record already exists");
                Ok(())
            }
            Ok(found) => Err(EncryptionError::DataIntegrity(format!(
                "secret {name} already exists with mode {} instead of {}",
                found.mode, wanted.mode
            ))),
            Err(err) => Err(EncryptionError::DataIntegrity(format!(
                "secret {name} already exists and is invalid: {err}"
            ))),
        }
    }
}

#[async_trait]
impl Controller for KeyController {
    fn name(&self) -> &'static str {
        "EncryptionKeyController"
    }

    fn degraded_condition(&self) -> &'static str {
        KEY_CONTROLLER_DEGRADED
    }

    async fn sync(&self) -> EncryptionResult<SyncOutcome> {
        self.sync_at(Utc::now()).await
    }
}
