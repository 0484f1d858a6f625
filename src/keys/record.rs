//! Naming, labelling and (de)serialization of key records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{EncryptionError, EncryptionResult};

use super::models::{
    GroupResource, KeyMode, KeyState, MigratedGroupResources, MigrationState, StoredKey,
};

pub const ANNOTATION_PREFIX: &str = "encryption.operator.dev";
pub const COMPONENT_LABEL: &str = "encryption.operator.dev/component";
pub const MODE_ANNOTATION: &str = "encryption.operator.dev/mode";
pub const INTERNAL_REASON_ANNOTATION: &str = "encryption.operator.dev/internal-reason";
pub const EXTERNAL_REASON_ANNOTATION: &str = "encryption.operator.dev/external-reason";
pub const MIGRATED_TIMESTAMP_ANNOTATION: &str = "encryption.operator.dev/migrated-timestamp";
pub const MIGRATED_RESOURCES_ANNOTATION: &str = "encryption.operator.dev/migrated-resources";
pub const KEY_DATA: &str = "encryption.operator.dev-key";
pub const DELETION_FINALIZER: &str = "encryption.operator.dev/deletion-protection";
pub const CONFIG_DATA: &str = "encryption-config";

/// key: encryption-key-naming
pub fn key_record_name(component: &str, id: u64) -> String {
    format!("encryption-key-{component}-{id}")
}

/// Inverse of [`key_record_name`]. Leading zeros and signs are rejected so the
/// mapping stays one-to-one.
pub fn key_id_from_name(component: &str, name: &str) -> Option<u64> {
    let prefix = format!("encryption-key-{component}-");
    let raw = name.strip_prefix(&prefix)?;
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if raw.len() > 1 && raw.starts_with('0') {
        return None;
    }
    raw.parse::<u64>().ok()
}

pub fn config_record_name(component: &str) -> String {
    format!("encryption-config-{component}")
}

pub fn component_selector(component: &str) -> String {
    format!("{COMPONENT_LABEL}={component}")
}

/// Builds the record persisted for a freshly minted key.
pub fn to_stored_key(component: &str, key: &KeyState) -> EncryptionResult<StoredKey> {
    let id = key.id().ok_or_else(|| EncryptionError::InvalidKey {
        name: key.key_id.clone(),
        reason: "key id is not numeric".to_string(),
    })?;

    let mut labels = BTreeMap::new();
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(MODE_ANNOTATION.to_string(), key.mode.as_str().to_string());
    if !key.internal_reason.is_empty() {
        annotations.insert(
            INTERNAL_REASON_ANNOTATION.to_string(),
            key.internal_reason.clone(),
        );
    }
    if !key.external_reason.is_empty() {
        annotations.insert(
            EXTERNAL_REASON_ANNOTATION.to_string(),
            key.external_reason.clone(),
        );
    }

    let mut stored = StoredKey {
        name: key_record_name(component, id),
        labels,
        annotations,
        data: BTreeMap::new(),
        finalizers: vec![DELETION_FINALIZER.to_string()],
        resource_version: None,
        deleting: false,
    };
    stored.data.insert(KEY_DATA.to_string(), key.secret.clone());
    write_migration_state(&mut stored, &key.migrated)?;
    Ok(stored)
}

/// Parses a stored record into a backed key. Records for another component,
/// with an unparsable name, unknown mode or missing material are rejected.
pub fn from_stored_key(component: &str, stored: &StoredKey) -> EncryptionResult<KeyState> {
    let invalid = |reason: &str| EncryptionError::InvalidKey {
        name: stored.name.clone(),
        reason: reason.to_string(),
    };

    if stored.labels.get(COMPONENT_LABEL).map(String::as_str) != Some(component) {
        return Err(invalid("missing component label"));
    }
    let id = key_id_from_name(component, &stored.name)
        .ok_or_else(|| invalid("name does not encode a key id"))?;

    let raw_mode = stored
        .annotations
        .get(MODE_ANNOTATION)
        .ok_or_else(|| invalid("missing mode annotation"))?;
    let mode = KeyMode::from_str(raw_mode).ok_or_else(|| invalid("unknown mode"))?;

    let secret = stored.data.get(KEY_DATA).cloned().unwrap_or_default();
    match mode {
        KeyMode::Identity if !secret.is_empty() => {
            return Err(invalid("identity key must not carry material"));
        }
        KeyMode::AesCbc | KeyMode::Secretbox if secret.len() != mode.key_len() => {
            return Err(invalid("key material has the wrong length"));
        }
        _ => {}
    }

    let migrated = read_migration_state(stored).map_err(|reason| invalid(&reason))?;

    Ok(KeyState {
        key_id: id.to_string(),
        secret,
        mode,
        migrated,
        internal_reason: stored
            .annotations
            .get(INTERNAL_REASON_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        external_reason: stored
            .annotations
            .get(EXTERNAL_REASON_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        backed: true,
    })
}

fn read_migration_state(stored: &StoredKey) -> Result<MigrationState, String> {
    let mut state = MigrationState::default();
    if let Some(raw) = stored.annotations.get(MIGRATED_TIMESTAMP_ANNOTATION) {
        let parsed = DateTime::parse_from_rfc3339(raw)
            .map_err(|err| format!("invalid migrated timestamp: {err}"))?;
        state.timestamp = Some(parsed.with_timezone(&Utc));
    }
    if let Some(raw) = stored.annotations.get(MIGRATED_RESOURCES_ANNOTATION) {
        if !raw.trim().is_empty() {
            let parsed: MigratedGroupResources = serde_json::from_str(raw)
                .map_err(|err| format!("invalid migrated resources: {err}"))?;
            state.resources = parsed.resources.into_iter().collect();
        }
    }
    Ok(state)
}

fn write_migration_state(stored: &mut StoredKey, state: &MigrationState) -> EncryptionResult<()> {
    match state.timestamp {
        Some(timestamp) => {
            stored.annotations.insert(
                MIGRATED_TIMESTAMP_ANNOTATION.to_string(),
                timestamp.to_rfc3339(),
            );
        }
        None => {
            stored.annotations.remove(MIGRATED_TIMESTAMP_ANNOTATION);
        }
    }
    if state.resources.is_empty() {
        stored.annotations.remove(MIGRATED_RESOURCES_ANNOTATION);
    } else {
        let payload = MigratedGroupResources {
            resources: state.resources.iter().cloned().collect(),
        };
        stored.annotations.insert(
            MIGRATED_RESOURCES_ANNOTATION.to_string(),
            serde_json::to_string(&payload)?,
        );
    }
    Ok(())
}

/// Marks `resource` as migrated on `stored`. Returns false when it already was.
pub fn mark_migrated(
    stored: &mut StoredKey,
    resource: &GroupResource,
    now: DateTime<Utc>,
) -> EncryptionResult<bool> {
    let mut state = read_migration_state(stored).map_err(|reason| EncryptionError::InvalidKey {
        name: stored.name.clone(),
        reason,
    })?;
    if state.resources.contains(resource) {
        return Ok(false);
    }
    state.resources.insert(resource.clone());
    state.timestamp = Some(now);
    write_migration_state(stored, &state)?;
    Ok(true)
}

/// Drops the deletion-protection finalizer. Returns false when it was absent.
pub fn remove_finalizer(stored: &mut StoredKey) -> bool {
    let before = stored.finalizers.len();
    stored.finalizers.retain(|finalizer| finalizer != DELETION_FINALIZER);
    before != stored.finalizers.len()
}
