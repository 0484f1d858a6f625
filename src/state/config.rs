//! The canonical encryption config and its mapping to and from key state.

use std::cmp::Ordering;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::{EncryptionState, GroupResource, GroupResourceState, KeyMode, KeyState};

/// key: encryption-config
/// Per resource kind, the ordered providers the consuming service uses: write
/// provider first, read-only providers after it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub resources: Vec<ResourceConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
    pub resource: GroupResource,
    pub providers: Vec<ProviderConfig>,
}

/// A provider entry. The keyless `identity` entry is the plaintext fallback.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub mode: KeyMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
}

impl ProviderConfig {
    pub fn identity() -> Self {
        Self {
            mode: KeyMode::Identity,
            key_id: String::new(),
            secret: String::new(),
        }
    }

    fn from_key(key: &KeyState) -> Self {
        Self {
            mode: key.mode,
            key_id: key.key_id.clone(),
            secret: if key.secret.is_empty() {
                String::new()
            } else {
                STANDARD.encode(&key.secret)
            },
        }
    }

    fn is_fallback(&self) -> bool {
        self.mode == KeyMode::Identity && self.key_id.is_empty()
    }
}

impl EncryptionConfig {
    pub fn to_json(&self) -> EncryptionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(payload: &[u8]) -> EncryptionResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| EncryptionError::InvalidConfig(err.to_string()))
    }

    pub fn resource(&self, resource: &GroupResource) -> Option<&ResourceConfig> {
        self.resources
            .iter()
            .find(|candidate| &candidate.resource == resource)
    }
}

/// Most recent first; ids that do not parse sort last in their original order.
pub fn sort_recent_first(keys: &mut [KeyState]) {
    keys.sort_by(|a, b| match (a.id(), b.id()) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Parses a deployed config into key state. `records` are the backed keys from
/// the store; a config key matching one by id and material is marked backed
/// and inherits its migration metadata.
pub fn to_encryption_state(
    config: &EncryptionConfig,
    records: &[KeyState],
) -> EncryptionResult<EncryptionState> {
    let mut state = EncryptionState::new();

    for resource_config in &config.resources {
        let mut write_key = None;
        let mut read_keys: Vec<KeyState> = Vec::new();

        for (index, provider) in resource_config.providers.iter().enumerate() {
            if provider.key_id.is_empty() {
                if provider.mode != KeyMode::Identity {
                    return Err(EncryptionError::InvalidConfig(format!(
                        "{} provider for {} has no key id",
                        provider.mode, resource_config.resource
                    )));
                }
                continue;
            }

            let secret = STANDARD.decode(provider.secret.as_bytes()).map_err(|err| {
                EncryptionError::InvalidConfig(format!(
                    "key {} for {} is not valid base64: {err}",
                    provider.key_id, resource_config.resource
                ))
            })?;

            let mut key = KeyState {
                key_id: provider.key_id.clone(),
                secret,
                mode: provider.mode,
                migrated: Default::default(),
                internal_reason: String::new(),
                external_reason: String::new(),
                backed: false,
            };
            if let Some(record) = records.iter().find(|record| record.same_key(&key)) {
                key.migrated = record.migrated.clone();
                key.internal_reason = record.internal_reason.clone();
                key.external_reason = record.external_reason.clone();
                key.backed = true;
            }

            if index == 0 {
                write_key = Some(key.clone());
            }
            if !read_keys.iter().any(|existing| existing.same_key(&key)) {
                read_keys.push(key);
            }
        }

        sort_recent_first(&mut read_keys);
        let previous = state.insert(
            resource_config.resource.clone(),
            GroupResourceState {
                write_key,
                read_keys,
            },
        );
        if previous.is_some() {
            return Err(EncryptionError::InvalidConfig(format!(
                "resource {} is listed twice",
                resource_config.resource
            )));
        }
    }

    Ok(state)
}

/// Renders key state into the config consumed by the service.
pub fn from_encryption_state(state: &EncryptionState) -> EncryptionConfig {
    let resources = state
        .iter()
        .map(|(resource, grs)| {
            let mut providers = Vec::with_capacity(grs.read_keys.len() + 1);
            match &grs.write_key {
                Some(write_key) => {
                    providers.push(ProviderConfig::from_key(write_key));
                    providers.extend(
                        grs.read_keys
                            .iter()
                            .filter(|key| !key.same_key(write_key))
                            .map(ProviderConfig::from_key),
                    );
                    if !providers.iter().any(|p| p.mode == KeyMode::Identity) {
                        providers.push(ProviderConfig::identity());
                    }
                }
                None => {
                    providers.push(ProviderConfig::identity());
                    providers.extend(
                        grs.read_keys
                            .iter()
                            .filter(|key| key.mode != KeyMode::Identity)
                            .map(ProviderConfig::from_key),
                    );
                }
            }
            debug_assert!(providers.iter().filter(|p| p.is_fallback()).count() <= 1);
            ResourceConfig {
                resource: resource.clone(),
                providers,
            }
        })
        .collect();

    EncryptionConfig { resources }
}
