use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// key: encryption-key-mode
/// Provider used to encrypt data with a key. Identity means plaintext.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    Identity,
    #[serde(rename = "aescbc")]
    AesCbc,
    Secretbox,
}

impl KeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::Identity => "identity",
            KeyMode::AesCbc => "aescbc",
            KeyMode::Secretbox => "secretbox",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "identity" => Some(KeyMode::Identity),
            "aescbc" => Some(KeyMode::AesCbc),
            "secretbox" => Some(KeyMode::Secretbox),
            _ => None,
        }
    }

    /// Number of random bytes minted for a new key in this mode.
    pub fn key_len(&self) -> usize {
        match self {
            KeyMode::Identity => 0,
            KeyMode::AesCbc | KeyMode::Secretbox => 32,
        }
    }
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: encryption-group-resource
/// A protected resource kind. The empty group is the core group.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    pub fn core(resource: impl Into<String>) -> Self {
        Self::new("", resource)
    }

    /// Parses `resource` or `resource.group`.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.split_once('.') {
            Some((resource, group)) if !resource.is_empty() => {
                Some(Self::new(group, resource))
            }
            Some(_) => None,
            None => Some(Self::core(trimmed)),
        }
    }

    /// Rendering used in status messages, e.g. `core/secrets`.
    pub fn qualified(&self) -> String {
        if self.group.is_empty() {
            format!("core/{}", self.resource)
        } else {
            format!("{}/{}", self.group, self.resource)
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// key: encryption-migration-state
/// Which resource kinds have been rewritten with a key, and when that last happened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationState {
    pub resources: BTreeSet<GroupResource>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Wire shape of the migrated-resources annotation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigratedGroupResources {
    pub resources: Vec<GroupResource>,
}

/// key: encryption-key-state
/// A key as seen by the state machine: its material, its mode, and what has
/// been migrated onto it. `backed` is true when a live key record with the same
/// id and content exists.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyState {
    pub key_id: String,
    pub secret: Vec<u8>,
    pub mode: KeyMode,
    pub migrated: MigrationState,
    pub internal_reason: String,
    pub external_reason: String,
    pub backed: bool,
}

impl KeyState {
    pub fn new(id: u64, mode: KeyMode, secret: Vec<u8>) -> Self {
        Self {
            key_id: id.to_string(),
            secret,
            mode,
            migrated: MigrationState::default(),
            internal_reason: String::new(),
            external_reason: String::new(),
            backed: false,
        }
    }

    pub fn id(&self) -> Option<u64> {
        self.key_id.parse::<u64>().ok()
    }

    /// Same id and same material; backing and migration metadata are ignored.
    pub fn same_key(&self, other: &KeyState) -> bool {
        self.key_id == other.key_id && self.mode == other.mode && self.secret == other.secret
    }

    pub fn migrated_for(&self, resource: &GroupResource) -> bool {
        self.migrated.resources.contains(resource)
    }

    pub fn migrated_for_all<'a>(&self, resources: impl IntoIterator<Item = &'a GroupResource>) -> bool {
        resources
            .into_iter()
            .all(|resource| self.migrated.resources.contains(resource))
    }

    /// Short digest of the key material, safe to put in logs and events.
    pub fn fingerprint(&self) -> String {
        if self.secret.is_empty() {
            return "none".to_string();
        }
        let digest = Sha256::digest(&self.secret);
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyState")
            .field("key_id", &self.key_id)
            .field("mode", &self.mode)
            .field("fingerprint", &self.fingerprint())
            .field("migrated", &self.migrated)
            .field("backed", &self.backed)
            .finish()
    }
}

/// key: encryption-group-resource-state
/// Keys a resource kind needs: one write key and every key still needed to
/// decrypt, most recent first. The write key is always one of the read keys;
/// it is `read_keys[0]` unless a newer key is staged ahead of it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupResourceState {
    pub write_key: Option<KeyState>,
    pub read_keys: Vec<KeyState>,
}

impl GroupResourceState {
    pub fn has_write_key(&self) -> bool {
        self.write_key.is_some()
    }

    pub fn has_read_key(&self, key: &KeyState) -> bool {
        self.read_keys.iter().any(|candidate| candidate.same_key(key))
    }
}

pub type EncryptionState = BTreeMap<GroupResource, GroupResourceState>;

/// key: encryption-stored-key
/// Raw key record as persisted in the key store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
    pub finalizers: Vec<String>,
    pub resource_version: Option<String>,
    pub deleting: bool,
}

/// key: encryption-stored-config
/// Raw canonical config record as persisted in the key store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredConfig {
    pub name: String,
    pub payload: Vec<u8>,
    pub resource_version: Option<String>,
}

/// key: encryption-settings
/// Operator intent: which mode new keys should use and an optional external
/// reason forcing a rotation when it changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionSettings {
    pub mode: KeyMode,
    pub external_reason: Option<String>,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            mode: KeyMode::AesCbc,
            external_reason: None,
        }
    }
}
