use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{EncryptionError, EncryptionResult};

use super::models::{StoredConfig, StoredKey};
use super::record::{config_record_name, COMPONENT_LABEL};

const CONFLICT_RETRY_ATTEMPTS: usize = 5;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// key: encryption-store-event
/// Change notification emitted by a key store. Controllers only use it as a
/// wake-up signal and always re-read state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    KeyChanged(String),
    KeyDeleted(String),
    ConfigChanged,
}

/// key: encryption-key-store
/// Component-scoped store of key records and the canonical config record.
/// Every write carries the expected `resource_version`; a stale version fails
/// with [`EncryptionError::Conflict`].
#[async_trait]
pub trait KeyStore: Send + Sync {
    fn component(&self) -> &str;

    async fn list_keys(&self) -> EncryptionResult<Vec<StoredKey>>;

    async fn get_key(&self, name: &str) -> EncryptionResult<Option<StoredKey>>;

    /// Fails with [`EncryptionError::AlreadyExists`] if the name is taken.
    async fn create_key(&self, key: StoredKey) -> EncryptionResult<StoredKey>;

    async fn update_key(&self, key: StoredKey) -> EncryptionResult<StoredKey>;

    /// Deleting a record that still carries finalizers only marks it as
    /// deleting; it disappears once the finalizers are removed.
    async fn delete_key(&self, name: &str) -> EncryptionResult<()>;

    async fn get_config(&self) -> EncryptionResult<Option<StoredConfig>>;

    /// Creates the config when `resource_version` is `None`, otherwise updates
    /// it if the version still matches.
    async fn apply_config(&self, config: StoredConfig) -> EncryptionResult<StoredConfig>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Re-runs `op` from scratch while it fails with a write conflict.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> EncryptionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EncryptionResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_conflict() && attempt < CONFLICT_RETRY_ATTEMPTS => {
                debug!(attempt, %err, "write conflict, retrying from a fresh read");
                attempt += 1;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    keys: BTreeMap<String, StoredKey>,
    config: Option<StoredConfig>,
    next_version: u64,
    injected_conflicts: usize,
    injected_failures: usize,
}

impl MemoryState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_injected(&mut self, name: &str) -> EncryptionResult<()> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(EncryptionError::Store(format!(
                "injected failure writing {name}"
            )));
        }
        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            return Err(EncryptionError::Conflict(name.to_string()));
        }
        Ok(())
    }
}

/// key: encryption-memory-store
/// In-memory [`KeyStore`] with resource versions, finalizer semantics and
/// fault injection. Used by tests and local runs.
#[derive(Clone)]
pub struct MemoryKeyStore {
    component: String,
    state: Arc<Mutex<MemoryState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryKeyStore {
    pub fn new(component: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            component: component.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
            events,
        }
    }

    /// The next `count` writes fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().injected_conflicts = count;
    }

    /// The next `count` writes fail with a store error.
    pub fn inject_failures(&self, count: usize) {
        self.lock().injected_failures = count;
    }

    /// Inserts a record verbatim, bypassing label scoping. Test seeding only.
    pub fn seed_key(&self, mut key: StoredKey) {
        let mut state = self.lock();
        key.resource_version = Some(state.bump());
        state.keys.insert(key.name.clone(), key);
    }

    pub fn key_names(&self) -> Vec<String> {
        self.lock().keys.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // a poisoned lock only means a test panicked mid-write
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_scope(&self, key: &StoredKey) -> bool {
        key.labels.get(COMPONENT_LABEL).map(String::as_str) == Some(self.component.as_str())
    }

    fn notify(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    fn component(&self) -> &str {
        &self.component
    }

    async fn list_keys(&self) -> EncryptionResult<Vec<StoredKey>> {
        let state = self.lock();
        Ok(state
            .keys
            .values()
            .filter(|key| self.in_scope(key))
            .cloned()
            .collect())
    }

    async fn get_key(&self, name: &str) -> EncryptionResult<Option<StoredKey>> {
        Ok(self.lock().keys.get(name).cloned())
    }

    async fn create_key(&self, mut key: StoredKey) -> EncryptionResult<StoredKey> {
        let created = {
            let mut state = self.lock();
            state.take_injected(&key.name)?;
            if state.keys.contains_key(&key.name) {
                return Err(EncryptionError::AlreadyExists(key.name));
            }
            key.resource_version = Some(state.bump());
            key.deleting = false;
            state.keys.insert(key.name.clone(), key.clone());
            key
        };
        self.notify(StoreEvent::KeyChanged(created.name.clone()));
        Ok(created)
    }

    async fn update_key(&self, mut key: StoredKey) -> EncryptionResult<StoredKey> {
        let (updated, removed) = {
            let mut state = self.lock();
            state.take_injected(&key.name)?;
            let existing = state
                .keys
                .get(&key.name)
                .ok_or_else(|| EncryptionError::NotFound(key.name.clone()))?;
            if existing.resource_version != key.resource_version {
                return Err(EncryptionError::Conflict(key.name));
            }
            key.deleting = existing.deleting;
            if key.deleting && key.finalizers.is_empty() {
                state.keys.remove(&key.name);
                (key, true)
            } else {
                key.resource_version = Some(state.bump());
                state.keys.insert(key.name.clone(), key.clone());
                (key, false)
            }
        };
        if removed {
            self.notify(StoreEvent::KeyDeleted(updated.name.clone()));
        } else {
            self.notify(StoreEvent::KeyChanged(updated.name.clone()));
        }
        Ok(updated)
    }

    async fn delete_key(&self, name: &str) -> EncryptionResult<()> {
        let removed = {
            let mut state = self.lock();
            state.take_injected(name)?;
            let finalized = match state.keys.get(name) {
                None => return Ok(()),
                Some(existing) => !existing.finalizers.is_empty(),
            };
            if finalized {
                let version = state.bump();
                if let Some(existing) = state.keys.get_mut(name) {
                    existing.deleting = true;
                    existing.resource_version = Some(version);
                }
                false
            } else {
                state.keys.remove(name);
                true
            }
        };
        if removed {
            self.notify(StoreEvent::KeyDeleted(name.to_string()));
        } else {
            self.notify(StoreEvent::KeyChanged(name.to_string()));
        }
        Ok(())
    }

    async fn get_config(&self) -> EncryptionResult<Option<StoredConfig>> {
        Ok(self.lock().config.clone())
    }

    async fn apply_config(&self, mut config: StoredConfig) -> EncryptionResult<StoredConfig> {
        let applied = {
            let mut state = self.lock();
            let name = config_record_name(&self.component);
            state.take_injected(&name)?;
            let current_version = state
                .config
                .as_ref()
                .and_then(|existing| existing.resource_version.clone());
            match (&current_version, &config.resource_version) {
                (None, None) => {}
                (Some(_), None) => return Err(EncryptionError::AlreadyExists(name)),
                (None, Some(_)) => return Err(EncryptionError::NotFound(name)),
                (Some(current), Some(expected)) if current != expected => {
                    return Err(EncryptionError::Conflict(name));
                }
                _ => {}
            }
            config.name = name;
            config.resource_version = Some(state.bump());
            state.config = Some(config.clone());
            config
        };
        self.notify(StoreEvent::ConfigChanged);
        Ok(applied)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
