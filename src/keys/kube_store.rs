use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::runtime::watcher;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{EncryptionError, EncryptionResult};

use super::models::{StoredConfig, StoredKey};
use super::record::{component_selector, config_record_name, CONFIG_DATA};
use super::store::{KeyStore, StoreEvent};

const SECRET_TYPE: &str = "Opaque";

/// key: encryption-kube-store
/// [`KeyStore`] backed by Kubernetes Secrets in one namespace. Key records are
/// selected by the component label; the config record is a Secret with a
/// well-known name.
#[derive(Clone)]
pub struct KubeKeyStore {
    component: String,
    secrets: Api<Secret>,
    events: broadcast::Sender<StoreEvent>,
}

impl KubeKeyStore {
    pub fn new(client: kube::Client, namespace: &str, component: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            component: component.into(),
            secrets: Api::namespaced(client, namespace),
            events,
        }
    }

    /// Spawns watchers on key records and the config record that feed
    /// [`KeyStore::subscribe`]. `kube::runtime::watcher` re-lists on error.
    pub fn start_watching(&self) {
        let keys_config = watcher::Config::default().labels(&component_selector(&self.component));
        spawn_watch(self.secrets.clone(), keys_config, self.events.clone(), false);

        let config_config =
            watcher::Config::default().fields(&format!("metadata.name={}", config_record_name(&self.component)));
        spawn_watch(self.secrets.clone(), config_config, self.events.clone(), true);
    }
}

fn spawn_watch(
    api: Api<Secret>,
    config: watcher::Config,
    events: broadcast::Sender<StoreEvent>,
    is_config: bool,
) {
    tokio::spawn(async move {
        let mut stream = watcher(api, config).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Applied(secret)) => {
                    let name = secret.metadata.name.unwrap_or_default();
                    let signal = if is_config {
                        StoreEvent::ConfigChanged
                    } else {
                        StoreEvent::KeyChanged(name)
                    };
                    let _ = events.send(signal);
                }
                Ok(watcher::Event::Deleted(secret)) => {
                    let name = secret.metadata.name.unwrap_or_default();
                    let signal = if is_config {
                        StoreEvent::ConfigChanged
                    } else {
                        StoreEvent::KeyDeleted(name)
                    };
                    let _ = events.send(signal);
                }
                Ok(watcher::Event::Restarted(_)) => {
                    let _ = events.send(StoreEvent::ConfigChanged);
                }
                Err(err) => warn!(?err, "secret watch failed, retrying"),
            }
        }
        debug!("secret watch stream ended");
    });
}

fn map_kube_error(name: &str, err: kube::Error) -> EncryptionError {
    match &err {
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            EncryptionError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(response) if response.code == 409 => {
            EncryptionError::Conflict(name.to_string())
        }
        kube::Error::Api(response) if response.code == 404 => {
            EncryptionError::NotFound(name.to_string())
        }
        _ => EncryptionError::Kube(err),
    }
}

fn secret_to_stored_key(secret: Secret) -> StoredKey {
    let metadata = secret.metadata;
    StoredKey {
        name: metadata.name.unwrap_or_default(),
        labels: metadata.labels.unwrap_or_default(),
        annotations: metadata.annotations.unwrap_or_default(),
        data: secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect(),
        finalizers: metadata.finalizers.unwrap_or_default(),
        resource_version: metadata.resource_version,
        deleting: metadata.deletion_timestamp.is_some(),
    }
}

fn stored_key_to_secret(key: StoredKey) -> Secret {
    let data: BTreeMap<String, ByteString> = key
        .data
        .into_iter()
        .map(|(name, value)| (name, ByteString(value)))
        .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some(key.name),
            labels: Some(key.labels),
            annotations: Some(key.annotations),
            finalizers: Some(key.finalizers),
            resource_version: key.resource_version,
            ..ObjectMeta::default()
        },
        data: Some(data),
        type_: Some(SECRET_TYPE.to_string()),
        ..Secret::default()
    }
}

#[async_trait]
impl KeyStore for KubeKeyStore {
    fn component(&self) -> &str {
        &self.component
    }

    async fn list_keys(&self) -> EncryptionResult<Vec<StoredKey>> {
        let params = ListParams::default().labels(&component_selector(&self.component));
        let secrets = self.secrets.list(&params).await?;
        Ok(secrets.items.into_iter().map(secret_to_stored_key).collect())
    }

    async fn get_key(&self, name: &str) -> EncryptionResult<Option<StoredKey>> {
        let secret = self
            .secrets
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(name, err))?;
        Ok(secret.map(secret_to_stored_key))
    }

    async fn create_key(&self, key: StoredKey) -> EncryptionResult<StoredKey> {
        let name = key.name.clone();
        let mut secret = stored_key_to_secret(key);
        secret.metadata.resource_version = None;
        let created = self
            .secrets
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|err| map_kube_error(&name, err))?;
        Ok(secret_to_stored_key(created))
    }

    async fn update_key(&self, key: StoredKey) -> EncryptionResult<StoredKey> {
        let name = key.name.clone();
        let secret = stored_key_to_secret(key);
        let updated = self
            .secrets
            .replace(&name, &PostParams::default(), &secret)
            .await
            .map_err(|err| map_kube_error(&name, err))?;
        Ok(secret_to_stored_key(updated))
    }

    async fn delete_key(&self, name: &str) -> EncryptionResult<()> {
        match self.secrets.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) => match map_kube_error(name, err) {
                EncryptionError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_config(&self) -> EncryptionResult<Option<StoredConfig>> {
        let name = config_record_name(&self.component);
        let secret = self
            .secrets
            .get_opt(&name)
            .await
            .map_err(|err| map_kube_error(&name, err))?;
        Ok(secret.map(|secret| StoredConfig {
            name: name.clone(),
            payload: secret
                .data
                .and_then(|mut data| data.remove(CONFIG_DATA))
                .map(|value| value.0)
                .unwrap_or_default(),
            resource_version: secret.metadata.resource_version,
        }))
    }

    async fn apply_config(&self, config: StoredConfig) -> EncryptionResult<StoredConfig> {
        let name = config_record_name(&self.component);
        let mut data = BTreeMap::new();
        data.insert(CONFIG_DATA.to_string(), ByteString(config.payload.clone()));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                resource_version: config.resource_version.clone(),
                ..ObjectMeta::default()
            },
            data: Some(data),
            type_: Some(SECRET_TYPE.to_string()),
            ..Secret::default()
        };

        let written = match config.resource_version {
            None => self.secrets.create(&PostParams::default(), &secret).await,
            Some(_) => {
                self.secrets
                    .replace(&name, &PostParams::default(), &secret)
                    .await
            }
        }
        .map_err(|err| map_kube_error(&name, err))?;

        Ok(StoredConfig {
            name,
            payload: config.payload,
            resource_version: written.metadata.resource_version,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
