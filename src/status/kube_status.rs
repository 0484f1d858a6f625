use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::record::COMPONENT_LABEL;

use super::{Condition, OperatorStatus, StatusSink};

pub fn status_record_name(component: &str) -> String {
    format!("encryption-status-{component}")
}

/// key: encryption-kube-status
/// [`StatusSink`] that persists conditions into one ConfigMap per component,
/// one data entry per condition type holding the condition as JSON. Only
/// changed conditions are written.
#[derive(Clone)]
pub struct KubeOperatorStatus {
    component: String,
    name: String,
    config_maps: Api<ConfigMap>,
    known: OperatorStatus,
}

impl KubeOperatorStatus {
    pub fn new(client: kube::Client, namespace: &str, component: impl Into<String>) -> Self {
        let component = component.into();
        Self {
            name: status_record_name(&component),
            component,
            config_maps: Api::namespaced(client, namespace),
            known: OperatorStatus::new(),
        }
    }

    /// Reads conditions written by an earlier run so their transition times
    /// carry over.
    pub async fn load(&self) -> EncryptionResult<()> {
        let data = self
            .config_maps
            .get_opt(&self.name)
            .await?
            .and_then(|config_map| config_map.data)
            .unwrap_or_default();
        for condition in parse_conditions(&data) {
            self.known.record(condition);
        }
        Ok(())
    }

    async fn write(&self, condition: &Condition) -> EncryptionResult<()> {
        let patch = condition_patch(&self.component, condition)?;
        match self
            .config_maps
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => self.create(condition).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn create(&self, condition: &Condition) -> EncryptionResult<()> {
        let mut data = BTreeMap::new();
        data.insert(
            condition.condition_type.clone(),
            serde_json::to_string(condition)?,
        );
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(BTreeMap::from([(
                    COMPONENT_LABEL.to_string(),
                    self.component.clone(),
                )])),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        };
        match self.config_maps.create(&PostParams::default(), &config_map).await {
            Ok(_) => {
                debug!(name = %self.name, "created operator status record");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(EncryptionError::Conflict(self.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Merge patch setting a single condition entry.
pub(crate) fn condition_patch(component: &str, condition: &Condition) -> EncryptionResult<Value> {
    let mut labels = Map::new();
    labels.insert(COMPONENT_LABEL.to_string(), Value::String(component.to_string()));
    let mut data = Map::new();
    data.insert(
        condition.condition_type.clone(),
        Value::String(serde_json::to_string(condition)?),
    );
    Ok(json!({
        "metadata": { "labels": labels },
        "data": data,
    }))
}

/// Conditions stored in a status record. Entries that do not parse, or whose
/// key disagrees with their type, are skipped.
pub(crate) fn parse_conditions(data: &BTreeMap<String, String>) -> Vec<Condition> {
    data.iter()
        .filter_map(|(key, value)| match serde_json::from_str::<Condition>(value) {
            Ok(condition) if condition.condition_type == *key => Some(condition),
            Ok(condition) => {
                warn!(%key, condition = %condition.condition_type, "status entry under the wrong key");
                None
            }
            Err(err) => {
                warn!(%key, %err, "skipping unreadable status entry");
                None
            }
        })
        .collect()
}

#[async_trait]
impl StatusSink for KubeOperatorStatus {
    async fn apply(&self, condition: Condition) -> EncryptionResult<()> {
        let condition_type = condition.condition_type.clone();
        let previous = self.known.get(&condition_type);
        let Some(changed) = self.known.record(condition) else {
            return Ok(());
        };
        if let Err(err) = self.write(&changed).await {
            // unwritten, so the next apply tries again
            self.known.restore(&condition_type, previous);
            return Err(err);
        }
        Ok(())
    }
}
