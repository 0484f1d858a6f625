//! Observation of the replicated service that consumes the encryption config.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::record::CONFIG_DATA;
use crate::keys::KeyStore;
use crate::state::EncryptionConfig;

pub const REVISION_LABEL: &str = "revision";

/// key: deployer-revision
/// Revision the replicas run. `converged` is true only once every replica
/// reports the same revision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployerRevision {
    pub revision: Option<String>,
    pub converged: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeployerEvent {
    RevisionChanged,
}

/// key: deployer
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn current_revision(&self) -> EncryptionResult<DeployerRevision>;

    /// Config deployed at `revision`, `None` when that revision carries none.
    async fn deployed_config(&self, revision: &str) -> EncryptionResult<Option<EncryptionConfig>>;

    fn subscribe(&self) -> broadcast::Receiver<DeployerEvent>;
}

#[derive(Default)]
struct MemoryDeployerState {
    revisions: BTreeMap<u64, Option<EncryptionConfig>>,
    current: Option<u64>,
    converged: bool,
}

/// key: memory-deployer
/// In-memory deployer. Each rollout mints a numbered revision; a rollout can be
/// left unconverged to simulate replicas still updating.
#[derive(Clone)]
pub struct MemoryDeployer {
    state: Arc<Mutex<MemoryDeployerState>>,
    events: broadcast::Sender<DeployerEvent>,
}

impl Default for MemoryDeployer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeployer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MemoryDeployerState::default())),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDeployerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts rolling out `config` without converging.
    pub fn start_rollout(&self, config: Option<EncryptionConfig>) -> String {
        let revision = {
            let mut state = self.lock();
            let next = state.revisions.keys().next_back().copied().unwrap_or(0) + 1;
            state.revisions.insert(next, config);
            state.current = Some(next);
            state.converged = false;
            next
        };
        let _ = self.events.send(DeployerEvent::RevisionChanged);
        revision.to_string()
    }

    pub fn finish_rollout(&self) {
        self.lock().converged = true;
        let _ = self.events.send(DeployerEvent::RevisionChanged);
    }

    /// Rolls out `config` and converges immediately.
    pub fn deploy(&self, config: Option<EncryptionConfig>) -> String {
        let revision = self.start_rollout(config);
        self.finish_rollout();
        revision
    }

    pub fn current_config(&self) -> Option<EncryptionConfig> {
        let state = self.lock();
        state
            .current
            .and_then(|current| state.revisions.get(&current).cloned().flatten())
    }

    /// Deploys whatever config the store currently publishes, if it differs
    /// from the running one. Returns the new revision.
    pub async fn rollout_from_store(&self, store: &dyn KeyStore) -> EncryptionResult<Option<String>> {
        let published = match store.get_config().await? {
            Some(stored) => Some(EncryptionConfig::from_json(&stored.payload)?),
            None => None,
        };
        if published.is_none() || published == self.current_config() {
            return Ok(None);
        }
        let revision = self.deploy(published);
        debug!(%revision, "rolled out published encryption config");
        Ok(Some(revision))
    }
}

#[async_trait]
impl Deployer for MemoryDeployer {
    async fn current_revision(&self) -> EncryptionResult<DeployerRevision> {
        let state = self.lock();
        Ok(DeployerRevision {
            revision: state.current.map(|current| current.to_string()),
            converged: state.current.is_some() && state.converged,
        })
    }

    async fn deployed_config(&self, revision: &str) -> EncryptionResult<Option<EncryptionConfig>> {
        let Ok(number) = revision.parse::<u64>() else {
            return Ok(None);
        };
        Ok(self.lock().revisions.get(&number).cloned().flatten())
    }

    fn subscribe(&self) -> broadcast::Receiver<DeployerEvent> {
        self.events.subscribe()
    }
}

/// key: revision-label-pod-deployer
/// Reads the running revision from the `revision` label of the service's pods
/// and the deployed config from the `encryption-config-<revision>` Secret.
#[derive(Clone)]
pub struct RevisionLabelPodDeployer {
    pods: Api<Pod>,
    secrets: Api<Secret>,
    selector: String,
    events: broadcast::Sender<DeployerEvent>,
}

impl RevisionLabelPodDeployer {
    pub fn new(client: kube::Client, namespace: &str, selector: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
            selector: selector.into(),
            events,
        }
    }

    pub fn start_watching(&self) {
        let pods = self.pods.clone();
        let config = watcher::Config::default().labels(&self.selector);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stream = watcher(pods, config).boxed();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(_) => {
                        let _ = events.send(DeployerEvent::RevisionChanged);
                    }
                    Err(err) => warn!(?err, "pod watch failed, retrying"),
                }
            }
            debug!("pod watch stream ended");
        });
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// Reduces pod revisions to one observation. Mixed or missing revisions are
/// reported as not converged.
fn summarize_pods(pods: &[Pod]) -> DeployerRevision {
    if pods.is_empty() {
        return DeployerRevision::default();
    }
    let mut revisions = BTreeSet::new();
    let mut all_ready = true;
    for pod in pods {
        let revision = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(REVISION_LABEL))
            .cloned();
        match revision {
            Some(revision) => {
                revisions.insert(revision);
            }
            None => return DeployerRevision::default(),
        }
        all_ready &= pod_is_ready(pod);
    }

    let latest = revisions
        .iter()
        .max_by_key(|revision| revision.parse::<u64>().unwrap_or(0))
        .cloned();
    DeployerRevision {
        converged: revisions.len() == 1 && all_ready,
        revision: latest,
    }
}

#[async_trait]
impl Deployer for RevisionLabelPodDeployer {
    async fn current_revision(&self) -> EncryptionResult<DeployerRevision> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(&self.selector))
            .await?;
        let observed = summarize_pods(&pods.items);
        if !observed.converged {
            info!(revision = ?observed.revision, pods = pods.items.len(), "replicas have not converged");
        }
        Ok(observed)
    }

    async fn deployed_config(&self, revision: &str) -> EncryptionResult<Option<EncryptionConfig>> {
        let name = format!("encryption-config-{revision}");
        let Some(secret) = self.secrets.get_opt(&name).await? else {
            return Ok(None);
        };
        let Some(payload) = secret.data.and_then(|mut data| data.remove(CONFIG_DATA)) else {
            return Ok(None);
        };
        EncryptionConfig::from_json(&payload.0).map(Some).map_err(|err| {
            EncryptionError::InvalidConfig(format!("revision {revision}: {err}"))
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<DeployerEvent> {
        self.events.subscribe()
    }
}
