//! Current and desired encryption state, and the config rendered from it.

pub mod assembler;
pub mod config;

use std::sync::Arc;

use crate::deployer::Deployer;
use crate::error::EncryptionResult;
use crate::keys::{GroupResource, KeyStore};

pub use assembler::{assemble, desired_state, parse_key_records, Assembly, DeployerObservation};
pub use config::{
    from_encryption_state, to_encryption_state, EncryptionConfig, ProviderConfig, ResourceConfig,
};

/// Reads what the deployer runs right now. The config is only fetched once
/// the replicas agree on a revision.
pub async fn observe(deployer: &dyn Deployer) -> EncryptionResult<DeployerObservation> {
    let revision = deployer.current_revision().await?;
    let config = match (&revision.revision, revision.converged) {
        (Some(current), true) => deployer.deployed_config(current).await?,
        _ => None,
    };
    Ok(DeployerObservation { revision, config })
}

/// key: encryption-state-source
/// Everything the controllers read state from.
#[derive(Clone)]
pub struct StateSource {
    store: Arc<dyn KeyStore>,
    deployer: Arc<dyn Deployer>,
    resources: Vec<GroupResource>,
}

impl StateSource {
    pub fn new(
        store: Arc<dyn KeyStore>,
        deployer: Arc<dyn Deployer>,
        mut resources: Vec<GroupResource>,
    ) -> Self {
        resources.sort();
        resources.dedup();
        Self {
            store,
            deployer,
            resources,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn deployer(&self) -> &Arc<dyn Deployer> {
        &self.deployer
    }

    pub fn component(&self) -> &str {
        self.store.component()
    }

    /// Protected resource kinds, sorted.
    pub fn resources(&self) -> &[GroupResource] {
        &self.resources
    }

    pub async fn assemble(&self) -> EncryptionResult<Assembly> {
        let records = self.store.list_keys().await?;
        let observation = observe(self.deployer.as_ref()).await?;
        assemble(self.component(), &records, &observation, &self.resources)
    }
}
