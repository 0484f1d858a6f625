//! Re-encryption of stored objects after a write key change.

pub mod in_process;
pub mod kube_rewriter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EncryptionResult;
use crate::keys::GroupResource;

pub use in_process::{InProcessMigrator, ObjectRewriter};
pub use kube_rewriter::KubeObjectRewriter;

/// key: migration-record
/// Progress of rewriting one resource kind with one write key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub job_id: Uuid,
    pub resource: GroupResource,
    pub key_id: String,
    pub finished: bool,
    /// Error text when the job failed.
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    pub fn started(resource: GroupResource, key_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            resource,
            key_id: key_id.into(),
            finished: false,
            result: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.finished && self.result.is_none()
    }

    pub fn failed(&self) -> bool {
        self.finished && self.result.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationEvent {
    Finished { resource: GroupResource, key_id: String },
}

/// key: migrator
/// Runs migration jobs. `ensure_migration` is idempotent: it starts a job for
/// `(resource, key_id)` only if none is known and otherwise reports the known
/// one.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn ensure_migration(
        &self,
        resource: &GroupResource,
        key_id: &str,
    ) -> EncryptionResult<MigrationRecord>;

    /// Forgets every job for `resource`, finished or not.
    async fn prune_migration(&self, resource: &GroupResource) -> EncryptionResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<MigrationEvent>;
}
