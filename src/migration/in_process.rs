use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EncryptionResult;
use crate::keys::GroupResource;

use super::{MigrationEvent, MigrationRecord, Migrator};

/// Rewrites every stored object of a resource kind so the consuming service
/// re-encrypts it with its current write key.
#[async_trait]
pub trait ObjectRewriter: Send + Sync + 'static {
    /// Returns the number of objects rewritten.
    async fn rewrite_all(&self, resource: &GroupResource) -> EncryptionResult<usize>;
}

type JobKey = (GroupResource, String);

/// key: in-process-migrator
/// [`Migrator`] running each job as a tokio task. Jobs live in memory only; a
/// restart simply re-runs unfinished migrations.
pub struct InProcessMigrator<R: ObjectRewriter> {
    rewriter: Arc<R>,
    jobs: Arc<DashMap<JobKey, MigrationRecord>>,
    events: broadcast::Sender<MigrationEvent>,
}

impl<R: ObjectRewriter> InProcessMigrator<R> {
    pub fn new(rewriter: R) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            rewriter: Arc::new(rewriter),
            jobs: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn jobs(&self) -> Vec<MigrationRecord> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }

    fn spawn_job(&self, key: JobKey, job_id: Uuid) {
        let rewriter = self.rewriter.clone();
        let jobs = self.jobs.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let (resource, key_id) = key.clone();
            let outcome = rewriter.rewrite_all(&resource).await;
            match &outcome {
                Ok(rewritten) => info!(%resource, %key_id, rewritten, "migration finished"),
                Err(err) => warn!(%resource, %key_id, %err, "migration failed"),
            }

            // a pruned or superseded job must not resurrect its record
            let updated = match jobs.get_mut(&key) {
                Some(mut record) if record.job_id == job_id => {
                    record.finished = true;
                    record.finished_at = Some(Utc::now());
                    record.result = outcome.err().map(|err| err.to_string());
                    true
                }
                _ => false,
            };
            if updated {
                let _ = events.send(MigrationEvent::Finished { resource, key_id });
            }
        });
    }
}

#[async_trait]
impl<R: ObjectRewriter> Migrator for InProcessMigrator<R> {
    async fn ensure_migration(
        &self,
        resource: &GroupResource,
        key_id: &str,
    ) -> EncryptionResult<MigrationRecord> {
        let key = (resource.clone(), key_id.to_string());
        if let Some(existing) = self.jobs.get(&key) {
            return Ok(existing.clone());
        }

        // only the latest write key of a kind is worth migrating to
        self.jobs
            .retain(|(other_resource, other_key), _| other_resource != resource || other_key == key_id);

        let record = MigrationRecord::started(resource.clone(), key_id, Utc::now());
        let job_id = record.job_id;
        let record = self.jobs.entry(key.clone()).or_insert(record).clone();
        if record.job_id == job_id {
            info!(%resource, key_id, %job_id, "starting migration");
            self.spawn_job(key, job_id);
        }
        Ok(record)
    }

    async fn prune_migration(&self, resource: &GroupResource) -> EncryptionResult<()> {
        self.jobs.retain(|(other, _), _| other != resource);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }
}
