//! The encryption control loops.

pub mod condition;
pub mod control_loop;
pub mod key;
pub mod migration;
pub mod prune;
pub mod state;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::EncryptionResult;
use crate::status::{Condition, StatusSink};

pub use condition::ConditionController;
pub use control_loop::ControlLoop;
pub use key::KeyController;
pub use migration::MigrationController;
pub use prune::PruneController;
pub use state::StateController;

/// What a successful sync asks of its loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Done,
    /// Preconditions were not met; sync again after the delay.
    Requeue(Duration),
}

/// key: encryption-controller
#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Condition set to `True` while syncs fail.
    fn degraded_condition(&self) -> &'static str;

    async fn sync(&self) -> EncryptionResult<SyncOutcome>;
}

/// Runs one sync and reports its Degraded condition.
pub async fn sync_once(
    controller: &dyn Controller,
    status: &dyn StatusSink,
) -> EncryptionResult<SyncOutcome> {
    let result = controller.sync().await;
    let condition = match &result {
        Ok(_) => Condition::healthy(controller.degraded_condition()),
        Err(err) => Condition::degraded(controller.degraded_condition(), err.to_string()),
    };
    if let Err(err) = status.apply(condition).await {
        warn!(controller = controller.name(), %err, "failed to report degraded condition");
    }
    result
}
