use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::EncryptionResult;
use crate::keys::{GroupResource, KeyMode};
use crate::state::{Assembly, StateSource};
use crate::status::{Condition, ConditionStatus, StatusSink, CONDITION_CONTROLLER_DEGRADED, ENCRYPTED};

use super::{Controller, SyncOutcome};

pub const REASON_ENCRYPTION_DISABLED: &str = "EncryptionDisabled";
pub const REASON_ENCRYPTION_IN_PROGRESS: &str = "EncryptionInProgress";
pub const REASON_ENCRYPTION_COMPLETED: &str = "EncryptionCompleted";
pub const REASON_DECRYPTION_IN_PROGRESS: &str = "DecryptionInProgress";
pub const REASON_DECRYPTION_COMPLETED: &str = "DecryptionCompleted";

fn not_encrypted(reason: &str, message: String) -> Condition {
    Condition::new(ENCRYPTED, ConditionStatus::False, reason, message)
}

fn decryption(completed: bool) -> Condition {
    if completed {
        not_encrypted(
            REASON_DECRYPTION_COMPLETED,
            "Encryption mode set to identity and everything is decrypted".to_string(),
        )
    } else {
        not_encrypted(
            REASON_DECRYPTION_IN_PROGRESS,
            "Encryption mode set to identity and decryption is not finished".to_string(),
        )
    }
}

/// Derives the `Encrypted` condition. The desired state is consulted first so
/// a requested decryption shows up before it is deployed; the deployed state
/// then decides per kind, in `resources` order.
pub fn encrypted_condition(assembly: &Assembly, resources: &[GroupResource]) -> Condition {
    if !assembly.found_any_keys {
        return not_encrypted(REASON_ENCRYPTION_DISABLED, "Encryption is not enabled".to_string());
    }

    let mut decrypting = assembly
        .desired_state
        .iter()
        .filter_map(|(resource, state)| {
            state
                .write_key
                .as_ref()
                .filter(|key| key.mode == KeyMode::Identity)
                .map(|key| key.migrated_for(resource))
        })
        .peekable();
    if decrypting.peek().is_some() {
        let completed = decrypting.all(|migrated| migrated);
        return decryption(completed);
    }

    for resource in resources {
        let not_encrypted_yet = || {
            not_encrypted(
                REASON_ENCRYPTION_IN_PROGRESS,
                format!("Resource {} is not encrypted", resource.qualified()),
            )
        };
        let Some(state) = assembly.current_state.get(resource) else {
            return not_encrypted_yet();
        };
        let Some(write_key) = &state.write_key else {
            return not_encrypted_yet();
        };
        if write_key.mode == KeyMode::Identity {
            return decryption(write_key.migrated_for(resource));
        }

        // data written before the write key may still be plaintext
        let oldest_is_plaintext = state
            .read_keys
            .last()
            .map(|key| key.mode == KeyMode::Identity || key.same_key(write_key))
            .unwrap_or(true);
        if !write_key.migrated_for(resource) && oldest_is_plaintext {
            return not_encrypted(
                REASON_ENCRYPTION_IN_PROGRESS,
                format!("Resource {} is being encrypted", resource.qualified()),
            );
        }
    }

    let encrypted = resources
        .iter()
        .map(GroupResource::qualified)
        .collect::<Vec<_>>()
        .join(", ");
    Condition::new(
        ENCRYPTED,
        ConditionStatus::True,
        REASON_ENCRYPTION_COMPLETED,
        format!("All resources encrypted: {encrypted}"),
    )
}

/// key: encryption-condition-controller
pub struct ConditionController {
    source: StateSource,
    status: Arc<dyn StatusSink>,
}

impl ConditionController {
    pub fn new(source: StateSource, status: Arc<dyn StatusSink>) -> Self {
        Self { source, status }
    }
}

#[async_trait]
impl Controller for ConditionController {
    fn name(&self) -> &'static str {
        "EncryptionConditionController"
    }

    fn degraded_condition(&self) -> &'static str {
        CONDITION_CONTROLLER_DEGRADED
    }

    async fn sync(&self) -> EncryptionResult<SyncOutcome> {
        let assembly = self.source.assemble().await?;
        if let Some(reason) = &assembly.not_ready_reason {
            debug!(%reason, "condition controller waiting for deployer");
            return Ok(SyncOutcome::Done);
        }
        let condition = encrypted_condition(&assembly, self.source.resources());
        self.status.apply(condition).await?;
        Ok(SyncOutcome::Done)
    }
}
