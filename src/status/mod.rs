//! Operator conditions reported by the controllers.

pub mod kube_status;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EncryptionResult;

pub use kube_status::{status_record_name, KubeOperatorStatus};

pub const ENCRYPTED: &str = "Encrypted";
pub const KEY_CONTROLLER_DEGRADED: &str = "EncryptionKeyControllerDegraded";
pub const STATE_CONTROLLER_DEGRADED: &str = "EncryptionStateControllerDegraded";
pub const MIGRATION_CONTROLLER_DEGRADED: &str = "EncryptionMigrationControllerDegraded";
pub const MIGRATION_CONTROLLER_PROGRESSING: &str = "EncryptionMigrationControllerProgressing";
pub const PRUNE_CONTROLLER_DEGRADED: &str = "EncryptionPruneControllerDegraded";
pub const CONDITION_CONTROLLER_DEGRADED: &str = "EncryptionConditionControllerDegraded";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: operator-condition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// `True/Error` carrying the sync error.
    pub fn degraded(condition_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::True, "Error", message)
    }

    pub fn healthy(condition_type: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::False, "AsExpected", "")
    }

    /// Same status, reason and message; transition times are ignored.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// key: status-sink
/// Write-only destination for conditions. Controllers never read it back.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn apply(&self, condition: Condition) -> EncryptionResult<()>;
}

/// key: operator-status
/// In-memory condition set. The transition time only moves when the status
/// itself changes.
#[derive(Clone, Debug, Default)]
pub struct OperatorStatus {
    conditions: Arc<Mutex<BTreeMap<String, Condition>>>,
}

impl OperatorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Condition>> {
        self.conditions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, condition_type: &str) -> Option<Condition> {
        self.lock().get(condition_type).cloned()
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.lock().values().cloned().collect()
    }

    /// Stores `condition` and returns it when anything but the transition
    /// time changed. The transition time only moves with the status.
    pub fn record(&self, mut condition: Condition) -> Option<Condition> {
        let mut conditions = self.lock();
        match conditions.get(&condition.condition_type) {
            Some(existing) if existing.same_state(&condition) => return None,
            Some(existing) if existing.status == condition.status => {
                condition.last_transition_time = existing.last_transition_time;
            }
            _ => {
                info!(
                    condition = %condition.condition_type,
                    status = %condition.status,
                    reason = %condition.reason,
                    message = %condition.message,
                    "condition changed"
                );
            }
        }
        conditions.insert(condition.condition_type.clone(), condition.clone());
        Some(condition)
    }

    /// Puts back what [`OperatorStatus::record`] replaced.
    pub fn restore(&self, condition_type: &str, previous: Option<Condition>) {
        let mut conditions = self.lock();
        match previous {
            Some(previous) => conditions.insert(condition_type.to_string(), previous),
            None => conditions.remove(condition_type),
        };
    }
}

#[async_trait]
impl StatusSink for OperatorStatus {
    async fn apply(&self, condition: Condition) -> EncryptionResult<()> {
        self.record(condition);
        Ok(())
    }
}
