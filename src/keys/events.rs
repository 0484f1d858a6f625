use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// key: encryption-change-event
/// Human-readable notification describing a change to the encryption state.
/// Observability only; nothing reads these back.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionEvent {
    pub reason: EncryptionEventReason,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncryptionEventReason {
    EncryptionKeyCreated,
    EncryptionConfigCreated,
    EncryptionConfigUpdated,
    EncryptionWriteKeyPromoted,
    EncryptionWriteKeyRemoved,
    EncryptionWriteKeyRotated,
    EncryptionResourceAdded,
    EncryptionResourceRemoved,
    EncryptionReadKeysChanged,
    EncryptionKeyMigrated,
    EncryptionKeyPruned,
}

impl EncryptionEventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionEventReason::EncryptionKeyCreated => "EncryptionKeyCreated",
            EncryptionEventReason::EncryptionConfigCreated => "EncryptionConfigCreated",
            EncryptionEventReason::EncryptionConfigUpdated => "EncryptionConfigUpdated",
            EncryptionEventReason::EncryptionWriteKeyPromoted => "EncryptionWriteKeyPromoted",
            EncryptionEventReason::EncryptionWriteKeyRemoved => "EncryptionWriteKeyRemoved",
            EncryptionEventReason::EncryptionWriteKeyRotated => "EncryptionWriteKeyRotated",
            EncryptionEventReason::EncryptionResourceAdded => "EncryptionResourceAdded",
            EncryptionEventReason::EncryptionResourceRemoved => "EncryptionResourceRemoved",
            EncryptionEventReason::EncryptionReadKeysChanged => "EncryptionReadKeysChanged",
            EncryptionEventReason::EncryptionKeyMigrated => "EncryptionKeyMigrated",
            EncryptionEventReason::EncryptionKeyPruned => "EncryptionKeyPruned",
        }
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, reason: EncryptionEventReason, message: String);
}

/// Writes every event to the log.
#[derive(Clone, Debug, Default)]
pub struct TracingEventRecorder;

#[async_trait]
impl EventRecorder for TracingEventRecorder {
    async fn record(&self, reason: EncryptionEventReason, message: String) {
        info!(reason = reason.as_str(), %message, "encryption event");
    }
}

/// Keeps events in memory so tests can assert on them.
#[derive(Clone, Debug, Default)]
pub struct MemoryEventRecorder {
    events: Arc<Mutex<Vec<EncryptionEvent>>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EncryptionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<EncryptionEventReason> {
        self.events().into_iter().map(|event| event.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn record(&self, reason: EncryptionEventReason, message: String) {
        info!(reason = reason.as_str(), %message, "encryption event");
        if let Ok(mut events) = self.events.lock() {
            events.push(EncryptionEvent {
                reason,
                message,
                occurred_at: Utc::now(),
            });
        }
    }
}
