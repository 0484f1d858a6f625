//! Encryption key records and the stores that hold them.

pub mod events;
pub mod kube_store;
pub mod models;
pub mod record;
pub mod store;

pub use events::{EncryptionEvent, EncryptionEventReason, EventRecorder, MemoryEventRecorder, TracingEventRecorder};
pub use kube_store::KubeKeyStore;
pub use models::{
    EncryptionSettings, EncryptionState, GroupResource, GroupResourceState, KeyMode, KeyState,
    MigrationState, StoredConfig, StoredKey,
};
pub use store::{retry_on_conflict, KeyStore, MemoryKeyStore, StoreEvent};
