pub mod config;
pub mod controllers;
pub mod deployer;
pub mod error;
pub mod keys;
pub mod migration;
pub mod settings;
pub mod state;
pub mod status;

pub use config::{settings_from_env, EncryptionControllerConfig};
pub use error::{EncryptionError, EncryptionResult};
