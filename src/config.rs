use once_cell::sync::Lazy;
use std::time::Duration;

use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::{EncryptionSettings, GroupResource, KeyMode};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Component whose keys this controller manages. Defaults to `kube-apiserver`.
pub static ENCRYPTION_COMPONENT: Lazy<String> = Lazy::new(|| {
    std::env::var("ENCRYPTION_COMPONENT").unwrap_or_else(|_| "kube-apiserver".to_string())
});

/// Namespace holding key records and the published config. Defaults to
/// `encryption-config-managed`.
pub static ENCRYPTION_NAMESPACE: Lazy<String> = Lazy::new(|| {
    std::env::var("ENCRYPTION_NAMESPACE")
        .unwrap_or_else(|_| "encryption-config-managed".to_string())
});

/// Namespace where the consuming service runs and its per-revision configs live.
pub static ENCRYPTION_TARGET_NAMESPACE: Lazy<String> = Lazy::new(|| {
    std::env::var("ENCRYPTION_TARGET_NAMESPACE").unwrap_or_else(|_| "kube-apiserver".to_string())
});

/// Label selector of the consuming service's pods.
pub static ENCRYPTION_POD_SELECTOR: Lazy<String> = Lazy::new(|| {
    std::env::var("ENCRYPTION_POD_SELECTOR").unwrap_or_else(|_| "app=kube-apiserver".to_string())
});

/// Protected kinds as a comma-separated list of `resource[.group]`. Defaults to
/// `secrets,configmaps`.
pub static ENCRYPTION_RESOURCES: Lazy<Vec<GroupResource>> = Lazy::new(|| {
    std::env::var("ENCRYPTION_RESOURCES")
        .ok()
        .map(|value| parse_resources(&value))
        .filter(|resources| !resources.is_empty())
        .unwrap_or_else(|| vec![GroupResource::core("secrets"), GroupResource::core("configmaps")])
});

/// Raw `ENCRYPTION_MODE`. Validated by [`settings_from_env`].
pub static ENCRYPTION_MODE: Lazy<Option<String>> = Lazy::new(|| optional_env("ENCRYPTION_MODE"));

/// Operator-supplied reason; changing it forces a rotation.
pub static ENCRYPTION_EXTERNAL_REASON: Lazy<Option<String>> =
    Lazy::new(|| optional_env("ENCRYPTION_EXTERNAL_REASON"));

pub static ENCRYPTION_ROTATION_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| secs_env("ENCRYPTION_ROTATION_INTERVAL_SECS", 7 * DAY_SECS));

/// Unused keys retained beyond the ones still in use.
pub static ENCRYPTION_KEEP_KEYS: Lazy<usize> = Lazy::new(|| {
    std::env::var("ENCRYPTION_KEEP_KEYS")
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(10)
});

pub static ENCRYPTION_MIGRATION_RETRY_SECS: Lazy<u64> =
    Lazy::new(|| secs_env("ENCRYPTION_MIGRATION_RETRY_SECS", 5 * 60));

pub static ENCRYPTION_RESYNC_SECS: Lazy<u64> = Lazy::new(|| secs_env("ENCRYPTION_RESYNC_SECS", 60));

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn secs_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(default)
}

/// Parses `secrets,routes.route.openshift.io`; blanks and malformed entries
/// are dropped.
pub fn parse_resources(value: &str) -> Vec<GroupResource> {
    let mut resources: Vec<GroupResource> = value.split(',').filter_map(GroupResource::parse).collect();
    resources.sort();
    resources.dedup();
    resources
}

/// key: encryption-controller-config
/// Tunables shared by the controllers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionControllerConfig {
    pub component: String,
    pub resources: Vec<GroupResource>,
    pub rotation_interval: chrono::Duration,
    pub keep_number_of_keys: usize,
    pub migration_retry_window: chrono::Duration,
    pub resync_interval: Duration,
    /// Requeue delay while the deployer has not converged.
    pub not_ready_requeue: Duration,
}

impl Default for EncryptionControllerConfig {
    fn default() -> Self {
        Self {
            component: "kube-apiserver".to_string(),
            resources: vec![GroupResource::core("configmaps"), GroupResource::core("secrets")],
            rotation_interval: chrono::Duration::days(7),
            keep_number_of_keys: 10,
            migration_retry_window: chrono::Duration::minutes(5),
            resync_interval: Duration::from_secs(60),
            not_ready_requeue: Duration::from_secs(120),
        }
    }
}

impl EncryptionControllerConfig {
    pub fn for_component(component: impl Into<String>, resources: Vec<GroupResource>) -> Self {
        let mut resources = resources;
        resources.sort();
        resources.dedup();
        Self {
            component: component.into(),
            resources,
            ..Self::default()
        }
    }

    pub fn from_env() -> EncryptionResult<Self> {
        let mut config = Self::for_component(ENCRYPTION_COMPONENT.clone(), ENCRYPTION_RESOURCES.clone());
        config.rotation_interval =
            chrono::Duration::seconds(secs_i64(*ENCRYPTION_ROTATION_INTERVAL_SECS)?);
        config.keep_number_of_keys = *ENCRYPTION_KEEP_KEYS;
        config.migration_retry_window =
            chrono::Duration::seconds(secs_i64(*ENCRYPTION_MIGRATION_RETRY_SECS)?);
        config.resync_interval = Duration::from_secs(*ENCRYPTION_RESYNC_SECS);
        Ok(config)
    }
}

fn secs_i64(secs: u64) -> EncryptionResult<i64> {
    i64::try_from(secs).map_err(|_| EncryptionError::InvalidConfig(format!("{secs}s is out of range")))
}

/// Initial operator intent from `ENCRYPTION_MODE` and `ENCRYPTION_EXTERNAL_REASON`.
pub fn settings_from_env() -> EncryptionResult<EncryptionSettings> {
    let mode = match ENCRYPTION_MODE.as_deref() {
        None => KeyMode::AesCbc,
        Some(raw) => KeyMode::from_str(raw)
            .ok_or_else(|| EncryptionError::InvalidConfig(format!("unknown encryption mode {raw}")))?,
    };
    Ok(EncryptionSettings {
        mode,
        external_reason: ENCRYPTION_EXTERNAL_REASON.clone(),
    })
}
