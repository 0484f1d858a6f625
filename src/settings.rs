//! Live operator intent. A ConfigMap named `encryption-settings-<component>`
//! overrides the environment defaults for the encryption mode and the external
//! rotation reason; edits reach the key controller without a restart.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::watcher;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::{EncryptionSettings, KeyMode};

pub const MODE_KEY: &str = "mode";
pub const EXTERNAL_REASON_KEY: &str = "external-reason";

pub fn settings_record_name(component: &str) -> String {
    format!("encryption-settings-{component}")
}

/// Settings from a settings record. Missing entries, or a missing record,
/// fall back to `defaults`.
pub fn settings_from_data(
    defaults: &EncryptionSettings,
    data: Option<&BTreeMap<String, String>>,
) -> EncryptionResult<EncryptionSettings> {
    let Some(data) = data else {
        return Ok(defaults.clone());
    };

    let mode = match data.get(MODE_KEY).map(|raw| raw.trim()).filter(|raw| !raw.is_empty()) {
        None => defaults.mode,
        Some(raw) => KeyMode::from_str(raw)
            .ok_or_else(|| EncryptionError::InvalidConfig(format!("unknown encryption mode {raw}")))?,
    };
    let external_reason = data
        .get(EXTERNAL_REASON_KEY)
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty())
        .or_else(|| defaults.external_reason.clone());

    Ok(EncryptionSettings {
        mode,
        external_reason,
    })
}

/// Replaces the current settings when `next` differs. Returns whether
/// receivers were notified.
pub fn publish_settings(sender: &watch::Sender<EncryptionSettings>, next: EncryptionSettings) -> bool {
    sender.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        info!(
            mode = %next.mode,
            external_reason = next.external_reason.as_deref().unwrap_or_default(),
            "encryption settings changed"
        );
        *current = next;
        true
    })
}

/// Watches the settings record and feeds `sender`. An unreadable record
/// leaves the current settings in place.
pub fn spawn(
    client: kube::Client,
    namespace: &str,
    component: &str,
    defaults: EncryptionSettings,
    sender: watch::Sender<EncryptionSettings>,
) {
    let config_maps: Api<ConfigMap> = Api::namespaced(client, namespace);
    let name = settings_record_name(component);
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

    tokio::spawn(async move {
        let mut stream = watcher(config_maps, config).boxed();
        while let Some(event) = stream.next().await {
            let data = match event {
                Ok(watcher::Event::Applied(config_map)) => config_map.data,
                Ok(watcher::Event::Deleted(_)) => None,
                Ok(watcher::Event::Restarted(config_maps)) => {
                    config_maps.into_iter().next().and_then(|config_map| config_map.data)
                }
                Err(err) => {
                    warn!(?err, %name, "settings watch failed, retrying");
                    continue;
                }
            };
            // a record without data still means "use the defaults"
            match settings_from_data(&defaults, Some(&data.unwrap_or_default())) {
                Ok(next) => {
                    publish_settings(&sender, next);
                }
                Err(err) => warn!(%err, %name, "ignoring invalid encryption settings"),
            }
        }
        debug!(%name, "settings watch stream ended");
    });
}
