//! Pure computation of current and desired encryption state.

use tracing::warn;

use crate::deployer::DeployerRevision;
use crate::error::EncryptionResult;
use crate::keys::record::{from_stored_key, key_id_from_name};
use crate::keys::{EncryptionState, GroupResource, GroupResourceState, KeyMode, KeyState, StoredKey};

use super::config::{from_encryption_state, sort_recent_first, to_encryption_state, EncryptionConfig};

/// What the deployer reported: its revision and, when converged, the config
/// deployed at that revision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployerObservation {
    pub revision: DeployerRevision,
    pub config: Option<EncryptionConfig>,
}

/// key: encryption-assembly
/// Result of one assembly pass. Controllers recompute it on every sync and
/// never mutate it in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assembly {
    pub current_config: Option<EncryptionConfig>,
    pub current_state: EncryptionState,
    pub desired_state: EncryptionState,
    /// Valid key records, most recent first.
    pub keys: Vec<KeyState>,
    /// Highest id encoded in any record name, valid payload or not.
    pub highest_record_id: u64,
    pub found_any_keys: bool,
    pub not_ready_reason: Option<String>,
}

impl Assembly {
    pub fn is_ready(&self) -> bool {
        self.not_ready_reason.is_none()
    }

    pub fn desired_config(&self) -> EncryptionConfig {
        from_encryption_state(&self.desired_state)
    }

    pub fn latest_key(&self) -> Option<&KeyState> {
        self.keys.first()
    }
}

/// Parses the component's key records, skipping any that are malformed.
pub fn parse_key_records(component: &str, records: &[StoredKey]) -> Vec<KeyState> {
    let mut keys: Vec<KeyState> = records
        .iter()
        .filter_map(|record| match from_stored_key(component, record) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(name = %record.name, %err, "skipping invalid key record");
                None
            }
        })
        .collect();
    sort_recent_first(&mut keys);
    keys
}

pub fn assemble(
    component: &str,
    records: &[StoredKey],
    observation: &DeployerObservation,
    resources: &[GroupResource],
) -> EncryptionResult<Assembly> {
    let keys = parse_key_records(component, records);
    let found_any_keys = !keys.is_empty();
    let highest_record_id = records
        .iter()
        .filter_map(|record| key_id_from_name(component, &record.name))
        .max()
        .unwrap_or(0);

    let not_ready_reason = match &observation.revision.revision {
        None => Some("no deployed revision observed yet".to_string()),
        Some(revision) if !observation.revision.converged => Some(format!(
            "revision {revision} has not converged on all replicas"
        )),
        Some(_) => None,
    };
    if not_ready_reason.is_some() {
        return Ok(Assembly {
            keys,
            highest_record_id,
            found_any_keys,
            not_ready_reason,
            ..Assembly::default()
        });
    }

    let current_state = match &observation.config {
        Some(config) => to_encryption_state(config, &keys)?,
        None => EncryptionState::new(),
    };
    let desired_state = desired_state(&current_state, &keys, resources);

    Ok(Assembly {
        current_config: observation.config.clone(),
        current_state,
        desired_state,
        keys,
        highest_record_id,
        found_any_keys,
        not_ready_reason: None,
    })
}

/// Stages the latest key everywhere, promotes it where every replica can
/// already decrypt with it, and trims read keys no stored data needs.
pub fn desired_state(
    current: &EncryptionState,
    keys: &[KeyState],
    resources: &[GroupResource],
) -> EncryptionState {
    let mut desired = current.clone();
    let recovered = recovery_read_keys(keys, resources);
    for resource in resources {
        let state = desired.entry(resource.clone()).or_default();
        if state.write_key.is_none() && state.read_keys.is_empty() {
            state.read_keys = recovered.clone();
        }
    }

    let Some(latest) = keys.first() else {
        return desired;
    };

    for (resource, state) in desired.iter_mut() {
        if !state.has_read_key(latest) {
            state.read_keys.push(latest.clone());
            sort_recent_first(&mut state.read_keys);
        }

        let deployed_can_decrypt = current
            .get(resource)
            .map(|deployed| deployed.has_read_key(latest))
            .unwrap_or(false);
        if latest.mode == KeyMode::Identity || deployed_can_decrypt {
            state.write_key = Some(latest.clone());
        } else if state.write_key.is_none() {
            state.write_key = state
                .read_keys
                .iter()
                .find(|key| key.mode == KeyMode::Identity && key.backed)
                .cloned();
        }

        trim_read_keys(resource, state);
    }

    desired
}

/// Read keys for a kind with nothing deployed: every backed key, most recent
/// first, down to the first one migrated for all `resources`, plus one more
/// for backup.
fn recovery_read_keys(keys: &[KeyState], resources: &[GroupResource]) -> Vec<KeyState> {
    let mut backed: Vec<KeyState> = keys.iter().filter(|key| key.backed).cloned().collect();
    sort_recent_first(&mut backed);
    if let Some(migrated) = backed.iter().position(|key| key.migrated_for_all(resources)) {
        backed.truncate((migrated + 2).min(backed.len()));
    }
    backed
}

/// Keeps read keys down to the newest one already migrated for `resource`
/// (never above the write key), plus one more for backup. Kinds without a
/// write key keep everything.
fn trim_read_keys(resource: &GroupResource, state: &mut GroupResourceState) {
    let Some(write) = state
        .write_key
        .as_ref()
        .and_then(|write| state.read_keys.iter().position(|key| key.same_key(write)))
    else {
        return;
    };
    let Some(migrated) = state
        .read_keys
        .iter()
        .position(|key| key.migrated_for(resource))
    else {
        return;
    };
    let keep = (migrated.max(write) + 2).min(state.read_keys.len());
    state.read_keys.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::record::to_stored_key;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    const COMPONENT: &str = "kms";

    fn secrets() -> GroupResource {
        GroupResource::core("secrets")
    }

    fn configmaps() -> GroupResource {
        GroupResource::core("configmaps")
    }

    fn key(id: u64, mode: KeyMode, migrated: &[GroupResource]) -> KeyState {
        let mut key = KeyState::new(id, mode, vec![id as u8; mode.key_len()]);
        key.migrated.resources = migrated.iter().cloned().collect();
        if !migrated.is_empty() {
            key.migrated.timestamp = Some(Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap());
        }
        key.backed = true;
        key
    }

    fn records(keys: &[KeyState]) -> Vec<StoredKey> {
        keys.iter()
            .map(|key| to_stored_key(COMPONENT, key).expect("valid record"))
            .collect()
    }

    fn converged(config: Option<EncryptionConfig>) -> DeployerObservation {
        DeployerObservation {
            revision: DeployerRevision {
                revision: Some("1".to_string()),
                converged: true,
            },
            config,
        }
    }

    fn deployed(state: &EncryptionState) -> DeployerObservation {
        converged(Some(from_encryption_state(state)))
    }

    fn ids(keys: &[KeyState]) -> Vec<&str> {
        keys.iter().map(|key| key.key_id.as_str()).collect()
    }

    #[test]
    fn unconverged_deployer_is_not_ready() -> anyhow::Result<()> {
        let observation = DeployerObservation {
            revision: DeployerRevision {
                revision: Some("3".to_string()),
                converged: false,
            },
            config: None,
        };
        let assembly = assemble(COMPONENT, &[], &observation, &[secrets()])?;
        assert!(!assembly.is_ready());
        assert!(assembly
            .not_ready_reason
            .as_deref()
            .unwrap_or_default()
            .contains("revision 3"));

        let missing = assemble(COMPONENT, &[], &DeployerObservation::default(), &[secrets()])?;
        assert!(!missing.is_ready());
        Ok(())
    }

    #[test]
    fn no_keys_yields_identity_only_config() -> anyhow::Result<()> {
        let assembly = assemble(COMPONENT, &[], &converged(None), &[secrets(), configmaps()])?;
        assert!(assembly.is_ready());
        assert!(!assembly.found_any_keys);
        let config = assembly.desired_config();
        assert_eq!(config.resources.len(), 2);
        for resource in &config.resources {
            assert_eq!(resource.providers.len(), 1);
            assert_eq!(resource.providers[0].mode, KeyMode::Identity);
        }
        Ok(())
    }

    #[test]
    fn first_key_is_staged_before_promotion() -> anyhow::Result<()> {
        let first = key(1, KeyMode::AesCbc, &[]);
        let assembly = assemble(COMPONENT, &records(&[first.clone()]), &converged(None), &[secrets()])?;

        let staged = &assembly.desired_state[&secrets()];
        assert_eq!(staged.write_key, None);
        assert_eq!(ids(&staged.read_keys), vec!["1"]);

        // once every replica runs a config that can read key 1, it is promoted
        let rolled = assemble(
            COMPONENT,
            &records(&[first]),
            &deployed(&assembly.desired_state),
            &[secrets()],
        )?;
        let promoted = &rolled.desired_state[&secrets()];
        assert_eq!(promoted.write_key.as_ref().map(|k| k.key_id.as_str()), Some("1"));
        Ok(())
    }

    #[test]
    fn rotation_keeps_old_write_key_until_new_key_is_readable() -> anyhow::Result<()> {
        let old = key(1, KeyMode::AesCbc, &[secrets()]);
        let new = key(2, KeyMode::AesCbc, &[]);
        let mut current = EncryptionState::new();
        current.insert(
            secrets(),
            GroupResourceState {
                write_key: Some(old.clone()),
                read_keys: vec![old.clone()],
            },
        );

        let assembly = assemble(
            COMPONENT,
            &records(&[old.clone(), new.clone()]),
            &deployed(&current),
            &[secrets()],
        )?;
        let grs = &assembly.desired_state[&secrets()];
        assert_eq!(grs.write_key.as_ref().map(|k| k.key_id.as_str()), Some("1"));
        assert_eq!(ids(&grs.read_keys), vec!["2", "1"]);

        let providers = &assembly.desired_config().resources[0].providers;
        let order: Vec<&str> = providers.iter().map(|p| p.key_id.as_str()).collect();
        assert_eq!(order, vec!["1", "2", ""]);
        Ok(())
    }

    #[test]
    fn identity_key_takes_effect_immediately() -> anyhow::Result<()> {
        let aes = key(2, KeyMode::AesCbc, &[secrets()]);
        let off = key(3, KeyMode::Identity, &[]);
        let mut current = EncryptionState::new();
        current.insert(
            secrets(),
            GroupResourceState {
                write_key: Some(aes.clone()),
                read_keys: vec![aes.clone()],
            },
        );

        let assembly = assemble(
            COMPONENT,
            &records(&[aes, off]),
            &deployed(&current),
            &[secrets()],
        )?;
        let grs = &assembly.desired_state[&secrets()];
        assert_eq!(grs.write_key.as_ref().map(|k| k.mode), Some(KeyMode::Identity));
        assert_eq!(ids(&grs.read_keys), vec!["3", "2"]);
        Ok(())
    }

    #[test]
    fn live_identity_key_outranks_staged_aes_key() -> anyhow::Result<()> {
        let off = key(3, KeyMode::Identity, &[secrets()]);
        let next = key(4, KeyMode::AesCbc, &[]);
        let mut current = EncryptionState::new();
        current.insert(
            secrets(),
            GroupResourceState {
                write_key: Some(off.clone()),
                read_keys: vec![off.clone()],
            },
        );

        let assembly = assemble(
            COMPONENT,
            &records(&[off, next]),
            &deployed(&current),
            &[secrets()],
        )?;
        let grs = &assembly.desired_state[&secrets()];
        assert_eq!(grs.write_key.as_ref().map(|k| k.key_id.as_str()), Some("3"));
        assert_eq!(ids(&grs.read_keys), vec!["4", "3"]);
        Ok(())
    }

    #[test]
    fn migrated_write_key_keeps_one_backup_read_key() -> anyhow::Result<()> {
        let oldest = key(1, KeyMode::AesCbc, &[secrets()]);
        let middle = key(2, KeyMode::AesCbc, &[secrets()]);
        let newest = key(3, KeyMode::AesCbc, &[secrets()]);
        let mut current = EncryptionState::new();
        current.insert(
            secrets(),
            GroupResourceState {
                write_key: Some(newest.clone()),
                read_keys: vec![newest.clone(), middle.clone(), oldest.clone()],
            },
        );

        let assembly = assemble(
            COMPONENT,
            &records(&[oldest, middle, newest]),
            &deployed(&current),
            &[secrets()],
        )?;
        assert_eq!(ids(&assembly.desired_state[&secrets()].read_keys), vec!["3", "2"]);

        let providers = &assembly.desired_config().resources[0].providers;
        let order: Vec<&str> = providers.iter().map(|p| p.key_id.as_str()).collect();
        assert_eq!(order, vec!["3", "2", ""]);
        assert_eq!(providers[2].mode, KeyMode::Identity);
        Ok(())
    }

    #[test]
    fn unmigrated_write_key_keeps_last_migrated_key_and_its_backup() -> anyhow::Result<()> {
        let keys: Vec<KeyState> = (1..=3)
            .map(|id| key(id, KeyMode::AesCbc, &[secrets()]))
            .chain(std::iter::once(key(4, KeyMode::AesCbc, &[])))
            .collect();
        let mut current = EncryptionState::new();
        let mut read_keys = keys.clone();
        sort_recent_first(&mut read_keys);
        current.insert(
            secrets(),
            GroupResourceState {
                write_key: Some(keys[3].clone()),
                read_keys,
            },
        );

        let assembly = assemble(COMPONENT, &records(&keys), &deployed(&current), &[secrets()])?;
        assert_eq!(
            ids(&assembly.desired_state[&secrets()].read_keys),
            vec!["4", "3", "2"]
        );
        Ok(())
    }

    #[test]
    fn missing_config_recovers_every_key_down_to_the_migrated_one() -> anyhow::Result<()> {
        let both = [configmaps(), secrets()];
        let keys = vec![
            key(5, KeyMode::AesCbc, &[]),
            key(4, KeyMode::AesCbc, &[configmaps()]),
            key(3, KeyMode::AesCbc, &both),
            key(2, KeyMode::AesCbc, &[]),
            key(1, KeyMode::AesCbc, &both),
        ];

        let assembly = assemble(COMPONENT, &records(&keys), &converged(None), &both)?;
        for resource in &both {
            let grs = &assembly.desired_state[resource];
            assert_eq!(grs.write_key, None);
            assert_eq!(ids(&grs.read_keys), vec!["5", "4", "3", "2"]);
        }
        for resource in &assembly.desired_config().resources {
            let order: Vec<&str> = resource.providers.iter().map(|p| p.key_id.as_str()).collect();
            assert_eq!(order, vec!["", "5", "4", "3", "2"]);
            assert_eq!(resource.providers[0].mode, KeyMode::Identity);
        }
        Ok(())
    }

    #[test]
    fn missing_config_keeps_the_key_data_is_encrypted_with() -> anyhow::Result<()> {
        let migrated = key(1, KeyMode::AesCbc, &[secrets()]);
        let fresh = key(2, KeyMode::AesCbc, &[]);

        let assembly = assemble(
            COMPONENT,
            &records(&[migrated, fresh]),
            &converged(None),
            &[secrets()],
        )?;
        assert_eq!(ids(&assembly.desired_state[&secrets()].read_keys), vec!["2", "1"]);

        // promotion after the rollout still keeps key 1 readable
        let rolled = assemble(
            COMPONENT,
            &records(&[key(1, KeyMode::AesCbc, &[secrets()]), key(2, KeyMode::AesCbc, &[])]),
            &deployed(&assembly.desired_state),
            &[secrets()],
        )?;
        let grs = &rolled.desired_state[&secrets()];
        assert_eq!(grs.write_key.as_ref().map(|k| k.key_id.as_str()), Some("2"));
        assert_eq!(ids(&grs.read_keys), vec!["2", "1"]);
        Ok(())
    }

    #[test]
    fn kind_added_to_existing_config_is_only_staged() -> anyhow::Result<()> {
        let write = key(1, KeyMode::AesCbc, &[]);
        let mut current = EncryptionState::new();
        current.insert(
            configmaps(),
            GroupResourceState {
                write_key: Some(write.clone()),
                read_keys: vec![write.clone()],
            },
        );

        let assembly = assemble(
            COMPONENT,
            &records(&[write]),
            &deployed(&current),
            &[configmaps(), secrets()],
        )?;
        let added = &assembly.desired_state[&secrets()];
        assert_eq!(added.write_key, None);
        assert_eq!(ids(&added.read_keys), vec!["1"]);
        Ok(())
    }

    #[test]
    fn malformed_records_are_skipped() -> anyhow::Result<()> {
        let mut stored = records(&[key(1, KeyMode::AesCbc, &[])]);
        let mut broken = stored[0].clone();
        broken.name = "encryption-key-kms-two".to_string();
        stored.push(broken);

        let assembly = assemble(COMPONENT, &stored, &converged(None), &[secrets()])?;
        assert_eq!(ids(&assembly.keys), vec!["1"]);
        Ok(())
    }

    #[test]
    fn kinds_in_deployed_config_are_kept() -> anyhow::Result<()> {
        let write = key(1, KeyMode::AesCbc, &[configmaps()]);
        let mut current = EncryptionState::new();
        current.insert(
            configmaps(),
            GroupResourceState {
                write_key: Some(write.clone()),
                read_keys: vec![write.clone()],
            },
        );

        let assembly = assemble(COMPONENT, &records(&[write]), &deployed(&current), &[secrets()])?;
        assert!(assembly.desired_state.contains_key(&configmaps()));
        assert!(assembly.desired_state.contains_key(&secrets()));
        Ok(())
    }

    fn arbitrary_keys() -> impl Strategy<Value = Vec<(u64, bool, bool)>> {
        prop::collection::vec((1u64..20, any::<bool>(), any::<bool>()), 0..6)
    }

    proptest! {
        #[test]
        fn assembly_is_deterministic_and_keeps_write_key_readable(
            raw in arbitrary_keys(),
            deploy_first in any::<bool>(),
        ) {
            let mut keys: Vec<KeyState> = Vec::new();
            for (id, identity, migrated) in raw {
                if keys.iter().any(|k| k.id() == Some(id)) {
                    continue;
                }
                let mode = if identity { KeyMode::Identity } else { KeyMode::AesCbc };
                let resources = if migrated { vec![secrets()] } else { Vec::new() };
                keys.push(key(id, mode, &resources));
            }
            let stored = records(&keys);
            let kinds = [secrets(), configmaps()];

            let mut observation = converged(None);
            if deploy_first {
                let first = assemble(COMPONENT, &stored, &observation, &kinds).expect("assemble");
                observation = deployed(&first.desired_state);
            }

            let once = assemble(COMPONENT, &stored, &observation, &kinds).expect("assemble");
            let twice = assemble(COMPONENT, &stored, &observation, &kinds).expect("assemble");
            prop_assert_eq!(&once, &twice);

            for state in once.desired_state.values() {
                if let Some(write) = &state.write_key {
                    prop_assert!(state.has_read_key(write));
                }
                let read_ids: Vec<u64> = state.read_keys.iter().filter_map(|k| k.id()).collect();
                let mut sorted = read_ids.clone();
                sorted.sort_unstable_by(|a, b| b.cmp(a));
                prop_assert_eq!(read_ids, sorted);
            }

            if let Some(latest) = once.latest_key() {
                if latest.mode == KeyMode::Identity {
                    for state in once.desired_state.values() {
                        prop_assert_eq!(
                            state.write_key.as_ref().map(|k| k.key_id.clone()),
                            Some(latest.key_id.clone())
                        );
                    }
                }
            }
        }
    }
}
