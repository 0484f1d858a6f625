mod common;

use common::{configmaps, key, now, secrets, Harness, COMPONENT};
use encryption_controller::controllers::{Controller, SyncOutcome};
use encryption_controller::keys::record::key_record_name;
use encryption_controller::keys::{EncryptionEventReason, KeyMode, KeyStore};

#[tokio::test]
async fn nothing_is_published_without_keys() -> anyhow::Result<()> {
    let harness = Harness::new(vec![secrets()]);
    assert_eq!(harness.state.sync().await?, SyncOutcome::Done);
    assert!(harness.published().await?.is_none());
    assert!(harness.events.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn unconverged_replicas_requeue_without_writing() -> anyhow::Result<()> {
    let harness = Harness::new(vec![secrets()]);
    harness.seed(&key(1, KeyMode::AesCbc, &[], None))?;
    harness.deployer.start_rollout(None);

    let outcome = harness.state.sync().await?;
    assert_eq!(outcome, SyncOutcome::Requeue(harness.config.not_ready_requeue));
    assert!(harness.published().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn publication_survives_write_conflicts() -> anyhow::Result<()> {
    let harness = Harness::new(vec![secrets(), configmaps()]);
    harness.seed(&key(1, KeyMode::AesCbc, &[], None))?;
    harness.store.inject_conflicts(3);

    harness.state.sync().await?;
    assert!(harness.published().await?.is_some());
    assert_eq!(
        harness.events.reasons().first(),
        Some(&EncryptionEventReason::EncryptionConfigCreated)
    );
    Ok(())
}

#[tokio::test]
async fn rotation_is_reported_as_events() -> anyhow::Result<()> {
    let harness = Harness::new(vec![secrets()]);
    let migrated_at = now() - chrono::Duration::days(1);
    harness.seed(&key(1, KeyMode::AesCbc, &[secrets()], Some(migrated_at)))?;
    harness.settle().await?;
    harness.seed(&key(2, KeyMode::AesCbc, &[], None))?;
    harness.settle().await?;

    let reasons = harness.events.reasons();
    assert!(reasons.contains(&EncryptionEventReason::EncryptionReadKeysChanged));
    assert!(reasons.contains(&EncryptionEventReason::EncryptionWriteKeyRotated));
    let rotated = harness
        .events
        .events()
        .into_iter()
        .find(|event| event.reason == EncryptionEventReason::EncryptionWriteKeyRotated)
        .expect("rotation event");
    assert_eq!(rotated.message, "Write key for core/secrets rotated from 1 to 2");
    Ok(())
}

#[tokio::test]
async fn deleted_records_never_drop_deployed_keys() -> anyhow::Result<()> {
    let harness = Harness::new(vec![secrets()]);
    harness.seed(&key(1, KeyMode::AesCbc, &[], None))?;
    harness.settle().await?;
    let events_before = harness.events.events().len();

    // deleting the only record leaves the deployed key unbacked
    let name = key_record_name(COMPONENT, 1);
    let mut record = harness.store.get_key(&name).await?.expect("key 1");
    record.finalizers.clear();
    harness.store.update_key(record).await?;
    harness.store.delete_key(&name).await?;

    harness.state.sync().await?;
    assert_eq!(
        harness.published_providers(&secrets()).await?,
        vec![
            (KeyMode::AesCbc, "1".to_string()),
            (KeyMode::Identity, String::new())
        ]
    );
    assert_eq!(harness.events.events().len(), events_before);
    Ok(())
}

#[tokio::test]
async fn missing_config_is_recreated_with_every_needed_key() -> anyhow::Result<()> {
    let harness = Harness::new(vec![secrets()]);
    let migrated_at = now() - chrono::Duration::days(1);
    harness.seed(&key(1, KeyMode::AesCbc, &[secrets()], Some(migrated_at)))?;
    harness.seed(&key(2, KeyMode::AesCbc, &[], None))?;

    harness.state.sync().await?;
    assert_eq!(
        harness.published_providers(&secrets()).await?,
        vec![
            (KeyMode::Identity, String::new()),
            (KeyMode::AesCbc, "2".to_string()),
            (KeyMode::AesCbc, "1".to_string())
        ]
    );

    harness.settle().await?;
    assert_eq!(
        harness.published_providers(&secrets()).await?,
        vec![
            (KeyMode::AesCbc, "2".to_string()),
            (KeyMode::AesCbc, "1".to_string()),
            (KeyMode::Identity, String::new())
        ]
    );
    Ok(())
}

#[tokio::test]
async fn changes_are_reported_against_the_deployed_config() -> anyhow::Result<()> {
    let harness = Harness::new(vec![secrets()]);
    let migrated_at = now() - chrono::Duration::days(1);
    harness.seed(&key(1, KeyMode::AesCbc, &[secrets()], Some(migrated_at)))?;
    harness.settle().await?;

    // key 2 is published but never rolled out before key 3 arrives
    harness.seed(&key(2, KeyMode::AesCbc, &[], None))?;
    harness.state.sync().await?;
    harness.seed(&key(3, KeyMode::AesCbc, &[], None))?;
    harness.state.sync().await?;

    let read_changes: Vec<String> = harness
        .events
        .events()
        .into_iter()
        .filter(|event| event.reason == EncryptionEventReason::EncryptionReadKeysChanged)
        .map(|event| event.message)
        .collect();
    assert_eq!(
        read_changes.last().map(String::as_str),
        Some("Read keys for core/secrets changed from [\"1\"] to [\"3\", \"1\"]")
    );
    Ok(())
}
