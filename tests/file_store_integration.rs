mod common;

use chrono::Duration;
use common::{start_kms, start_time, test_config};
use seal_kms::{
    Clock, CreateKeyRequest, Error, FileKmsStore, Kms, KmsStore, ManualClock, RotationStatus,
};
use secrecy::SecretString;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kms").join("state.json");
    let clock = Arc::new(ManualClock::new(start_time()));
    let scope = Uuid::new_v4();

    let (key_id, wrapped, data_key) = {
        let kms = start_kms(Arc::new(FileKmsStore::open(&path).unwrap()), clock.clone()).await;
        let key = kms
            .create_key(
                scope,
                CreateKeyRequest {
                    slug: Some("billing".to_string()),
                    rotation_interval_seconds: Some(60),
                    auto_rotation_enabled: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let wrapped = kms.encrypt(key.id, b"persisted").await.unwrap();
        clock.advance(Duration::seconds(61));
        assert_eq!(kms.scheduler().run_once().await.unwrap().rotated.len(), 1);
        let data_key = kms.data_keys().scope_data_key(scope).await.unwrap();
        (key.id, wrapped, data_key)
    };
    assert!(path.exists());

    let store = Arc::new(FileKmsStore::open(&path).unwrap());
    let kms = start_kms(store.clone(), clock.clone()).await;
    assert_eq!(&*kms.decrypt(&wrapped).await.unwrap(), b"persisted");
    assert_eq!(kms.get_current_version(key_id).await.unwrap().version, 2);
    assert!(kms.data_keys().scope_data_key(scope).await.unwrap().constant_time_eq(&data_key));

    let status = kms.get_rotation_status(key_id, false).await.unwrap();
    assert_eq!(status.status, RotationStatus::Success);
    assert_eq!(status.next_rotation_at, Some(clock.now() + Duration::seconds(60)));

    let by_slug = store.find_key_by_slug(scope, "billing").await.unwrap().unwrap();
    assert_eq!(by_slug.id, key_id);
    assert_eq!(store.list_versions(key_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_open_from_config_path() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.storage.path = Some(dir.path().join("state.json"));

    let kms = Kms::open(&config).await.unwrap();
    let key = kms
        .create_key(Uuid::new_v4(), CreateKeyRequest::default())
        .await
        .unwrap();
    let blob = kms.envelope().encrypt_to_blob(key.id, b"blob").await.unwrap();
    drop(kms);

    let reopened = Kms::open(&config).await.unwrap();
    assert_eq!(&*reopened.envelope().decrypt_blob(&blob).await.unwrap(), b"blob");

    // 换了运维密钥则无法打开已有的根密钥
    config.root.root_encryption_key = None;
    config.root.encryption_key = Some(SecretString::from("an-entirely-different-32-byte-k!"));
    assert!(matches!(Kms::open(&config).await, Err(Error::RootKey(_))));
}
