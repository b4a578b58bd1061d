//! 统一的密钥生命周期管理器
use crate::common::clock::Clock;
use crate::error::{Error, Result};
use crate::root::RootKeyring;
use crate::rotation::status::{ClaimedRotation, RotationStatusTracker, next_due};
use crate::rotation::{RotationPolicy, RotationTrigger, secs};
use crate::storage::{KmsKey, KmsKeyPatch, KmsKeyVersion, KmsStore, RotationStatus, StoreError};
use crate::symmetric::{AesGcmSystem, SymmetricCryptographicSystem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 创建 KMS 密钥的参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateKeyRequest {
    /// 为空时自动生成
    pub slug: Option<String>,
    #[serde(default)]
    pub is_reserved: bool,
    pub rotation_interval_seconds: Option<u64>,
    #[serde(default)]
    pub auto_rotation_enabled: bool,
}

/// 一次轮换任务的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationOutcome {
    pub job_id: Uuid,
    pub key_id: Uuid,
    pub trigger: RotationTrigger,
    /// 新产生的版本号
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub next_rotation_at: Option<DateTime<Utc>>,
}

/// `KeyManager` 负责密钥的创建、版本追加、手动轮换与自动轮换配置。
///
/// 它和调度器是唯一会写入新版本的组件，二者都通过 `RotationStatusTracker`
/// 认领和记录结果，因此手动轮换与自动轮换互斥。
#[derive(Clone)]
pub struct KeyManager {
    store: Arc<dyn KmsStore>,
    root: Arc<RootKeyring>,
    clock: Arc<dyn Clock>,
    tracker: RotationStatusTracker,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn KmsStore>,
        root: Arc<RootKeyring>,
        clock: Arc<dyn Clock>,
        policy: RotationPolicy,
    ) -> Self {
        let tracker = RotationStatusTracker::new(store.clone(), root.clone(), clock.clone(), policy);
        Self {
            store,
            root,
            clock,
            tracker,
        }
    }

    pub fn tracker(&self) -> &RotationStatusTracker {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn KmsStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 创建密钥及其版本 1
    pub async fn create_key(&self, scope_id: Uuid, request: CreateKeyRequest) -> Result<KmsKey> {
        validate_rotation_config(request.rotation_interval_seconds, request.auto_rotation_enabled)?;

        let id = Uuid::new_v4();
        let slug = match request.slug {
            Some(slug) => {
                let slug = slug.trim().to_string();
                if slug.is_empty() {
                    return Err(Error::InvalidRequest("slug must not be empty".to_string()));
                }
                slug
            }
            None => {
                let simple = id.simple().to_string();
                format!("kms-{}", &simple[..8])
            }
        };

        let now = self.clock.now();
        let first = self.new_version_row(id, 1, now)?;
        let key = KmsKey {
            id,
            scope_id,
            slug,
            is_reserved: request.is_reserved,
            rotation_interval_seconds: request.rotation_interval_seconds,
            auto_rotation_enabled: request.auto_rotation_enabled,
            next_rotation_at: None,
            last_rotation_status: RotationStatus::None,
            last_rotation_attempted_at: None,
            last_rotation_job_id: None,
            encrypted_last_rotation_error: None,
            last_rotation_was_manual: false,
            consecutive_rotation_failures: 0,
            rotated_at: None,
            created_at: now,
            updated_at: now,
        };
        let key = KmsKey {
            next_rotation_at: next_due(&key, now),
            ..key
        };

        let key = self.store.create_key(key, first).await.map_err(|e| match e {
            StoreError::UniqueViolation { detail, .. } => Error::InvalidRequest(detail),
            other => other.into(),
        })?;
        tracing::info!(
            key_id = %key.id,
            scope_id = %scope_id,
            slug = %key.slug,
            auto_rotation = key.auto_rotation_enabled,
            "created KMS key"
        );
        Ok(key)
    }

    pub async fn key(&self, key_id: Uuid) -> Result<KmsKey> {
        self.store
            .find_key(key_id)
            .await?
            .ok_or(Error::KeyNotFound(key_id))
    }

    pub async fn key_by_slug(&self, scope_id: Uuid, slug: &str) -> Result<Option<KmsKey>> {
        Ok(self.store.find_key_by_slug(scope_id, slug).await?)
    }

    pub async fn current_version(&self, key_id: Uuid) -> Result<KmsKeyVersion> {
        match self.store.find_latest_version(key_id).await? {
            Some(v) => Ok(v),
            None => {
                self.key(key_id).await?;
                Err(Error::KeyVersionNotFound { key_id, version: 1 })
            }
        }
    }

    pub async fn version(&self, key_id: Uuid, version: u32) -> Result<KmsKeyVersion> {
        match self.store.find_version(key_id, version).await? {
            Some(v) => Ok(v),
            None => {
                self.key(key_id).await?;
                Err(Error::KeyVersionNotFound { key_id, version })
            }
        }
    }

    pub async fn list_versions(&self, key_id: Uuid) -> Result<Vec<KmsKeyVersion>> {
        self.key(key_id).await?;
        Ok(self.store.list_versions(key_id).await?)
    }

    /// 追加下一个版本。并发追加时输掉唯一约束竞争的一方返回 `VersionConflict`。
    pub async fn append_version(&self, key_id: Uuid) -> Result<KmsKeyVersion> {
        let current = self.current_version(key_id).await?;
        let next = current.version.checked_add(1).ok_or_else(|| {
            Error::InvalidRequest(format!("KMS key {} has exhausted its version space", key_id))
        })?;

        let row = self.new_version_row(key_id, next, self.clock.now())?;
        match self.store.insert_version(row.clone()).await {
            Ok(()) => {
                tracing::info!(key_id = %key_id, version = next, "appended KMS key version");
                Ok(row)
            }
            Err(StoreError::UniqueViolation { .. }) => {
                tracing::warn!(key_id = %key_id, version = next, "lost concurrent version append");
                Err(Error::VersionConflict {
                    key_id,
                    version: next,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn new_version_row(
        &self,
        key_id: Uuid,
        version: u32,
        now: DateTime<Utc>,
    ) -> Result<KmsKeyVersion> {
        let material = AesGcmSystem::generate_key()?;
        let encrypted_key_material =
            self.root
                .seal_key_material(key_id, version, material.as_bytes())?;
        Ok(KmsKeyVersion {
            id: Uuid::new_v4(),
            kms_key_id: key_id,
            version,
            encrypted_key_material,
            created_at: now,
        })
    }

    /// 立即轮换。与调度器共享同一认领，轮换进行中时返回 `RotationAlreadyInProgress`。
    pub async fn rotate_manually(&self, key_id: Uuid) -> Result<RotationOutcome> {
        self.key(key_id).await?;
        let claimed = self
            .tracker
            .claim(key_id, RotationTrigger::Manual)
            .await?
            .ok_or(Error::RotationAlreadyInProgress(key_id))?;
        self.execute(claimed).await
    }

    /// 在已认领的前提下执行轮换并记录结果
    pub async fn execute(&self, claimed: ClaimedRotation) -> Result<RotationOutcome> {
        let key_id = claimed.key.id;
        match self.append_version(key_id).await {
            Ok(row) => {
                let finished_at = self.clock.now();
                let next_rotation_at = self
                    .record_success_or_retry(&claimed, row.version, finished_at)
                    .await?;
                tracing::info!(
                    key_id = %key_id,
                    job_id = %claimed.job_id,
                    version = row.version,
                    trigger = %claimed.trigger,
                    "KMS key rotated"
                );
                Ok(RotationOutcome {
                    job_id: claimed.job_id,
                    key_id,
                    trigger: claimed.trigger,
                    version: row.version,
                    started_at: claimed.started_at,
                    finished_at,
                    next_rotation_at,
                })
            }
            Err(err) => {
                let reason = err.to_string();
                if let Err(record_err) = self.tracker.record_failure(&claimed, &reason).await {
                    tracing::error!(
                        key_id = %key_id,
                        job_id = %claimed.job_id,
                        error = %record_err,
                        "failed to record rotation failure"
                    );
                }
                Err(Error::RotationFailed { key_id, reason })
            }
        }
    }

    /// 新版本已经写入，状态写入失败时重试一次。
    ///
    /// 仍然失败则返回 `RotationFailed`，密钥保持 `in_progress` 直到放弃超时后被接管。
    async fn record_success_or_retry(
        &self,
        claimed: &ClaimedRotation,
        version: u32,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let key_id = claimed.key.id;
        match self.tracker.record_success(claimed, finished_at).await {
            Ok(next) => return Ok(next),
            Err(e) if e.is_expected_contention() => return Err(e),
            Err(e) => tracing::warn!(
                key_id = %key_id,
                job_id = %claimed.job_id,
                version,
                error = %e,
                "failed to record rotation success, retrying"
            ),
        }

        match self.tracker.record_success(claimed, finished_at).await {
            Ok(next) => Ok(next),
            Err(e) if e.is_expected_contention() => Err(e),
            Err(e) => {
                tracing::error!(
                    key_id = %key_id,
                    job_id = %claimed.job_id,
                    version,
                    error = %e,
                    "version created but rotation status could not be recorded"
                );
                Err(Error::RotationFailed {
                    key_id,
                    reason: format!(
                        "version {} was created but its status could not be recorded: {}",
                        version, e
                    ),
                })
            }
        }
    }

    /// 配置自动轮换。开启时要求间隔大于零；`next_rotation_at` 随之设置或清除。
    pub async fn configure_auto_rotation(
        &self,
        key_id: Uuid,
        rotation_interval_seconds: Option<u64>,
        enabled: bool,
    ) -> Result<KmsKey> {
        validate_rotation_config(rotation_interval_seconds, enabled)?;
        let next_rotation_at = match (enabled, rotation_interval_seconds) {
            (true, Some(interval)) => Some(self.clock.now() + secs(interval)),
            _ => None,
        };
        let patch = KmsKeyPatch {
            rotation_interval_seconds: Some(rotation_interval_seconds),
            auto_rotation_enabled: Some(enabled),
            next_rotation_at: Some(next_rotation_at),
            ..Default::default()
        };
        let key = self
            .store
            .update_key(key_id, patch)
            .await?
            .ok_or(Error::KeyNotFound(key_id))?;
        tracing::info!(
            key_id = %key_id,
            enabled,
            interval_secs = ?rotation_interval_seconds,
            "updated KMS key auto-rotation"
        );
        Ok(key)
    }
}

fn validate_rotation_config(interval: Option<u64>, enabled: bool) -> Result<()> {
    match (interval, enabled) {
        (Some(0), _) => Err(Error::InvalidRequest(
            "rotation interval must be greater than zero".to_string(),
        )),
        (None, true) => Err(Error::InvalidRequest(
            "auto-rotation requires a rotation interval".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::storage::MemoryKmsStore;
    use chrono::Duration;

    fn manager() -> (KeyManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let root = RootKeyring::from_root_key(AesGcmSystem::generate_key().unwrap()).unwrap();
        let manager = KeyManager::new(
            Arc::new(MemoryKmsStore::new()),
            Arc::new(root),
            clock.clone(),
            RotationPolicy::default(),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn test_create_key_starts_at_version_one() {
        let (manager, clock) = manager();
        let key = manager
            .create_key(
                Uuid::new_v4(),
                CreateKeyRequest {
                    rotation_interval_seconds: Some(3600),
                    auto_rotation_enabled: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(key.slug.starts_with("kms-"));
        assert_eq!(key.next_rotation_at, Some(clock.now() + Duration::hours(1)));
        assert_eq!(manager.current_version(key.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_enabling_auto_rotation_requires_interval() {
        let (manager, _) = manager();
        let request = CreateKeyRequest {
            auto_rotation_enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            manager.create_key(Uuid::new_v4(), request).await,
            Err(Error::InvalidRequest(_))
        ));

        let key = manager
            .create_key(Uuid::new_v4(), CreateKeyRequest::default())
            .await
            .unwrap();
        assert!(key.next_rotation_at.is_none());
        assert!(matches!(
            manager.configure_auto_rotation(key.id, Some(0), true).await,
            Err(Error::InvalidRequest(_))
        ));

        let key = manager
            .configure_auto_rotation(key.id, Some(60), true)
            .await
            .unwrap();
        assert!(key.auto_rotation_enabled && key.next_rotation_at.is_some());

        let key = manager
            .configure_auto_rotation(key.id, Some(60), false)
            .await
            .unwrap();
        assert!(!key.auto_rotation_enabled && key.next_rotation_at.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_slug_is_rejected() {
        let (manager, _) = manager();
        let scope = Uuid::new_v4();
        let request = CreateKeyRequest {
            slug: Some("payments".to_string()),
            ..Default::default()
        };
        manager.create_key(scope, request.clone()).await.unwrap();
        assert!(matches!(
            manager.create_key(scope, request).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_rotation_records_success() {
        let (manager, clock) = manager();
        let key = manager
            .create_key(
                Uuid::new_v4(),
                CreateKeyRequest {
                    rotation_interval_seconds: Some(600),
                    auto_rotation_enabled: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::seconds(30));
        let outcome = manager.rotate_manually(key.id).await.unwrap();
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.trigger, RotationTrigger::Manual);
        assert_eq!(
            outcome.next_rotation_at,
            Some(clock.now() + Duration::seconds(600))
        );

        let report = manager.tracker().report(key.id, true).await.unwrap();
        assert_eq!(report.status, RotationStatus::Success);
        assert!(report.is_manual);
        assert_eq!(report.job_id, Some(outcome.job_id));
        assert_eq!(report.last_success_at, Some(outcome.finished_at));
        assert_eq!(report.last_error, None);

        let outcome = manager.rotate_manually(key.id).await.unwrap();
        assert_eq!(outcome.version, 3);
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let (manager, _) = manager();
        let id = Uuid::new_v4();
        assert!(matches!(manager.rotate_manually(id).await, Err(Error::KeyNotFound(found)) if found == id));
        assert!(matches!(manager.append_version(id).await, Err(Error::KeyNotFound(_))));
        assert!(matches!(
            manager.configure_auto_rotation(id, None, false).await,
            Err(Error::KeyNotFound(_))
        ));
    }
}
