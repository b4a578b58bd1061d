//!
//! 集成测试的通用辅助函数
//!
#![allow(dead_code)]

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose};
use chrono::{DateTime, Utc};
use seal_kms::storage::{
    ClaimOutcome, KmsKey, KmsKeyPatch, KmsKeyVersion, RootConfigRecord, RotationClaim,
    ScopeKeyBinding,
};
use seal_kms::{Kms, KmsConfig, KmsStore, ManualClock, MemoryKmsStore, RotationPolicy, StoreError};
use secrecy::SecretString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

/// 固定的测试运维密钥（base64 编码的 32 字节）
pub fn test_config() -> KmsConfig {
    let mut config = KmsConfig::default();
    config.root.root_encryption_key = Some(SecretString::from(
        general_purpose::STANDARD.encode([0x42u8; 32]),
    ));
    config.rotation = RotationPolicy {
        poll_interval_secs: 1,
        batch_size: 50,
        abandon_after_secs: 300,
        retry_backoff_secs: 30,
        max_retry_backoff_secs: 600,
        escalation_threshold: 3,
    };
    config
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_750_000_000, 0).unwrap()
}

/// 在同一存储与时钟上启动一个 KMS 实例，模拟一个独立的服务进程
pub async fn start_kms(store: Arc<dyn KmsStore>, clock: Arc<ManualClock>) -> Kms {
    Kms::start_with_clock(&test_config(), store, clock).await.unwrap()
}

/// 可注入版本写入与密钥行更新故障的存储
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryKmsStore,
    fail_inserts: AtomicBool,
    failing_updates: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_version_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// 接下来的 `count` 次 `update_key` 调用失败
    pub fn fail_next_key_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl KmsStore for FlakyStore {
    async fn create_key(
        &self,
        key: KmsKey,
        initial_version: KmsKeyVersion,
    ) -> Result<KmsKey, StoreError> {
        self.inner.create_key(key, initial_version).await
    }

    async fn find_key(&self, key_id: Uuid) -> Result<Option<KmsKey>, StoreError> {
        self.inner.find_key(key_id).await
    }

    async fn find_key_by_slug(
        &self,
        scope_id: Uuid,
        slug: &str,
    ) -> Result<Option<KmsKey>, StoreError> {
        self.inner.find_key_by_slug(scope_id, slug).await
    }

    async fn insert_version(&self, version: KmsKeyVersion) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "simulated write failure".to_string(),
            ));
        }
        self.inner.insert_version(version).await
    }

    async fn find_version(
        &self,
        key_id: Uuid,
        version: u32,
    ) -> Result<Option<KmsKeyVersion>, StoreError> {
        self.inner.find_version(key_id, version).await
    }

    async fn find_latest_version(
        &self,
        key_id: Uuid,
    ) -> Result<Option<KmsKeyVersion>, StoreError> {
        self.inner.find_latest_version(key_id).await
    }

    async fn list_versions(&self, key_id: Uuid) -> Result<Vec<KmsKeyVersion>, StoreError> {
        self.inner.list_versions(key_id).await
    }

    async fn update_key(
        &self,
        key_id: Uuid,
        patch: KmsKeyPatch,
    ) -> Result<Option<KmsKey>, StoreError> {
        let should_fail = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::Unavailable(
                "simulated update failure".to_string(),
            ));
        }
        self.inner.update_key(key_id, patch).await
    }

    async fn claim_rotation(
        &self,
        key_id: Uuid,
        claim: &RotationClaim,
    ) -> Result<ClaimOutcome, StoreError> {
        self.inner.claim_rotation(key_id, claim).await
    }

    async fn list_due_keys(
        &self,
        now: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<KmsKey>, StoreError> {
        self.inner.list_due_keys(now, abandoned_before, limit).await
    }

    async fn find_root_config(&self) -> Result<Option<RootConfigRecord>, StoreError> {
        self.inner.find_root_config().await
    }

    async fn create_root_config(&self, record: RootConfigRecord) -> Result<(), StoreError> {
        self.inner.create_root_config(record).await
    }

    async fn find_scope_binding(
        &self,
        scope_id: Uuid,
    ) -> Result<Option<ScopeKeyBinding>, StoreError> {
        self.inner.find_scope_binding(scope_id).await
    }

    async fn save_scope_binding(&self, binding: ScopeKeyBinding) -> Result<(), StoreError> {
        self.inner.save_scope_binding(binding).await
    }
}
