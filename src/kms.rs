//! `Kms` 门面：把根密钥、信封加密、生命周期管理与调度器组装在一起。

use crate::common::clock::{Clock, SystemClock};
use crate::common::config::{KmsConfig, StorageConfig};
use crate::common::utils::SecureBytes;
use crate::data_key::DataKeyService;
use crate::envelope::{EnvelopeEngine, WrappedSecret};
use crate::error::{Error, Result};
use crate::root::RootKeyring;
use crate::rotation::{
    CreateKeyRequest, KeyManager, RotationOutcome, RotationPolicy, RotationScheduler,
    RotationStatusReport,
};
use crate::storage::{KmsKey, KmsKeyVersion, KmsStore, MemoryKmsStore};
use std::sync::Arc;
use uuid::Uuid;

/// 按配置打开存储：设置了路径时使用文件存储，否则使用内存存储
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KmsStore>> {
    match &config.path {
        #[cfg(feature = "file-store")]
        Some(path) => Ok(Arc::new(crate::storage::FileKmsStore::open(path)?)),
        #[cfg(not(feature = "file-store"))]
        Some(_) => Err(Error::Configuration(
            "storage path is set but the `file-store` feature is disabled".to_string(),
        )),
        None => Ok(Arc::new(MemoryKmsStore::new())),
    }
}

/// 内部 KMS 服务
#[derive(Clone)]
pub struct Kms {
    store: Arc<dyn KmsStore>,
    manager: Arc<KeyManager>,
    envelope: EnvelopeEngine,
    data_keys: DataKeyService,
    policy: RotationPolicy,
}

impl Kms {
    /// 按配置打开存储并启动
    pub async fn open(config: &KmsConfig) -> Result<Self> {
        let store = open_store(&config.storage)?;
        Self::start(config, store).await
    }

    pub async fn start(config: &KmsConfig, store: Arc<dyn KmsStore>) -> Result<Self> {
        Self::start_with_clock(config, store, Arc::new(SystemClock)).await
    }

    /// 使用指定时间源启动
    pub async fn start_with_clock(
        config: &KmsConfig,
        store: Arc<dyn KmsStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.rotation.validate()?;
        let root = Arc::new(RootKeyring::start(store.as_ref(), &config.root).await?);
        let manager = Arc::new(KeyManager::new(
            store.clone(),
            root.clone(),
            clock,
            config.rotation.clone(),
        ));
        let envelope = EnvelopeEngine::new(store.clone(), root);
        let data_keys = DataKeyService::new(manager.clone(), envelope.clone());
        tracing::info!("KMS started");
        Ok(Self {
            store,
            manager,
            envelope,
            data_keys,
            policy: config.rotation.clone(),
        })
    }

    pub async fn encrypt(&self, key_id: Uuid, plaintext: &[u8]) -> Result<WrappedSecret> {
        self.envelope.encrypt(key_id, plaintext).await
    }

    pub async fn decrypt(&self, wrapped: &WrappedSecret) -> Result<SecureBytes> {
        self.envelope.decrypt(wrapped).await
    }

    pub async fn create_key(&self, scope_id: Uuid, request: CreateKeyRequest) -> Result<KmsKey> {
        self.manager.create_key(scope_id, request).await
    }

    pub async fn get_key(&self, key_id: Uuid) -> Result<KmsKey> {
        self.manager.key(key_id).await
    }

    pub async fn get_current_version(&self, key_id: Uuid) -> Result<KmsKeyVersion> {
        self.manager.current_version(key_id).await
    }

    pub async fn get_version(&self, key_id: Uuid, version: u32) -> Result<KmsKeyVersion> {
        self.manager.version(key_id, version).await
    }

    pub async fn rotate_manually(&self, key_id: Uuid) -> Result<RotationOutcome> {
        self.manager.rotate_manually(key_id).await
    }

    pub async fn get_rotation_status(
        &self,
        key_id: Uuid,
        reveal_error: bool,
    ) -> Result<RotationStatusReport> {
        self.manager.tracker().report(key_id, reveal_error).await
    }

    /// 按配置的阈值判断是否需要升级告警
    pub async fn needs_escalation(&self, key_id: Uuid) -> Result<bool> {
        let report = self.get_rotation_status(key_id, false).await?;
        Ok(report.needs_escalation(self.policy.escalation_threshold))
    }

    pub async fn configure_auto_rotation(
        &self,
        key_id: Uuid,
        rotation_interval_seconds: Option<u64>,
        enabled: bool,
    ) -> Result<KmsKey> {
        self.manager
            .configure_auto_rotation(key_id, rotation_interval_seconds, enabled)
            .await
    }

    pub fn scheduler(&self) -> RotationScheduler {
        RotationScheduler::new(self.manager.clone())
    }

    pub fn data_keys(&self) -> &DataKeyService {
        &self.data_keys
    }

    pub fn envelope(&self) -> &EnvelopeEngine {
        &self.envelope
    }

    pub fn manager(&self) -> &Arc<KeyManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn KmsStore> {
        &self.store
    }
}
