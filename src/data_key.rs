//! 组织/项目级别的默认 KMS 密钥与数据密钥。
//!
//! 每个 scope 第一次需要加密时自动创建一个保留的默认 KMS 密钥，
//! 以及由该密钥包裹的 32 字节数据密钥。同一 scope 的并发调用只会创建一份。

use crate::common::utils::SecureBytes;
use crate::envelope::EnvelopeEngine;
use crate::error::{Error, Result};
use crate::rotation::manager::{CreateKeyRequest, KeyManager};
use crate::storage::ScopeKeyBinding;
use crate::symmetric::{AesGcmSystem, SymmetricCryptographicSystem};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// 默认 KMS 密钥的 slug
pub const DEFAULT_KEY_SLUG: &str = "default";

#[derive(Clone)]
pub struct DataKeyService {
    manager: Arc<KeyManager>,
    envelope: EnvelopeEngine,
    /// 每个 scope 一把锁，只增不减；条目很小，数量以本进程见过的 scope 数为上限
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DataKeyService {
    pub fn new(manager: Arc<KeyManager>, envelope: EnvelopeEngine) -> Self {
        Self {
            manager,
            envelope,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn scope_lock(&self, scope_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(scope_id).or_default().clone()
    }

    /// scope 绑定的 KMS 密钥；不存在时创建保留的默认密钥
    pub async fn scope_kms_key_id(&self, scope_id: Uuid) -> Result<Uuid> {
        let store = self.manager.store();
        if let Some(binding) = store.find_scope_binding(scope_id).await? {
            return Ok(binding.kms_key_id);
        }

        let lock = self.scope_lock(scope_id);
        let _guard = lock.lock().await;
        if let Some(binding) = store.find_scope_binding(scope_id).await? {
            return Ok(binding.kms_key_id);
        }

        // 上次创建了密钥但未写入绑定时复用它
        let key = match self.manager.key_by_slug(scope_id, DEFAULT_KEY_SLUG).await? {
            Some(key) => key,
            None => {
                self.manager
                    .create_key(
                        scope_id,
                        CreateKeyRequest {
                            slug: Some(DEFAULT_KEY_SLUG.to_string()),
                            is_reserved: true,
                            ..Default::default()
                        },
                    )
                    .await?
            }
        };

        store
            .save_scope_binding(ScopeKeyBinding {
                scope_id,
                kms_key_id: key.id,
                encrypted_data_key: None,
                updated_at: self.manager.clock().now(),
            })
            .await?;
        tracing::info!(scope_id = %scope_id, key_id = %key.id, "bound default KMS key to scope");
        Ok(key.id)
    }

    /// scope 的数据密钥（明文）；不存在时生成并以 scope 的 KMS 密钥包裹保存
    pub async fn scope_data_key(&self, scope_id: Uuid) -> Result<SecureBytes> {
        if let Some(wrapped) = self.wrapped_data_key(scope_id).await? {
            return self.envelope.decrypt_blob(&wrapped).await;
        }
        self.scope_kms_key_id(scope_id).await?;

        let lock = self.scope_lock(scope_id);
        let _guard = lock.lock().await;
        // 绑定可能在等锁期间被改绑，必须在锁内重新读取
        let store = self.manager.store();
        let binding = store
            .find_scope_binding(scope_id)
            .await?
            .ok_or_else(|| {
                Error::InvalidRequest(format!("scope {} has no KMS key binding", scope_id))
            })?;
        if let Some(wrapped) = binding.encrypted_data_key {
            return self.envelope.decrypt_blob(&wrapped).await;
        }

        let kms_key_id = binding.kms_key_id;
        let data_key = AesGcmSystem::generate_key()?;
        let wrapped = self
            .envelope
            .encrypt_to_blob(kms_key_id, data_key.as_bytes())
            .await?;
        store
            .save_scope_binding(ScopeKeyBinding {
                scope_id,
                kms_key_id,
                encrypted_data_key: Some(wrapped),
                updated_at: self.manager.clock().now(),
            })
            .await?;
        tracing::info!(scope_id = %scope_id, key_id = %kms_key_id, "generated scope data key");
        Ok(SecureBytes::new(data_key.as_bytes()))
    }

    async fn wrapped_data_key(&self, scope_id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self
            .manager
            .store()
            .find_scope_binding(scope_id)
            .await?
            .and_then(|b| b.encrypted_data_key))
    }

    /// 把 scope 改绑到同 scope 下的另一个 KMS 密钥，已有数据密钥随之重新包裹
    pub async fn rebind_scope_key(&self, scope_id: Uuid, kms_key_id: Uuid) -> Result<()> {
        let key = self.manager.key(kms_key_id).await?;
        if key.scope_id != scope_id {
            return Err(Error::InvalidRequest(format!(
                "KMS key {} does not belong to scope {}",
                kms_key_id, scope_id
            )));
        }

        let lock = self.scope_lock(scope_id);
        let _guard = lock.lock().await;
        let store = self.manager.store();
        let encrypted_data_key = match store
            .find_scope_binding(scope_id)
            .await?
            .and_then(|b| b.encrypted_data_key)
        {
            Some(wrapped) => {
                let data_key = self.envelope.decrypt_blob(&wrapped).await?;
                Some(self.envelope.encrypt_to_blob(kms_key_id, &data_key).await?)
            }
            None => None,
        };

        store
            .save_scope_binding(ScopeKeyBinding {
                scope_id,
                kms_key_id,
                encrypted_data_key,
                updated_at: self.manager.clock().now(),
            })
            .await?;
        tracing::info!(scope_id = %scope_id, key_id = %kms_key_id, "rebound scope to KMS key");
        Ok(())
    }
}
