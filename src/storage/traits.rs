//! Traits for abstracting storage operations.
// 中文: 用于抽象存储操作的 Trait。

use crate::storage::records::{
    ClaimOutcome, KmsKey, KmsKeyPatch, KmsKeyVersion, RootConfigRecord, RotationClaim,
    ScopeKeyBinding,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// 存储后端错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: &'static str, detail: String },

    #[error("row {id} not found in {table}")]
    NotFound { table: &'static str, id: Uuid },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Defines the persistence contract the KMS relies on.
///
/// Implementations must provide atomic single-row conditional updates
/// (`claim_rotation`, `update_key`), a unique constraint over
/// `(kms_key_id, version)` enforced by `insert_version`, and atomic insertion
/// of a key together with its first version (`create_key`).
///
/// 中文: 定义 KMS 所依赖的持久化契约。
///
/// 实现必须提供：原子的单行条件更新（`claim_rotation`、`update_key`）、
/// 由 `insert_version` 强制执行的 `(kms_key_id, version)` 唯一约束，
/// 以及密钥行与其第一个版本的原子插入（`create_key`）。
#[async_trait]
pub trait KmsStore: Send + Sync + 'static {
    /// 原子地插入密钥行和版本 1。同一 scope 下 slug 重复时返回 `UniqueViolation`。
    async fn create_key(
        &self,
        key: KmsKey,
        initial_version: KmsKeyVersion,
    ) -> Result<KmsKey, StoreError>;

    async fn find_key(&self, key_id: Uuid) -> Result<Option<KmsKey>, StoreError>;

    async fn find_key_by_slug(
        &self,
        scope_id: Uuid,
        slug: &str,
    ) -> Result<Option<KmsKey>, StoreError>;

    /// 插入新版本。`(kms_key_id, version)` 已存在时必须返回 `UniqueViolation`，绝不覆盖。
    async fn insert_version(&self, version: KmsKeyVersion) -> Result<(), StoreError>;

    async fn find_version(
        &self,
        key_id: Uuid,
        version: u32,
    ) -> Result<Option<KmsKeyVersion>, StoreError>;

    /// 版本号最大的一行，即当前版本
    async fn find_latest_version(&self, key_id: Uuid)
    -> Result<Option<KmsKeyVersion>, StoreError>;

    /// 按版本号升序
    async fn list_versions(&self, key_id: Uuid) -> Result<Vec<KmsKeyVersion>, StoreError>;

    /// 应用部分更新。密钥不存在时返回 `NotFound`；守卫不成立时返回 `Ok(None)`。
    async fn update_key(
        &self,
        key_id: Uuid,
        patch: KmsKeyPatch,
    ) -> Result<Option<KmsKey>, StoreError>;

    /// 以比较并交换的方式认领一次轮换，见 `KmsKey::try_claim`。
    async fn claim_rotation(
        &self,
        key_id: Uuid,
        claim: &RotationClaim,
    ) -> Result<ClaimOutcome, StoreError>;

    /// 到期查询，按 `next_rotation_at` 升序，最多 `limit` 行
    async fn list_due_keys(
        &self,
        now: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<KmsKey>, StoreError>;

    async fn find_root_config(&self) -> Result<Option<RootConfigRecord>, StoreError>;

    /// 单例行已存在时返回 `UniqueViolation`
    async fn create_root_config(&self, record: RootConfigRecord) -> Result<(), StoreError>;

    async fn find_scope_binding(
        &self,
        scope_id: Uuid,
    ) -> Result<Option<ScopeKeyBinding>, StoreError>;

    async fn save_scope_binding(&self, binding: ScopeKeyBinding) -> Result<(), StoreError>;
}
