//! 基于 `DashMap` 的内存存储。每个分片写锁即一次单行事务。

use crate::storage::records::{
    ClaimOutcome, KmsKey, KmsKeyPatch, KmsKeyVersion, ROOT_CONFIG_ID, RootConfigRecord,
    RotationClaim, ScopeKeyBinding,
};
use crate::storage::traits::{KmsStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeMap;
use uuid::Uuid;

/// 内存存储，语义与关系型后端一致，适合测试和单进程部署
#[derive(Debug, Default)]
pub struct MemoryKmsStore {
    keys: DashMap<Uuid, KmsKey>,
    slugs: DashMap<(Uuid, String), Uuid>,
    versions: DashMap<Uuid, BTreeMap<u32, KmsKeyVersion>>,
    root_config: DashMap<Uuid, RootConfigRecord>,
    bindings: DashMap<Uuid, ScopeKeyBinding>,
}

impl MemoryKmsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KmsStore for MemoryKmsStore {
    async fn create_key(
        &self,
        key: KmsKey,
        initial_version: KmsKeyVersion,
    ) -> Result<KmsKey, StoreError> {
        // slug 条目在整个插入过程中持有，保证同 scope 下的唯一性
        match self.slugs.entry((key.scope_id, key.slug.clone())) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                table: "kms_keys",
                detail: format!("slug '{}' already exists in scope {}", key.slug, key.scope_id),
            }),
            Entry::Vacant(slot) => {
                let mut versions = BTreeMap::new();
                versions.insert(initial_version.version, initial_version);
                self.versions.insert(key.id, versions);
                self.keys.insert(key.id, key.clone());
                slot.insert(key.id);
                Ok(key)
            }
        }
    }

    async fn find_key(&self, key_id: Uuid) -> Result<Option<KmsKey>, StoreError> {
        Ok(self.keys.get(&key_id).map(|k| k.clone()))
    }

    async fn find_key_by_slug(
        &self,
        scope_id: Uuid,
        slug: &str,
    ) -> Result<Option<KmsKey>, StoreError> {
        let Some(id) = self.slugs.get(&(scope_id, slug.to_string())).map(|id| *id) else {
            return Ok(None);
        };
        self.find_key(id).await
    }

    async fn insert_version(&self, version: KmsKeyVersion) -> Result<(), StoreError> {
        if !self.keys.contains_key(&version.kms_key_id) {
            return Err(StoreError::NotFound {
                table: "kms_keys",
                id: version.kms_key_id,
            });
        }
        let mut rows = self.versions.entry(version.kms_key_id).or_default();
        if rows.contains_key(&version.version) {
            return Err(StoreError::UniqueViolation {
                table: "kms_key_versions",
                detail: format!(
                    "(kms_key_id, version) = ({}, {})",
                    version.kms_key_id, version.version
                ),
            });
        }
        rows.insert(version.version, version);
        Ok(())
    }

    async fn find_version(
        &self,
        key_id: Uuid,
        version: u32,
    ) -> Result<Option<KmsKeyVersion>, StoreError> {
        Ok(self
            .versions
            .get(&key_id)
            .and_then(|rows| rows.get(&version).cloned()))
    }

    async fn find_latest_version(
        &self,
        key_id: Uuid,
    ) -> Result<Option<KmsKeyVersion>, StoreError> {
        Ok(self
            .versions
            .get(&key_id)
            .and_then(|rows| rows.last_key_value().map(|(_, v)| v.clone())))
    }

    async fn list_versions(&self, key_id: Uuid) -> Result<Vec<KmsKeyVersion>, StoreError> {
        Ok(self
            .versions
            .get(&key_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_key(
        &self,
        key_id: Uuid,
        patch: KmsKeyPatch,
    ) -> Result<Option<KmsKey>, StoreError> {
        let mut row = self.keys.get_mut(&key_id).ok_or(StoreError::NotFound {
            table: "kms_keys",
            id: key_id,
        })?;
        if !patch.guard_holds(&row) {
            return Ok(None);
        }
        patch.apply(&mut row, Utc::now());
        Ok(Some(row.clone()))
    }

    async fn claim_rotation(
        &self,
        key_id: Uuid,
        claim: &RotationClaim,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut row = self.keys.get_mut(&key_id).ok_or(StoreError::NotFound {
            table: "kms_keys",
            id: key_id,
        })?;
        Ok(row.try_claim(claim))
    }

    async fn list_due_keys(
        &self,
        now: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<KmsKey>, StoreError> {
        let mut due: Vec<KmsKey> = self
            .keys
            .iter()
            .filter(|row| row.is_selectable_for_rotation(now, abandoned_before))
            .map(|row| row.clone())
            .collect();
        due.sort_by_key(|k| k.next_rotation_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_root_config(&self) -> Result<Option<RootConfigRecord>, StoreError> {
        Ok(self.root_config.get(&ROOT_CONFIG_ID).map(|r| r.clone()))
    }

    async fn create_root_config(&self, record: RootConfigRecord) -> Result<(), StoreError> {
        match self.root_config.entry(record.id) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                table: "kms_root_config",
                detail: format!("id {}", record.id),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn find_scope_binding(
        &self,
        scope_id: Uuid,
    ) -> Result<Option<ScopeKeyBinding>, StoreError> {
        Ok(self.bindings.get(&scope_id).map(|b| b.clone()))
    }

    async fn save_scope_binding(&self, binding: ScopeKeyBinding) -> Result<(), StoreError> {
        self.bindings.insert(binding.scope_id, binding);
        Ok(())
    }
}
