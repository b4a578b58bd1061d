//! JSON snapshot persistence for `KmsStore`.
// 中文: `KmsStore` 的 JSON 快照持久化实现。

#![cfg(feature = "file-store")]

use crate::storage::records::{
    ClaimOutcome, KmsKey, KmsKeyPatch, KmsKeyVersion, ROOT_CONFIG_ID, RootConfigRecord,
    RotationClaim, ScopeKeyBinding,
};
use crate::storage::traits::{KmsStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use uuid::Uuid;

/// 磁盘上的完整快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    kms_keys: BTreeMap<Uuid, KmsKey>,
    /// 以 `"{kms_key_id}:{version}"` 为键，天然满足唯一约束
    kms_key_versions: BTreeMap<String, KmsKeyVersion>,
    kms_root_config: Option<RootConfigRecord>,
    scope_key_bindings: BTreeMap<Uuid, ScopeKeyBinding>,
}

fn version_key(key_id: Uuid, version: u32) -> String {
    // 版本号补零，使字典序与数值序一致
    format!("{}:{:010}", key_id, version)
}

impl Snapshot {
    fn versions_of(&self, key_id: Uuid) -> impl Iterator<Item = &KmsKeyVersion> {
        let prefix = format!("{}:", key_id);
        self.kms_key_versions
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v)
    }

    fn key_mut(&mut self, key_id: Uuid) -> Result<&mut KmsKey, StoreError> {
        self.kms_keys.get_mut(&key_id).ok_or(StoreError::NotFound {
            table: "kms_keys",
            id: key_id,
        })
    }
}

/// 单进程文件存储。
///
/// 每次写操作都在快照副本上修改，在阻塞线程池中写入临时文件并 `fsync` 后原子替换目标文件，
/// 成功后才替换内存中的快照。写入失败时内存与磁盘保持一致的旧状态。
#[derive(Debug)]
pub struct FileKmsStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl FileKmsStore {
    /// 打开快照文件；文件不存在时从空状态开始
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let raw = fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            Snapshot::default()
        };
        tracing::debug!(path = %path.display(), keys = snapshot.kms_keys.len(), "opened KMS snapshot");
        Ok(Self {
            path,
            state: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        let guard = self.state.lock().await;
        f(&guard)
    }

    /// 写者互斥：快照锁一直持有到落盘完成
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let value = f(&mut next)?;
        let bytes = serde_json::to_vec_pretty(&next)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("snapshot writer task failed: {}", e)))??;
        *guard = next;
        Ok(value)
    }
}

fn write_snapshot(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl KmsStore for FileKmsStore {
    async fn create_key(
        &self,
        key: KmsKey,
        initial_version: KmsKeyVersion,
    ) -> Result<KmsKey, StoreError> {
        self.mutate(|s| {
            if s
                .kms_keys
                .values()
                .any(|k| k.scope_id == key.scope_id && k.slug == key.slug)
            {
                return Err(StoreError::UniqueViolation {
                    table: "kms_keys",
                    detail: format!("slug '{}' already exists in scope {}", key.slug, key.scope_id),
                });
            }
            s.kms_key_versions.insert(
                version_key(key.id, initial_version.version),
                initial_version,
            );
            s.kms_keys.insert(key.id, key.clone());
            Ok(key)
        })
        .await
    }

    async fn find_key(&self, key_id: Uuid) -> Result<Option<KmsKey>, StoreError> {
        Ok(self.read(|s| s.kms_keys.get(&key_id).cloned()).await)
    }

    async fn find_key_by_slug(
        &self,
        scope_id: Uuid,
        slug: &str,
    ) -> Result<Option<KmsKey>, StoreError> {
        Ok(self.read(|s| {
            s.kms_keys
                .values()
                .find(|k| k.scope_id == scope_id && k.slug == slug)
                .cloned()
        })
        .await)
    }

    async fn insert_version(&self, version: KmsKeyVersion) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.key_mut(version.kms_key_id)?;
            let slot = version_key(version.kms_key_id, version.version);
            if s.kms_key_versions.contains_key(&slot) {
                return Err(StoreError::UniqueViolation {
                    table: "kms_key_versions",
                    detail: format!(
                        "(kms_key_id, version) = ({}, {})",
                        version.kms_key_id, version.version
                    ),
                });
            }
            s.kms_key_versions.insert(slot, version);
            Ok(())
        })
        .await
    }

    async fn find_version(
        &self,
        key_id: Uuid,
        version: u32,
    ) -> Result<Option<KmsKeyVersion>, StoreError> {
        Ok(self.read(|s| s.kms_key_versions.get(&version_key(key_id, version)).cloned()).await)
    }

    async fn find_latest_version(
        &self,
        key_id: Uuid,
    ) -> Result<Option<KmsKeyVersion>, StoreError> {
        Ok(self.read(|s| s.versions_of(key_id).max_by_key(|v| v.version).cloned()).await)
    }

    async fn list_versions(&self, key_id: Uuid) -> Result<Vec<KmsKeyVersion>, StoreError> {
        Ok(self.read(|s| {
            let mut rows: Vec<KmsKeyVersion> = s.versions_of(key_id).cloned().collect();
            rows.sort_by_key(|v| v.version);
            rows
        })
        .await)
    }

    async fn update_key(
        &self,
        key_id: Uuid,
        patch: KmsKeyPatch,
    ) -> Result<Option<KmsKey>, StoreError> {
        // 守卫不成立时不写盘
        let holds = self
            .read(|s| s.kms_keys.get(&key_id).map(|k| patch.guard_holds(k)))
            .await;
        match holds {
            None => Err(StoreError::NotFound {
                table: "kms_keys",
                id: key_id,
            }),
            Some(false) => Ok(None),
            Some(true) => self.mutate(|s| {
                let row = s.key_mut(key_id)?;
                if !patch.guard_holds(row) {
                    return Ok(None);
                }
                patch.apply(row, Utc::now());
                Ok(Some(row.clone()))
            })
            .await,
        }
    }

    async fn claim_rotation(
        &self,
        key_id: Uuid,
        claim: &RotationClaim,
    ) -> Result<ClaimOutcome, StoreError> {
        self.mutate(|s| Ok(s.key_mut(key_id)?.try_claim(claim)))
            .await
    }

    async fn list_due_keys(
        &self,
        now: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<KmsKey>, StoreError> {
        Ok(self.read(|s| {
            let mut due: Vec<KmsKey> = s
                .kms_keys
                .values()
                .filter(|k| k.is_selectable_for_rotation(now, abandoned_before))
                .cloned()
                .collect();
            due.sort_by_key(|k| k.next_rotation_at);
            due.truncate(limit);
            due
        })
        .await)
    }

    async fn find_root_config(&self) -> Result<Option<RootConfigRecord>, StoreError> {
        Ok(self.read(|s| s.kms_root_config.clone()).await)
    }

    async fn create_root_config(&self, record: RootConfigRecord) -> Result<(), StoreError> {
        self.mutate(|s| {
            if s.kms_root_config.is_some() {
                return Err(StoreError::UniqueViolation {
                    table: "kms_root_config",
                    detail: format!("id {}", ROOT_CONFIG_ID),
                });
            }
            s.kms_root_config = Some(record);
            Ok(())
        })
        .await
    }

    async fn find_scope_binding(
        &self,
        scope_id: Uuid,
    ) -> Result<Option<ScopeKeyBinding>, StoreError> {
        Ok(self.read(|s| s.scope_key_bindings.get(&scope_id).cloned()).await)
    }

    async fn save_scope_binding(&self, binding: ScopeKeyBinding) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.scope_key_bindings.insert(binding.scope_id, binding);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_root_config_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kms.json");

        let store = FileKmsStore::open(&path).unwrap();
        assert!(store.find_root_config().await.unwrap().is_none());
        let record = RootConfigRecord {
            id: ROOT_CONFIG_ID,
            encrypted_root_key: vec![9; 40],
            created_at: Utc::now(),
        };
        store.create_root_config(record.clone()).await.unwrap();
        drop(store);

        let reopened = FileKmsStore::open(&path).unwrap();
        assert_eq!(reopened.find_root_config().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kms.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            FileKmsStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_are_all_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kms.json");
        let store = std::sync::Arc::new(FileKmsStore::open(&path).unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                let scope_id = Uuid::new_v4();
                store
                    .save_scope_binding(ScopeKeyBinding {
                        scope_id,
                        kms_key_id: Uuid::new_v4(),
                        encrypted_data_key: None,
                        updated_at: Utc::now(),
                    })
                    .await
                    .unwrap();
                scope_id
            });
        }
        let scopes = tasks.join_all().await;
        drop(store);

        let reopened = FileKmsStore::open(&path).unwrap();
        for scope_id in scopes {
            assert!(reopened.find_scope_binding(scope_id).await.unwrap().is_some());
        }
    }

    #[test]
    fn test_version_keys_sort_numerically() {
        let id = Uuid::new_v4();
        assert!(version_key(id, 9) < version_key(id, 10));
    }
}
