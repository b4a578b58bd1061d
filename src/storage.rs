//! The storage module, defining how KMS tables are persisted.
// 中文: 存储模块，定义 KMS 各表的持久化方式。

pub mod memory;
pub mod records;
pub mod traits;

#[cfg(feature = "file-store")]
pub mod file;

#[cfg(feature = "file-store")]
pub use file::FileKmsStore;
pub use memory::MemoryKmsStore;
pub use records::{
    ClaimOutcome, KmsKey, KmsKeyPatch, KmsKeyVersion, ROOT_CONFIG_ID, RootConfigRecord,
    RotationClaim, RotationStatus, ScopeKeyBinding,
};
pub use traits::{KmsStore, StoreError};
