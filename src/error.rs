//! Defines the custom error type for the `seal-kms` crate.

use crate::storage::StoreError;
use crate::symmetric::AesGcmSystemError;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for the `seal-kms` crate.
#[derive(Debug, Error)]
pub enum Error {
    /// 密文被篡改、密钥错误或版本错误。刻意不区分具体原因。
    #[error("decryption failed: ciphertext could not be authenticated")]
    AuthenticationFailed,

    #[error("KMS key not found: {0}")]
    KeyNotFound(Uuid),

    /// 版本只追加不删除，出现此错误意味着存储完整性被破坏。
    #[error("KMS key {key_id} has no version {version}")]
    KeyVersionNotFound { key_id: Uuid, version: u32 },

    #[error("rotation of KMS key {0} is already in progress")]
    RotationAlreadyInProgress(Uuid),

    #[error("rotation of KMS key {key_id} failed: {reason}")]
    RotationFailed { key_id: Uuid, reason: String },

    /// 任务在完成前已被其他实例接管，本任务的结果没有写入。
    #[error("rotation job {job_id} of KMS key {key_id} was taken over by another worker")]
    RotationSuperseded { key_id: Uuid, job_id: Uuid },

    /// 并发追加版本时输掉了唯一约束的竞争。
    #[error("version {version} of KMS key {key_id} was created concurrently")]
    VersionConflict { key_id: Uuid, version: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid data format: {0}")]
    Format(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("root key error: {0}")]
    RootKey(String),

    #[error("cryptography error: {0}")]
    Cryptography(String),

    #[error("storage error: {0}")]
    Store(StoreError),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

// AEAD 认证失败统一映射为 AuthenticationFailed，其余原语错误保留文本
impl From<AesGcmSystemError> for Error {
    fn from(err: AesGcmSystemError) -> Self {
        match err {
            AesGcmSystemError::DecryptionFailed => Error::AuthenticationFailed,
            other => Error::Cryptography(other.to_string()),
        }
    }
}

// 密钥行缺失按业务错误上报，其余存储错误原样包装
impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                table: "kms_keys",
                id,
            } => Error::KeyNotFound(id),
            other => Error::Store(other),
        }
    }
}

impl Error {
    /// 该错误是否只是调度上的预期结果，而非真正的故障。
    pub fn is_expected_contention(&self) -> bool {
        matches!(
            self,
            Error::RotationAlreadyInProgress(_)
                | Error::RotationSuperseded { .. }
                | Error::VersionConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_failure_maps_to_authentication_failed() {
        let err: Error = AesGcmSystemError::DecryptionFailed.into();
        assert!(matches!(err, Error::AuthenticationFailed));

        let err: Error = AesGcmSystemError::InvalidKeySize {
            expected: 32,
            actual: 3,
        }
        .into();
        assert!(matches!(err, Error::Cryptography(msg) if msg.contains("expected 32")));
    }

    #[test]
    fn missing_key_row_maps_to_key_not_found() {
        let id = Uuid::new_v4();
        let err: Error = StoreError::NotFound {
            table: "kms_keys",
            id,
        }
        .into();
        assert!(matches!(err, Error::KeyNotFound(found) if found == id));

        let err: Error = StoreError::Unavailable("down".to_string()).into();
        assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn contention_classification() {
        let id = Uuid::new_v4();
        assert!(Error::RotationAlreadyInProgress(id).is_expected_contention());
        assert!(Error::VersionConflict { key_id: id, version: 2 }.is_expected_contention());
        assert!(
            Error::RotationSuperseded {
                key_id: id,
                job_id: Uuid::new_v4()
            }
            .is_expected_contention()
        );
        assert!(!Error::KeyNotFound(id).is_expected_contention());
    }
}
