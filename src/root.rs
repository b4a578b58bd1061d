//! 平台根密钥与系统密钥。
//!
//! 根密钥由运维方提供的加密密钥保护，存放在 `kms_root_config` 单例行中；
//! 所有 KMS 密钥材料都在根密钥下加密。系统密钥由根密钥经 HKDF 派生，
//! 不随任何 KMS 密钥轮换，用于加密轮换错误摘要。

use crate::common::config::RootKeyConfig;
use crate::common::utils::SecureBytes;
use crate::error::{Error, Result};
use crate::storage::{KmsStore, ROOT_CONFIG_ID, RootConfigRecord, StoreError};
use crate::symmetric::{AesGcmKey, AesGcmSystem, AesGcmSystemError, SymmetricCryptographicSystem};
use chrono::Utc;
use hkdf::Hkdf;
use secrecy::ExposeSecret;
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroize;

const ROOT_CONFIG_AAD: &[u8] = b"seal-kms/root-config/v1";
const SYSTEM_KEY_INFO: &[u8] = b"seal-kms/rotation-error/v1";

/// 密钥材料的关联数据，把密文绑定到具体的密钥与版本
fn key_material_aad(key_id: Uuid, version: u32) -> Vec<u8> {
    format!("key-material:{}:{}", key_id, version).into_bytes()
}

/// 解码运维方提供的加密密钥。`ENCRYPTION_KEY` 优先于 `ROOT_ENCRYPTION_KEY`。
pub fn decode_operator_key(config: &RootKeyConfig) -> Result<AesGcmKey> {
    if let Some(key) = &config.encryption_key {
        let mut bytes = key.expose_secret().as_bytes().to_vec();
        let result = if bytes.len() == AesGcmSystem::KEY_SIZE {
            Ok(AesGcmSystem::key_from_bytes(&bytes)?)
        } else {
            Err(operator_key_size_error(bytes.len()))
        };
        bytes.zeroize();
        result
    } else if let Some(key) = &config.root_encryption_key {
        AesGcmSystem::import_key(key.expose_secret().trim()).map_err(|e| match e {
            AesGcmSystemError::InvalidKeySize { actual, .. } => operator_key_size_error(actual),
            other => Error::Configuration(format!("ROOT_ENCRYPTION_KEY is not base64: {}", other)),
        })
    } else {
        Err(Error::Configuration(
            "either ENCRYPTION_KEY or ROOT_ENCRYPTION_KEY must be set".to_string(),
        ))
    }
}

fn operator_key_size_error(actual: usize) -> Error {
    Error::Configuration(format!(
        "operator encryption key must be {} bytes, got {}",
        AesGcmSystem::KEY_SIZE,
        actual
    ))
}

/// 持有解密后的根密钥与派生出的系统密钥
pub struct RootKeyring {
    root_key: AesGcmKey,
    system_key: AesGcmKey,
}

impl fmt::Debug for RootKeyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootKeyring([REDACTED])")
    }
}

impl RootKeyring {
    /// 加载或初始化根密钥。
    ///
    /// 单例行不存在时生成新根密钥并写入；并发启动的实例若在插入时输掉唯一约束竞争，
    /// 则重新读取胜出者写入的行。运维密钥与已存储的根密钥不匹配时返回 `RootKey` 错误。
    pub async fn start(store: &dyn KmsStore, config: &RootKeyConfig) -> Result<Self> {
        let operator_key = decode_operator_key(config)?;

        if let Some(record) = store.find_root_config().await? {
            tracing::debug!("loaded existing KMS root key");
            return Self::open_record(&operator_key, &record);
        }

        let root_key = AesGcmSystem::generate_key()?;
        let sealed = AesGcmSystem::encrypt(&operator_key, root_key.as_bytes(), Some(ROOT_CONFIG_AAD))?;
        let record = RootConfigRecord {
            id: ROOT_CONFIG_ID,
            encrypted_root_key: sealed.to_packed(),
            created_at: Utc::now(),
        };

        match store.create_root_config(record).await {
            Ok(()) => {
                tracing::info!("generated new KMS root key");
                Self::from_root_key(root_key)
            }
            Err(StoreError::UniqueViolation { .. }) => {
                tracing::info!("another instance initialized the KMS root key first, reloading");
                let record = store.find_root_config().await?.ok_or_else(|| {
                    Error::RootKey("root config vanished after unique violation".to_string())
                })?;
                Self::open_record(&operator_key, &record)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 直接从根密钥构造，派生系统密钥
    pub fn from_root_key(root_key: AesGcmKey) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, root_key.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(SYSTEM_KEY_INFO, &mut okm)
            .map_err(|e| Error::Cryptography(format!("system key derivation failed: {}", e)))?;
        let system_key = AesGcmSystem::key_from_bytes(&okm);
        okm.zeroize();
        Ok(Self {
            root_key,
            system_key: system_key?,
        })
    }

    fn open_record(operator_key: &AesGcmKey, record: &RootConfigRecord) -> Result<Self> {
        let sealed = AesGcmSystem::unpack(&record.encrypted_root_key)
            .map_err(|e| Error::RootKey(format!("stored root key is malformed: {}", e)))?;
        let mut bytes = AesGcmSystem::decrypt(operator_key, &sealed, Some(ROOT_CONFIG_AAD))
            .map_err(|_| {
                Error::RootKey("operator encryption key does not match the stored root key".to_string())
            })?;
        let root_key = AesGcmSystem::key_from_bytes(&bytes);
        bytes.zeroize();
        Self::from_root_key(root_key?)
    }

    /// 在根密钥下加密一个版本的原始密钥材料
    pub fn seal_key_material(&self, key_id: Uuid, version: u32, material: &[u8]) -> Result<Vec<u8>> {
        let aad = key_material_aad(key_id, version);
        let sealed = AesGcmSystem::encrypt(&self.root_key, material, Some(&aad))?;
        Ok(sealed.to_packed())
    }

    /// 解开一个版本的密钥材料，返回可直接用于 AES-256-GCM 的密钥
    pub fn open_key_material(&self, key_id: Uuid, version: u32, encrypted: &[u8]) -> Result<AesGcmKey> {
        let aad = key_material_aad(key_id, version);
        let sealed = AesGcmSystem::unpack(encrypted)?;
        let mut material = AesGcmSystem::decrypt(&self.root_key, &sealed, Some(&aad)).map_err(|_| {
            tracing::error!(key_id = %key_id, version, "stored key material failed authentication");
            Error::AuthenticationFailed
        })?;
        let key = AesGcmSystem::key_from_bytes(&material);
        material.zeroize();
        Ok(key?)
    }

    /// 用系统密钥加密（轮换错误摘要等）
    pub fn seal_system(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = AesGcmSystem::encrypt(&self.system_key, plaintext, Some(SYSTEM_KEY_INFO))?;
        Ok(sealed.to_packed())
    }

    pub fn open_system(&self, packed: &[u8]) -> Result<SecureBytes> {
        let sealed = AesGcmSystem::unpack(packed)?;
        let plaintext = AesGcmSystem::decrypt(&self.system_key, &sealed, Some(SYSTEM_KEY_INFO))?;
        Ok(SecureBytes::new(plaintext))
    }
}
