//! Envelope encryption over versioned KMS keys.
// 中文: 基于版本化 KMS 密钥的信封加密。
//
// 加密总是使用当前版本，解密总是使用密文上记录的版本，轮换因此对调用方透明。

use crate::common::utils::SecureBytes;
use crate::error::{Error, Result};
use crate::root::RootKeyring;
use crate::storage::KmsStore;
use crate::symmetric::{AesGcmSystem, SealedBox, SymmetricCryptographicSystem};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 密文块末尾的格式标记
pub const BLOB_FORMAT_MARKER: &[u8; 3] = b"v01";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = 16 + 4 + NONCE_SIZE + TAG_SIZE;

/// 信封加密的输出，由调用方保存，引擎本身不存储。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedSecret {
    pub key_id: Uuid,
    pub version: u32,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub tag: Vec<u8>,
}

impl WrappedSecret {
    fn from_sealed(key_id: Uuid, version: u32, sealed: SealedBox) -> Self {
        Self {
            key_id,
            version,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            tag: sealed.tag,
        }
    }

    fn to_sealed(&self) -> SealedBox {
        SealedBox {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
            tag: self.tag.clone(),
        }
    }

    /// 紧凑二进制编码：`key_id(16) ‖ version(u32 BE) ‖ nonce(12) ‖ tag(16) ‖ ciphertext ‖ "v01"`
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_SIZE + self.ciphertext.len() + BLOB_FORMAT_MARKER.len());
        out.extend_from_slice(self.key_id.as_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(BLOB_FORMAT_MARKER);
        out
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let body = blob
            .strip_suffix(BLOB_FORMAT_MARKER.as_slice())
            .ok_or_else(|| Error::Format("unknown cipher blob format".to_string()))?;
        if body.len() < HEADER_SIZE {
            return Err(Error::Format(format!(
                "cipher blob too short: {} bytes",
                blob.len()
            )));
        }
        let (id_bytes, rest) = body.split_at(16);
        let (version_bytes, rest) = rest.split_at(4);
        let (nonce, rest) = rest.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let key_id = Uuid::from_slice(id_bytes).map_err(|e| Error::Format(e.to_string()))?;
        let mut version = [0u8; 4];
        version.copy_from_slice(version_bytes);

        Ok(Self {
            key_id,
            version: u32::from_be_bytes(version),
            ciphertext: ciphertext.to_vec(),
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
        })
    }
}

/// 信封加密引擎。无状态，可被任意多个任务并发使用。
#[derive(Clone)]
pub struct EnvelopeEngine {
    store: Arc<dyn KmsStore>,
    root: Arc<RootKeyring>,
}

impl EnvelopeEngine {
    pub fn new(store: Arc<dyn KmsStore>, root: Arc<RootKeyring>) -> Self {
        Self { store, root }
    }

    /// 使用密钥的当前版本加密
    pub async fn encrypt(&self, key_id: Uuid, plaintext: &[u8]) -> Result<WrappedSecret> {
        let current = match self.store.find_latest_version(key_id).await? {
            Some(v) => v,
            None => return Err(self.missing_version(key_id, 1).await),
        };
        let key = self
            .root
            .open_key_material(key_id, current.version, &current.encrypted_key_material)?;
        let aad = envelope_aad(key_id, current.version);
        let sealed = AesGcmSystem::encrypt(&key, plaintext, Some(&aad))?;
        Ok(WrappedSecret::from_sealed(key_id, current.version, sealed))
    }

    /// 使用密文上记录的版本解密
    pub async fn decrypt(&self, wrapped: &WrappedSecret) -> Result<SecureBytes> {
        let row = match self
            .store
            .find_version(wrapped.key_id, wrapped.version)
            .await?
        {
            Some(row) => row,
            None => return Err(self.missing_version(wrapped.key_id, wrapped.version).await),
        };
        let key = self
            .root
            .open_key_material(wrapped.key_id, row.version, &row.encrypted_key_material)?;
        let aad = envelope_aad(wrapped.key_id, wrapped.version);
        let plaintext = AesGcmSystem::decrypt(&key, &wrapped.to_sealed(), Some(&aad))?;
        Ok(SecureBytes::new(plaintext))
    }

    pub async fn encrypt_to_blob(&self, key_id: Uuid, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.encrypt(key_id, plaintext).await?.to_blob())
    }

    pub async fn decrypt_blob(&self, blob: &[u8]) -> Result<SecureBytes> {
        self.decrypt(&WrappedSecret::from_blob(blob)?).await
    }

    // 区分密钥不存在与版本缺失，后者意味着存储完整性被破坏
    async fn missing_version(&self, key_id: Uuid, version: u32) -> Error {
        match self.store.find_key(key_id).await {
            Ok(Some(_)) => {
                tracing::error!(key_id = %key_id, version, "KMS key version is missing from the version store");
                Error::KeyVersionNotFound { key_id, version }
            }
            Ok(None) => Error::KeyNotFound(key_id),
            Err(e) => e.into(),
        }
    }
}

fn envelope_aad(key_id: Uuid, version: u32) -> Vec<u8> {
    format!("{}:{}", key_id, version).into_bytes()
}

/// 使用调用方提供的原始密钥加密，不经过版本查找。
///
/// 输出格式为 `[u32 LE 长度][nonce][tag][密文] ‖ "v01"`，用于引导阶段的材料。
pub fn encrypt_with_input_key(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = AesGcmSystem::key_from_bytes(key)?;
    let mut out = AesGcmSystem::encrypt(&key, plaintext, None)?.to_packed();
    out.extend_from_slice(BLOB_FORMAT_MARKER);
    Ok(out)
}

pub fn decrypt_with_input_key(key: &[u8], blob: &[u8]) -> Result<SecureBytes> {
    let body = blob
        .strip_suffix(BLOB_FORMAT_MARKER.as_slice())
        .ok_or_else(|| Error::Format("unknown cipher blob format".to_string()))?;
    let key = AesGcmSystem::key_from_bytes(key)?;
    let sealed = AesGcmSystem::unpack(body).map_err(|e| Error::Format(e.to_string()))?;
    Ok(SecureBytes::new(AesGcmSystem::decrypt(&key, &sealed, None)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WrappedSecret {
        WrappedSecret {
            key_id: Uuid::new_v4(),
            version: 258,
            ciphertext: b"ciphertext".to_vec(),
            nonce: vec![1; NONCE_SIZE],
            tag: vec![2; TAG_SIZE],
        }
    }

    #[test]
    fn test_blob_layout() {
        let wrapped = sample();
        let blob = wrapped.to_blob();
        assert_eq!(&blob[..16], wrapped.key_id.as_bytes());
        assert_eq!(&blob[16..20], &[0, 0, 1, 2]);
        assert!(blob.ends_with(b"v01"));
        assert_eq!(WrappedSecret::from_blob(&blob).unwrap(), wrapped);
    }

    #[test]
    fn test_blob_rejects_unknown_format() {
        let mut blob = sample().to_blob();
        let last = blob.len() - 1;
        blob[last] = b'2';
        assert!(matches!(WrappedSecret::from_blob(&blob), Err(Error::Format(_))));
        assert!(matches!(WrappedSecret::from_blob(b"tinyv01"), Err(Error::Format(_))));
    }

    #[test]
    fn test_input_key_roundtrip_and_tamper() {
        let key = [9u8; 32];
        let blob = encrypt_with_input_key(&key, b"bootstrap").unwrap();
        assert_eq!(&*decrypt_with_input_key(&key, &blob).unwrap(), b"bootstrap");

        let mut tampered = blob.clone();
        tampered[10] ^= 0x01;
        assert!(matches!(
            decrypt_with_input_key(&key, &tampered),
            Err(Error::AuthenticationFailed)
        ));
        assert!(matches!(
            decrypt_with_input_key(&[8u8; 32], &blob),
            Err(Error::AuthenticationFailed)
        ));
        assert!(encrypt_with_input_key(&[1u8; 16], b"x").is_err());
    }
}
