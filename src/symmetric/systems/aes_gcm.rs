//! AES-GCM 对称加密实现
use crate::symmetric::traits::{SealedBox, SymmetricCryptographicSystem};
use aes_gcm::aead::{AeadInPlace, Error as AeadError, KeyInit};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce, Tag};
use base64::{Engine, engine::general_purpose};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16; // AES-GCM's tag is 16 bytes

/// AES-GCM 系统的独立错误类型
#[derive(Error, Debug)]
pub enum AesGcmSystemError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(#[from] rand_core::OsError),

    #[error("Invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(#[from] AeadError),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Ciphertext is malformed or truncated: {0}")]
    MalformedCiphertext(String),

    #[error("Base64 decoding failed: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

/// AES-256-GCM 对称加密系统
#[derive(Debug)]
pub struct AesGcmSystem;

/// AES-GCM 密钥，离开作用域时自动擦除
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesGcmKey(Vec<u8>);

impl AesGcmKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AesGcmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesGcmKey([REDACTED])")
    }
}

impl SymmetricCryptographicSystem for AesGcmSystem {
    const KEY_SIZE: usize = KEY_SIZE;
    const NONCE_SIZE: usize = NONCE_SIZE;
    const TAG_SIZE: usize = TAG_SIZE;
    type Key = AesGcmKey;
    type Error = AesGcmSystemError;

    fn generate_key() -> Result<Self::Key, Self::Error> {
        let mut key_bytes = vec![0u8; Self::KEY_SIZE];
        use rand_core::{OsRng, TryRngCore};
        OsRng.try_fill_bytes(&mut key_bytes)?;
        Ok(AesGcmKey(key_bytes))
    }

    fn key_from_bytes(bytes: &[u8]) -> Result<Self::Key, Self::Error> {
        if bytes.len() != KEY_SIZE {
            return Err(AesGcmSystemError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(AesGcmKey(bytes.to_vec()))
    }

    fn encrypt(
        key: &Self::Key,
        plaintext: &[u8],
        additional_data: Option<&[u8]>,
    ) -> Result<SealedBox, Self::Error> {
        let cipher =
            Aes256Gcm::new_from_slice(&key.0).map_err(|_| AesGcmSystemError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: key.0.len(),
            })?;
        use aes_gcm::aead::OsRng;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut buffer = plaintext.to_vec();
        let tag = cipher.encrypt_in_place_detached(
            &nonce,
            additional_data.unwrap_or(&[]),
            &mut buffer,
        )?;

        Ok(SealedBox {
            ciphertext: buffer,
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
        })
    }

    fn decrypt(
        key: &Self::Key,
        sealed: &SealedBox,
        additional_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, Self::Error> {
        // 长度不符的随机数或标签同样视为认证失败，不向调用方暴露具体原因
        if sealed.nonce.len() != NONCE_SIZE || sealed.tag.len() != TAG_SIZE {
            return Err(AesGcmSystemError::DecryptionFailed);
        }
        let cipher =
            Aes256Gcm::new_from_slice(&key.0).map_err(|_| AesGcmSystemError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: key.0.len(),
            })?;

        let nonce = Nonce::from_slice(&sealed.nonce);
        let tag = Tag::from_slice(&sealed.tag);

        let mut buffer = sealed.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(nonce, additional_data.unwrap_or(&[]), &mut buffer, tag)
            .map_err(|_| AesGcmSystemError::DecryptionFailed)?;

        Ok(buffer)
    }

    fn unpack(packed: &[u8]) -> Result<SealedBox, Self::Error> {
        // 统一格式：[4字节长度][nonce][tag][密文]
        if packed.len() < 4 {
            return Err(AesGcmSystemError::MalformedCiphertext(
                "Ciphertext is too short to contain length prefix".to_string(),
            ));
        }
        let (len_slice, body) = packed.split_at(4);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(len_slice);
        let len = u32::from_le_bytes(len_bytes) as usize;

        if body.len() != len {
            return Err(AesGcmSystemError::MalformedCiphertext(
                "Ciphertext length does not match length prefix".to_string(),
            ));
        }
        if body.len() < NONCE_SIZE + TAG_SIZE {
            return Err(AesGcmSystemError::MalformedCiphertext(
                "Ciphertext is too short".to_string(),
            ));
        }

        let (nonce, rest) = body.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);
        Ok(SealedBox {
            ciphertext: ciphertext.to_vec(),
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
        })
    }

    fn import_key(encoded_key: &str) -> Result<Self::Key, Self::Error> {
        let mut key_bytes = general_purpose::STANDARD.decode(encoded_key)?;
        let key = Self::key_from_bytes(&key_bytes);
        key_bytes.zeroize();
        key
    }
}
