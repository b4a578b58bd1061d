//!
//! # 通用配置模块
//!
//! KMS 的全部可配置项：根密钥来源、轮换调度策略与存储位置。
//! 非敏感部分可持久化为 JSON；根密钥只从环境变量或代码注入，永不落盘。
//!
use serde::{Deserialize, Serialize};
use secrecy::SecretString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::rotation::RotationPolicy;

/// 运维方提供的根信任来源。
///
/// 二者择一：`encryption_key` 为 UTF-8 原文，`root_encryption_key` 为 base64。
/// 两者都设置时优先使用 `encryption_key`。解码后必须恰好 32 字节。
#[derive(Debug, Default)]
pub struct RootKeyConfig {
    pub encryption_key: Option<SecretString>,
    pub root_encryption_key: Option<SecretString>,
}

/// 存储配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    /// JSON 快照文件路径；为空时使用内存存储
    pub path: Option<PathBuf>,
}

/// 完整配置
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct KmsConfig {
    #[serde(skip)]
    pub root: RootKeyConfig,
    /// 轮换配置
    #[serde(default)]
    pub rotation: RotationPolicy,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
}

impl KmsConfig {
    /// 从 JSON 文件加载非敏感配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: KmsConfig = serde_json::from_str(&contents)?;
        config.rotation.validate()?;
        Ok(config)
    }

    /// 保存非敏感配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// 以默认值为基础，叠加环境变量
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// 文件存在时从文件加载，然后叠加环境变量
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) if path.as_ref().exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), Error> {
        // 根密钥
        if let Ok(value) = std::env::var("ENCRYPTION_KEY") {
            if !value.is_empty() {
                self.root.encryption_key = Some(SecretString::from(value));
            }
        }
        if let Ok(value) = std::env::var("ROOT_ENCRYPTION_KEY") {
            if !value.is_empty() {
                self.root.root_encryption_key = Some(SecretString::from(value));
            }
        }

        // 轮换调度
        if let Some(v) = env_number("SEAL_KMS_POLL_INTERVAL_SECS")? {
            self.rotation.poll_interval_secs = v;
        }
        if let Some(v) = env_number::<usize>("SEAL_KMS_BATCH_SIZE")? {
            self.rotation.batch_size = v;
        }
        if let Some(v) = env_number("SEAL_KMS_ABANDON_AFTER_SECS")? {
            self.rotation.abandon_after_secs = v;
        }
        if let Some(v) = env_number("SEAL_KMS_RETRY_BACKOFF_SECS")? {
            self.rotation.retry_backoff_secs = v;
        }
        if let Some(v) = env_number("SEAL_KMS_MAX_RETRY_BACKOFF_SECS")? {
            self.rotation.max_retry_backoff_secs = v;
        }
        if let Some(v) = env_number("SEAL_KMS_ESCALATION_THRESHOLD")? {
            self.rotation.escalation_threshold = v;
        }

        // 存储
        if let Ok(value) = std::env::var("SEAL_KMS_STORAGE_PATH") {
            if !value.is_empty() {
                self.storage.path = Some(PathBuf::from(value));
            }
        }

        self.rotation.validate()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Configuration(format!("{} is not a valid number: {}", name, value))),
        Err(_) => Ok(None),
    }
}
