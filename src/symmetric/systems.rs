//! # Symmetric Cryptographic Systems Module
//!
//! Every symmetric system is expected to implement the `SymmetricCryptographicSystem`
//! trait. Key material, envelope payloads and rotation error summaries all go
//! through AES-256-GCM.
//!
//! ---
//!
//! # 对称加密系统模块
//!
//! 每个对称加密系统都应实现 `SymmetricCryptographicSystem` 特征。
//! 密钥材料、信封载荷与轮换错误摘要统一使用 AES-256-GCM。

pub mod aes_gcm;
