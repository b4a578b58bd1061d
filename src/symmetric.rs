//! 对称加密核心模块

pub mod systems;
pub mod traits;

pub use self::systems::aes_gcm::{AesGcmKey, AesGcmSystem, AesGcmSystemError};
pub use self::traits::{SealedBox, SymmetricCryptographicSystem};
