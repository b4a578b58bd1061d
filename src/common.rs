//! 通用模块，包含配置、时间源和共享的工具函数

pub mod clock;
pub mod config;
pub mod utils;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::config::{KmsConfig, RootKeyConfig, StorageConfig};
pub use self::utils::SecureBytes;
