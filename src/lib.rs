//! # Seal-KMS: Internal Key Management and Key Rotation
//!
//! `seal-kms` protects secrets at rest through envelope encryption over
//! versioned root keys, and rotates those keys in the background without
//! losing access to data encrypted under earlier versions.
//!
//! ## Core Concepts
//!
//! - **`Kms`**: The facade. Encrypts with the current version of a key and
//!   decrypts with whichever version a ciphertext records.
//! - **`KeyManager`**: Creates keys, appends versions and performs manual rotation.
//! - **`RotationScheduler`**: Polls for due keys, claims them with compare-and-swap
//!   and rotates them in parallel.
//! - **`KmsStore`**: The persistence contract. `MemoryKmsStore` and `FileKmsStore`
//!   are provided.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use seal_kms::{CreateKeyRequest, Kms, KmsConfig};
//!
//! let config = KmsConfig::from_env()?;
//! let kms = Kms::open(&config).await?;
//! let key = kms.create_key(scope_id, CreateKeyRequest::default()).await?;
//!
//! let wrapped = kms.encrypt(key.id, b"hello").await?;
//! kms.rotate_manually(key.id).await?;
//! assert_eq!(&*kms.decrypt(&wrapped).await?, b"hello");
//!
//! let handle = kms.scheduler().start();
//! // ...
//! handle.shutdown().await;
//! ```
//!
//! ---
//!
//! # Seal-KMS：内部密钥管理与密钥轮换
//!
//! 通过版本化根密钥上的信封加密保护静态数据，并在后台轮换这些密钥，
//! 旧版本加密的数据始终可以解密。

pub mod common;
pub mod data_key;
pub mod envelope;
pub mod error;
pub mod kms;
pub mod root;
pub mod rotation;
pub mod storage;
pub mod symmetric;

pub use common::{Clock, KmsConfig, ManualClock, RootKeyConfig, SecureBytes, StorageConfig, SystemClock};
pub use data_key::DataKeyService;
pub use envelope::{EnvelopeEngine, WrappedSecret, decrypt_with_input_key, encrypt_with_input_key};
pub use error::{Error, Result};
pub use kms::{Kms, open_store};
pub use root::RootKeyring;
pub use rotation::{
    CreateKeyRequest, KeyManager, RotationCycleReport, RotationOutcome, RotationPolicy,
    RotationScheduler, RotationSchedulerHandle, RotationStatusReport, RotationStatusTracker,
    RotationTrigger,
};
#[cfg(feature = "file-store")]
pub use storage::FileKmsStore;
pub use storage::{KmsKey, KmsKeyVersion, KmsStore, MemoryKmsStore, RotationStatus, StoreError};

/// The version of the `seal-kms` crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
