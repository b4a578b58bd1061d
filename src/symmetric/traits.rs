use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// 认证加密的输出：密文、随机数与认证标签分离保存。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub tag: Vec<u8>,
}

impl SealedBox {
    /// 打包为单一字节串：`[4字节长度][nonce][tag][密文]`
    pub fn to_packed(&self) -> Vec<u8> {
        let body_len = self.nonce.len() + self.tag.len() + self.ciphertext.len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// 对称加密系统的公共特征
pub trait SymmetricCryptographicSystem: Sized {
    /// 密钥的期望长度（以字节为单位）。
    const KEY_SIZE: usize;
    /// 随机数长度。
    const NONCE_SIZE: usize;
    /// 认证标签长度。
    const TAG_SIZE: usize;

    /// 用于加密和解密的单一密钥。
    type Key: Clone + Debug;

    /// 该系统的错误类型。
    type Error: std::error::Error + Send + Sync + 'static;

    /// 生成一个新的密钥。
    fn generate_key() -> Result<Self::Key, Self::Error>;

    /// 从原始字节构造密钥，长度必须等于 `KEY_SIZE`。
    fn key_from_bytes(bytes: &[u8]) -> Result<Self::Key, Self::Error>;

    /// 使用密钥加密数据。每次调用都会生成新的随机数。
    fn encrypt(
        key: &Self::Key,
        plaintext: &[u8],
        additional_data: Option<&[u8]>,
    ) -> Result<SealedBox, Self::Error>;

    /// 使用密钥解密数据。认证失败时返回错误，绝不返回未经验证的明文。
    fn decrypt(
        key: &Self::Key,
        sealed: &SealedBox,
        additional_data: Option<&[u8]>,
    ) -> Result<Vec<u8>, Self::Error>;

    /// 解析 `SealedBox::to_packed` 产生的字节串
    fn unpack(packed: &[u8]) -> Result<SealedBox, Self::Error>;

    /// 从 base64 字符串导入密钥
    fn import_key(key_data: &str) -> Result<Self::Key, Self::Error>;
}
