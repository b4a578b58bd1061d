use std::ops::Deref;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 安全地比较两个字节序列，防止时序攻击
///
/// 无论输入如何，此函数总是比较所有字节，但只有所有字节都匹配才返回true
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0;
    for (byte_a, byte_b) in a.iter().zip(b.iter()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}

/// 安全字节容器，提供自动内存擦除
///
/// 用于向调用方返回解封后的数据密钥等敏感数据
#[derive(Clone)]
pub struct SecureBytes {
    bytes: Vec<u8>,
}

impl SecureBytes {
    /// 创建新的安全字节容器
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { bytes: data.into() }
    }

    /// 安全地比较两个SecureBytes实例
    pub fn constant_time_eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.bytes, &other.bytes)
    }
}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBytes({} bytes)", self.bytes.len())
    }
}

impl Zeroize for SecureBytes {
    fn zeroize(&mut self) {
        self.bytes.zeroize();
    }
}

impl ZeroizeOnDrop for SecureBytes {}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        let a = b"sensitive data";
        let b = b"sensitive data";
        let c = b"different data";

        assert!(constant_time_eq(a, b));
        assert!(!constant_time_eq(a, c));
        assert!(!constant_time_eq(a, &c[0..5]));
    }

    #[test]
    fn test_secure_bytes() {
        let secure = SecureBytes::new(b"sensitive information".to_vec());
        assert_eq!(&*secure, b"sensitive information");
        assert!(secure.constant_time_eq(&secure.clone()));
        assert!(!secure.constant_time_eq(&SecureBytes::new(b"other".to_vec())));
        assert_eq!(format!("{:?}", secure), "SecureBytes(21 bytes)");
    }
}
