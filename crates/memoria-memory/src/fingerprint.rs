//! 内容指纹
//!
//! 对规范化后的文本做 SHA-256，用于写入时去重和维护时的重复合并。

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 规范化后内容的 SHA-256 (小写十六进制)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let normalized = normalize(text);
        let digest = Sha256::digest(normalized.as_bytes());
        Fingerprint(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 去除首尾空白、合并连续空白为单个空格、转小写
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 指纹相同且规范化文本一致才视为重复
pub fn is_duplicate(
    a: (&Fingerprint, &str),
    b: (&Fingerprint, &str),
) -> bool {
    a.0 == b.0 && normalize(a.1) == normalize(b.1)
}
