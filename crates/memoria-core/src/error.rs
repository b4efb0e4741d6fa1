//! 统一错误处理

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoriaError {
    #[error("未找到: {0}")]
    NotFound(String),

    #[error("服务不可用: {0}")]
    Unavailable(String),

    #[error("参数无效: {0}")]
    Invalid(String),

    #[error("状态冲突: {0}")]
    Conflict(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("超时: {0}")]
    Timeout(String),

    #[error("嵌入提供商错误: {0}")]
    Embedding(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 面向调用方 (工具层) 的错误分类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    Invalid,
    Conflict,
    Internal,
}

impl MemoriaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoriaError::NotFound(_) => ErrorKind::NotFound,
            MemoriaError::Unavailable(_) | MemoriaError::Embedding(_) => ErrorKind::Unavailable,
            MemoriaError::Invalid(_) | MemoriaError::Config(_) => ErrorKind::Invalid,
            MemoriaError::Conflict(_) => ErrorKind::Conflict,
            MemoriaError::Storage(_)
            | MemoriaError::Timeout(_)
            | MemoriaError::Io(_)
            | MemoriaError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, MemoriaError::Storage(_) | MemoriaError::Timeout(_))
    }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        MemoriaError::NotFound(format!("{} {}", entity, id))
    }
}

pub type Result<T> = std::result::Result<T, MemoriaError>;
