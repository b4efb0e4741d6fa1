//! Memoria Core - 核心类型和抽象
//!
//! 提供记忆引擎的基础类型：错误处理、引擎配置、元数据映射。

pub mod config;
pub mod error;
pub mod metadata;

pub use config::*;
pub use error::*;
pub use metadata::*;
