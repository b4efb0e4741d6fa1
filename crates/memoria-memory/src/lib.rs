//! Memoria Memory - 记忆检索与维护引擎
//!
//! 为编码助手保存并检索项目记忆：
//! - 相关性评分: 语义相似度、重要性、新近度混合排序
//! - 知识图谱: 记忆、任务、项目之间的有向关系
//! - 去重: 写入时按内容指纹合并，维护时合并历史重复
//! - 保留维护: 过期清理、容量淘汰、孤立边清理
//!
//! 另外提供任务、会话和思维链的记账，以及上下文组装。

pub mod context;
pub mod embedding;
pub mod fingerprint;
pub mod importance;
pub mod knowledge_graph;
pub mod locks;
pub mod maintenance_scheduler;
pub mod manager;
pub mod retention;
pub mod retry;
pub mod scorer;
pub mod store;
pub mod tasks;
pub mod thinking;
pub mod types;

pub use context::*;
pub use embedding::*;
pub use fingerprint::*;
pub use importance::*;
pub use knowledge_graph::*;
pub use locks::*;
pub use maintenance_scheduler::*;
pub use manager::*;
pub use retention::*;
pub use retry::*;
pub use scorer::*;
pub use store::*;
pub use tasks::*;
pub use thinking::*;
pub use types::*;
