//! 记忆类型定义

use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, Metadata, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

pub type ProjectId = String;

/// 记忆 ID，由存储按插入顺序递增分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

/// 任务 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

/// 关系边 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 项目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            path: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 记忆类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Code,
    Conversation,
    Decision,
    Pattern,
    Error,
    ThinkingChain,
    ThinkingStep,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 7] = [
        MemoryKind::Code,
        MemoryKind::Conversation,
        MemoryKind::Decision,
        MemoryKind::Pattern,
        MemoryKind::Error,
        MemoryKind::ThinkingChain,
        MemoryKind::ThinkingStep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Code => "code",
            MemoryKind::Conversation => "conversation",
            MemoryKind::Decision => "decision",
            MemoryKind::Pattern => "pattern",
            MemoryKind::Error => "error",
            MemoryKind::ThinkingChain => "thinking_chain",
            MemoryKind::ThinkingStep => "thinking_step",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = MemoriaError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        MemoryKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| MemoriaError::Invalid(format!("未知的记忆类别: {}", s)))
    }
}

/// 带模型标识的嵌入向量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEmbedding {
    pub vector: Vec<f32>,
    /// 生成该向量的提供商标识 (name:model)
    pub model: String,
}

impl StoredEmbedding {
    pub fn new(vector: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            vector,
            model: model.into(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// 两个向量可比较: 同一模型且维度一致
    pub fn is_comparable(&self, other: &StoredEmbedding) -> bool {
        self.model == other.model && self.vector.len() == other.vector.len()
    }
}

/// 记忆项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    /// None 表示全局记忆
    pub project_id: Option<ProjectId>,
    pub kind: MemoryKind,
    pub title: String,
    pub content: String,
    pub embedding: Option<StoredEmbedding>,
    pub fingerprint: Fingerprint,
    pub file_path: Option<String>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
}

impl Memory {
    /// 构造尚未持久化的记忆 (id 由存储分配)
    pub fn new(
        project_id: Option<ProjectId>,
        kind: MemoryKind,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: MemoryId(0),
            project_id,
            kind,
            title: title.into(),
            fingerprint: Fingerprint::of(&content),
            content,
            embedding: None,
            file_path: None,
            importance: 0.5,
            created_at: now,
            updated_at: now,
            access_count: 0,
            last_accessed: now,
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self.last_accessed = at;
        self
    }

    pub fn with_embedding(mut self, embedding: StoredEmbedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// 最近一次活动时间 (更新或访问)
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.updated_at.max(self.last_accessed)
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_accessed = at;
        self.access_count += 1;
    }

    /// 向量是否缺失或与当前提供商不一致
    pub fn needs_embedding(&self, current_model: Option<&str>) -> bool {
        match (&self.embedding, current_model) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(embedding), Some(model)) => embedding.model != model,
        }
    }
}

/// 写入记忆的请求
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub kind: MemoryKind,
    pub title: String,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
    /// None 时由重要性评分器估算
    pub importance: Option<f32>,
    pub file_path: Option<String>,
}

impl NewMemory {
    pub fn new(kind: MemoryKind, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
            importance: None,
            file_path: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

/// 校验重要性分数在 [0, 1] 内
pub fn validate_importance(importance: f32) -> Result<f32> {
    if importance.is_finite() && (0.0..=1.0).contains(&importance) {
        Ok(importance)
    } else {
        Err(MemoriaError::Invalid(format!(
            "重要性分数必须在 [0, 1] 内, 实际为 {}",
            importance
        )))
    }
}

/// 会话 (仅记账，不参与评分)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub interaction_count: u64,
    pub summary: Option<String>,
}

impl Session {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            interaction_count: 0,
            summary: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// 知识图谱中实体的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Memory,
    Task,
    Project,
    Session,
    ThinkingChain,
}

/// 对任意实体的弱引用 (类型 + ID)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    pub fn memory(id: MemoryId) -> Self {
        Self::new(EntityType::Memory, id.to_string())
    }

    pub fn task(id: TaskId) -> Self {
        Self::new(EntityType::Task, id.to_string())
    }

    pub fn project(id: &str) -> Self {
        Self::new(EntityType::Project, id)
    }

    pub fn session(id: Uuid) -> Self {
        Self::new(EntityType::Session, id.to_string())
    }

    pub fn thinking_chain(id: Uuid) -> Self {
        Self::new(EntityType::ThinkingChain, id.to_string())
    }

    pub fn as_memory_id(&self) -> Option<MemoryId> {
        match self.entity_type {
            EntityType::Memory => self.id.parse().ok().map(MemoryId),
            _ => None,
        }
    }

    pub fn as_task_id(&self) -> Option<TaskId> {
        match self.entity_type {
            EntityType::Task => self.id.parse().ok().map(TaskId),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self.entity_type {
            EntityType::Session | EntityType::ThinkingChain => self.id.parse().ok(),
            _ => None,
        }
    }

    /// 规范形式 (如 "01" → "1")，图谱和存储都以规范形式为键；ID 无法解析时返回 None
    pub fn canonical(&self) -> Option<Self> {
        match self.entity_type {
            EntityType::Memory => self.as_memory_id().map(Self::memory),
            EntityType::Task => self.as_task_id().map(Self::task),
            EntityType::Project => Some(self.clone()),
            EntityType::Session => self.as_uuid().map(Self::session),
            EntityType::ThinkingChain => self.as_uuid().map(Self::thinking_chain),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.entity_type, self.id)
    }
}
