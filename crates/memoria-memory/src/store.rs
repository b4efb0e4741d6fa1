//! 持久化抽象
//!
//! 引擎只通过 [`MemoryRepository`] 访问存储；表结构、连接管理等由具体实现负责。
//! [`InMemoryRepository`] 是参考实现，用于测试和嵌入式场景。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::knowledge_graph::Relationship;
use crate::tasks::Task;
use crate::thinking::ThinkingChain;
use crate::types::{
    EdgeId, EntityRef, EntityType, Memory, MemoryId, MemoryKind, Project, Session, TaskId,
};

/// 存储中各类记录的数量
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub projects: usize,
    pub memories: usize,
    pub tasks: usize,
    pub relationships: usize,
    pub sessions: usize,
    pub thinking_chains: usize,
}

/// 持久化协作方
#[async_trait]
pub trait MemoryRepository: Send + Sync {
    // 项目
    async fn upsert_project(&self, project: &Project) -> Result<()>;
    async fn get_project(&self, id: &str) -> Result<Option<Project>>;
    async fn list_projects(&self) -> Result<Vec<Project>>;

    // 记忆
    /// 插入记忆并分配递增 ID
    async fn insert_memory(&self, memory: Memory) -> Result<MemoryId>;
    async fn get_memory(&self, id: MemoryId) -> Result<Option<Memory>>;
    /// 覆盖已有记忆，不存在时返回 NotFound
    ///
    /// 访问次数和最近访问时间只进不退：取存储值与传入值中较大者，
    /// 快照写回不会覆盖期间发生的访问。
    async fn update_memory(&self, memory: &Memory) -> Result<()>;
    /// 删除记忆，返回是否存在
    async fn delete_memory(&self, id: MemoryId) -> Result<bool>;
    /// 项目内的候选记忆，`kinds` 为 None 时不过滤类别
    async fn fetch_candidates(
        &self,
        project_id: &str,
        kinds: Option<&[MemoryKind]>,
    ) -> Result<Vec<Memory>>;
    async fn count_memories(&self, project_id: &str) -> Result<usize>;
    async fn find_by_fingerprint(
        &self,
        project_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Memory>>;
    /// 记录访问：访问次数加一、刷新最近访问时间；忽略不存在的 ID
    async fn record_access(&self, ids: &[MemoryId], at: DateTime<Utc>) -> Result<()>;
    /// 在存储的访问次数上累加 `count`，最近访问时间取较大者；返回记忆是否存在
    async fn add_access(&self, id: MemoryId, count: u64, at: DateTime<Utc>) -> Result<bool>;

    // 任务
    async fn insert_task(&self, task: Task) -> Result<TaskId>;
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn delete_task(&self, id: TaskId) -> Result<bool>;
    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>>;

    // 关系
    async fn insert_relationship(&self, relationship: Relationship) -> Result<EdgeId>;
    async fn update_relationship(&self, relationship: &Relationship) -> Result<()>;
    async fn delete_relationship(&self, id: EdgeId) -> Result<bool>;
    async fn list_relationships(&self) -> Result<Vec<Relationship>>;

    // 会话
    async fn upsert_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>>;

    // 思维链
    async fn upsert_thinking_chain(&self, chain: &ThinkingChain) -> Result<()>;
    async fn get_thinking_chain(&self, id: Uuid) -> Result<Option<ThinkingChain>>;
    async fn list_thinking_chains(&self, project_id: &str) -> Result<Vec<ThinkingChain>>;

    /// 实体是否存在 (关系端点校验和孤立边清理)
    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool>;

    async fn stats(&self) -> Result<RepositoryStats>;
}

#[derive(Default)]
struct RepositoryState {
    projects: BTreeMap<String, Project>,
    memories: BTreeMap<MemoryId, Memory>,
    tasks: BTreeMap<TaskId, Task>,
    relationships: BTreeMap<EdgeId, Relationship>,
    sessions: BTreeMap<Uuid, Session>,
    thinking_chains: BTreeMap<Uuid, ThinkingChain>,
    next_memory_id: u64,
    next_task_id: u64,
    next_edge_id: u64,
}

/// 内存存储 (用于测试和开发)
pub struct InMemoryRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RepositoryState::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryRepository for InMemoryRepository {
    async fn upsert_project(&self, project: &Project) -> Result<()> {
        let mut state = self.state.write().await;
        state.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.state.read().await.projects.get(id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.state.read().await.projects.values().cloned().collect())
    }

    async fn insert_memory(&self, mut memory: Memory) -> Result<MemoryId> {
        let mut state = self.state.write().await;
        state.next_memory_id += 1;
        let id = MemoryId(state.next_memory_id);
        memory.id = id;
        state.memories.insert(id, memory);
        Ok(id)
    }

    async fn get_memory(&self, id: MemoryId) -> Result<Option<Memory>> {
        Ok(self.state.read().await.memories.get(&id).cloned())
    }

    async fn update_memory(&self, memory: &Memory) -> Result<()> {
        let mut state = self.state.write().await;
        match state.memories.get_mut(&memory.id) {
            Some(existing) => {
                let access_count = existing.access_count.max(memory.access_count);
                let last_accessed = existing.last_accessed.max(memory.last_accessed);
                *existing = memory.clone();
                existing.access_count = access_count;
                existing.last_accessed = last_accessed;
                Ok(())
            }
            None => Err(MemoriaError::not_found("memory", memory.id)),
        }
    }

    async fn delete_memory(&self, id: MemoryId) -> Result<bool> {
        Ok(self.state.write().await.memories.remove(&id).is_some())
    }

    async fn fetch_candidates(
        &self,
        project_id: &str,
        kinds: Option<&[MemoryKind]>,
    ) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        Ok(state
            .memories
            .values()
            .filter(|m| m.project_id.as_deref() == Some(project_id))
            .filter(|m| kinds.is_none_or(|kinds| kinds.contains(&m.kind)))
            .cloned()
            .collect())
    }

    async fn count_memories(&self, project_id: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .memories
            .values()
            .filter(|m| m.project_id.as_deref() == Some(project_id))
            .count())
    }

    async fn find_by_fingerprint(
        &self,
        project_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        Ok(state
            .memories
            .values()
            .filter(|m| m.project_id.as_deref() == Some(project_id) && &m.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    async fn record_access(&self, ids: &[MemoryId], at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(memory) = state.memories.get_mut(id) {
                memory.access_count += 1;
                memory.last_accessed = memory.last_accessed.max(at);
            }
        }
        Ok(())
    }

    async fn add_access(&self, id: MemoryId, count: u64, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.memories.get_mut(&id) {
            Some(memory) => {
                memory.access_count += count;
                memory.last_accessed = memory.last_accessed.max(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_task(&self, mut task: Task) -> Result<TaskId> {
        let mut state = self.state.write().await;
        state.next_task_id += 1;
        let id = TaskId(state.next_task_id);
        task.id = id;
        state.tasks.insert(id, task);
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(MemoriaError::not_found("task", task.id)),
        }
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        Ok(self.state.write().await.tasks.remove(&id).is_some())
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_relationship(&self, mut relationship: Relationship) -> Result<EdgeId> {
        let mut state = self.state.write().await;
        state.next_edge_id += 1;
        let id = EdgeId(state.next_edge_id);
        relationship.id = id;
        state.relationships.insert(id, relationship);
        Ok(id)
    }

    async fn update_relationship(&self, relationship: &Relationship) -> Result<()> {
        let mut state = self.state.write().await;
        match state.relationships.get_mut(&relationship.id) {
            Some(existing) => {
                *existing = relationship.clone();
                Ok(())
            }
            None => Err(MemoriaError::not_found("relationship", relationship.id)),
        }
    }

    async fn delete_relationship(&self, id: EdgeId) -> Result<bool> {
        Ok(self.state.write().await.relationships.remove(&id).is_some())
    }

    async fn list_relationships(&self) -> Result<Vec<Relationship>> {
        Ok(self.state.read().await.relationships.values().cloned().collect())
    }

    async fn upsert_session(&self, session: &Session) -> Result<()> {
        let mut state = self.state.write().await;
        state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn upsert_thinking_chain(&self, chain: &ThinkingChain) -> Result<()> {
        let mut state = self.state.write().await;
        state.thinking_chains.insert(chain.id, chain.clone());
        Ok(())
    }

    async fn get_thinking_chain(&self, id: Uuid) -> Result<Option<ThinkingChain>> {
        Ok(self.state.read().await.thinking_chains.get(&id).cloned())
    }

    async fn list_thinking_chains(&self, project_id: &str) -> Result<Vec<ThinkingChain>> {
        let state = self.state.read().await;
        Ok(state
            .thinking_chains
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool> {
        let state = self.state.read().await;
        let exists = match entity.entity_type {
            EntityType::Memory => entity
                .as_memory_id()
                .is_some_and(|id| state.memories.contains_key(&id)),
            EntityType::Task => entity
                .as_task_id()
                .is_some_and(|id| state.tasks.contains_key(&id)),
            EntityType::Project => state.projects.contains_key(&entity.id),
            EntityType::Session => entity
                .as_uuid()
                .is_some_and(|id| state.sessions.contains_key(&id)),
            EntityType::ThinkingChain => entity
                .as_uuid()
                .is_some_and(|id| state.thinking_chains.contains_key(&id)),
        };
        Ok(exists)
    }

    async fn stats(&self) -> Result<RepositoryStats> {
        let state = self.state.read().await;
        Ok(RepositoryStats {
            projects: state.projects.len(),
            memories: state.memories.len(),
            tasks: state.tasks.len(),
            relationships: state.relationships.len(),
            sessions: state.sessions.len(),
            thinking_chains: state.thinking_chains.len(),
        })
    }
}
