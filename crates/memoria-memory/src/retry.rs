//! 带重试的存储包装
//!
//! 对瞬时错误 (`Storage`、`Timeout`) 按 [`RetryPolicy`] 做指数退避重试，
//! 每次尝试都有独立超时。其余错误直接返回。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, Result, RetryPolicy};
use std::future::Future;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::knowledge_graph::Relationship;
use crate::store::{MemoryRepository, RepositoryStats};
use crate::tasks::Task;
use crate::thinking::ThinkingChain;
use crate::types::{EdgeId, EntityRef, Memory, MemoryId, MemoryKind, Project, Session, TaskId};

pub struct RetryingRepository<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: MemoryRepository> RetryingRepository<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn call<'a, T, F, Fut>(&'a self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(self.policy.attempt_timeout(), f()).await {
                Ok(result) => result,
                Err(_) => Err(MemoriaError::Timeout(format!(
                    "{} 超过 {:?}",
                    operation,
                    self.policy.attempt_timeout()
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("存储操作 {} 在第 {} 次尝试成功", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.policy.backoff_for(attempt);
                    warn!(
                        "存储操作 {} 失败: {} (尝试 {}/{}), {:?} 后重试",
                        operation, e, attempt, max_attempts, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<R: MemoryRepository> MemoryRepository for RetryingRepository<R> {
    async fn upsert_project(&self, project: &Project) -> Result<()> {
        self.call("upsert_project", || self.inner.upsert_project(project))
            .await
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.call("get_project", || self.inner.get_project(id)).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.call("list_projects", || self.inner.list_projects()).await
    }

    async fn insert_memory(&self, memory: Memory) -> Result<MemoryId> {
        self.call("insert_memory", || self.inner.insert_memory(memory.clone()))
            .await
    }

    async fn get_memory(&self, id: MemoryId) -> Result<Option<Memory>> {
        self.call("get_memory", || self.inner.get_memory(id)).await
    }

    async fn update_memory(&self, memory: &Memory) -> Result<()> {
        self.call("update_memory", || self.inner.update_memory(memory))
            .await
    }

    async fn delete_memory(&self, id: MemoryId) -> Result<bool> {
        self.call("delete_memory", || self.inner.delete_memory(id)).await
    }

    async fn fetch_candidates(
        &self,
        project_id: &str,
        kinds: Option<&[MemoryKind]>,
    ) -> Result<Vec<Memory>> {
        self.call("fetch_candidates", || {
            self.inner.fetch_candidates(project_id, kinds)
        })
        .await
    }

    async fn count_memories(&self, project_id: &str) -> Result<usize> {
        self.call("count_memories", || self.inner.count_memories(project_id))
            .await
    }

    async fn find_by_fingerprint(
        &self,
        project_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Memory>> {
        self.call("find_by_fingerprint", || {
            self.inner.find_by_fingerprint(project_id, fingerprint)
        })
        .await
    }

    async fn record_access(&self, ids: &[MemoryId], at: DateTime<Utc>) -> Result<()> {
        self.call("record_access", || self.inner.record_access(ids, at))
            .await
    }

    async fn add_access(&self, id: MemoryId, count: u64, at: DateTime<Utc>) -> Result<bool> {
        self.call("add_access", || self.inner.add_access(id, count, at))
            .await
    }

    async fn insert_task(&self, task: Task) -> Result<TaskId> {
        self.call("insert_task", || self.inner.insert_task(task.clone()))
            .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.call("get_task", || self.inner.get_task(id)).await
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.call("update_task", || self.inner.update_task(task)).await
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        self.call("delete_task", || self.inner.delete_task(id)).await
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.call("list_tasks", || self.inner.list_tasks(project_id))
            .await
    }

    async fn insert_relationship(&self, relationship: Relationship) -> Result<EdgeId> {
        self.call("insert_relationship", || {
            self.inner.insert_relationship(relationship.clone())
        })
        .await
    }

    async fn update_relationship(&self, relationship: &Relationship) -> Result<()> {
        self.call("update_relationship", || {
            self.inner.update_relationship(relationship)
        })
        .await
    }

    async fn delete_relationship(&self, id: EdgeId) -> Result<bool> {
        self.call("delete_relationship", || self.inner.delete_relationship(id))
            .await
    }

    async fn list_relationships(&self) -> Result<Vec<Relationship>> {
        self.call("list_relationships", || self.inner.list_relationships())
            .await
    }

    async fn upsert_session(&self, session: &Session) -> Result<()> {
        self.call("upsert_session", || self.inner.upsert_session(session))
            .await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.call("get_session", || self.inner.get_session(id)).await
    }

    async fn upsert_thinking_chain(&self, chain: &ThinkingChain) -> Result<()> {
        self.call("upsert_thinking_chain", || {
            self.inner.upsert_thinking_chain(chain)
        })
        .await
    }

    async fn get_thinking_chain(&self, id: Uuid) -> Result<Option<ThinkingChain>> {
        self.call("get_thinking_chain", || self.inner.get_thinking_chain(id))
            .await
    }

    async fn list_thinking_chains(&self, project_id: &str) -> Result<Vec<ThinkingChain>> {
        self.call("list_thinking_chains", || {
            self.inner.list_thinking_chains(project_id)
        })
        .await
    }

    async fn entity_exists(&self, entity: &EntityRef) -> Result<bool> {
        self.call("entity_exists", || self.inner.entity_exists(entity))
            .await
    }

    async fn stats(&self) -> Result<RepositoryStats> {
        self.call("stats", || self.inner.stats()).await
    }
}
