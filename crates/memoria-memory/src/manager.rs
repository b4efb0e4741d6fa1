//! 记忆引擎
//!
//! 对外的统一入口：记忆写入与检索、知识图谱、任务、会话、思维链和维护。
//! 公开操作受并发信号量限制；同一项目的写入和维护持有项目锁，检索不加锁。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use memoria_core::{EngineConfig, ErrorKind, MemoriaError, Metadata, Result, ScoringWeights};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ContextMemory, ContextTask, MemoryContext};
use crate::embedding::{EmbeddingOutcome, EmbeddingService};
use crate::fingerprint::{is_duplicate, Fingerprint};
use crate::importance::ImportanceScorer;
use crate::knowledge_graph::{
    KnowledgeGraph, KnowledgeGraphStats, Relationship, RelationshipKind, TraversalFilter,
    TraversalHit,
};
use crate::locks::ProjectLocks;
use crate::retention::{MaintenanceReport, RetentionManager};
use crate::retry::RetryingRepository;
use crate::scorer::{RelevanceScorer, ScoredMemory};
use crate::store::{MemoryRepository, RepositoryStats};
use crate::tasks::{compare_tasks, NewTask, Task, TaskStatus};
use crate::thinking::{ChainStatus, NewThinkingStep, ThinkingChain, ThinkingStep};
use crate::types::{
    validate_importance, EdgeId, EntityRef, Memory, MemoryId, MemoryKind, NewMemory, Project,
    Session, TaskId,
};

const CONTEXT_MEMORY_LIMIT: usize = 3;
const CONTEXT_TASK_LIMIT: usize = 5;
const CHAIN_TITLE_CHARS: usize = 50;

/// 检索选项
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub limit: usize,
    /// 覆盖引擎默认权重
    pub weights: Option<ScoringWeights>,
    pub kinds: Option<Vec<MemoryKind>>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            weights: None,
            kinds: None,
        }
    }
}

impl RecallOptions {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_kinds<I: IntoIterator<Item = MemoryKind>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }
}

/// 检索结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResult {
    pub query: String,
    pub items: Vec<ScoredMemory>,
    /// 嵌入不可用，排序只基于重要性和新近度
    pub degraded: bool,
}

impl RecallResult {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<MemoryId> {
        self.items.iter().map(|item| item.memory.id).collect()
    }
}

/// 多项目维护中单个项目的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepStatus {
    Completed(MaintenanceReport),
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSweep {
    pub project_id: String,
    pub status: SweepStatus,
}

/// 多项目维护报告，单个项目失败不影响其余项目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub results: Vec<ProjectSweep>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SweepReport {
    pub fn reports(&self) -> impl Iterator<Item = &MaintenanceReport> {
        self.results.iter().filter_map(|sweep| match &sweep.status {
            SweepStatus::Completed(report) => Some(report),
            SweepStatus::Failed { .. } => None,
        })
    }

    pub fn failures(&self) -> Vec<&ProjectSweep> {
        self.results
            .iter()
            .filter(|sweep| matches!(sweep.status, SweepStatus::Failed { .. }))
            .collect()
    }

    pub fn memories_removed(&self) -> usize {
        self.reports().map(|r| r.memories_removed()).sum()
    }

    pub fn edges_pruned(&self) -> usize {
        self.reports().map(|r| r.edges_pruned).sum()
    }
}

/// 重新生成嵌入的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReembedReport {
    pub project_id: String,
    pub refreshed: usize,
    /// 提供商不可用而未能刷新的数量
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project: Project,
    pub memory_count: usize,
    pub memories_by_kind: BTreeMap<String, usize>,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub active_thinking_chains: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub repository: RepositoryStats,
    pub graph: KnowledgeGraphStats,
    pub embedding_provider: Option<String>,
}

pub struct MemoryEngine {
    config: EngineConfig,
    repo: Arc<dyn MemoryRepository>,
    embeddings: EmbeddingService,
    scorer: RelevanceScorer,
    importance: ImportanceScorer,
    retention: RetentionManager,
    graph: RwLock<KnowledgeGraph>,
    locks: ProjectLocks,
    permits: Semaphore,
}

impl MemoryEngine {
    /// 打开引擎并从存储加载知识图谱
    pub async fn open(
        config: EngineConfig,
        repo: Arc<dyn MemoryRepository>,
        embeddings: EmbeddingService,
    ) -> Result<Self> {
        config.validate()?;
        let scorer = RelevanceScorer::new(config.scoring.clone())?;
        let retention = RetentionManager::new(config.retention.clone(), config.scoring.clone())?;

        let edges = repo.list_relationships().await?;
        let graph = KnowledgeGraph::from_edges(config.graph.max_depth_limit, edges);

        info!(
            "记忆引擎已启动: {} 条关系, 嵌入提供商 {}",
            graph.len(),
            embeddings.identity().unwrap_or_else(|| "无".to_string())
        );

        Ok(Self {
            permits: Semaphore::new(config.concurrency.max_concurrent_requests),
            config,
            repo,
            embeddings,
            scorer,
            importance: ImportanceScorer::new(),
            retention,
            graph: RwLock::new(graph),
            locks: ProjectLocks::new(),
        })
    }

    /// 用重试包装存储后打开引擎
    pub async fn with_retries<R: MemoryRepository + 'static>(
        config: EngineConfig,
        repo: R,
        embeddings: EmbeddingService,
    ) -> Result<Self> {
        let repo = Arc::new(RetryingRepository::new(repo, config.retry.clone()));
        Self::open(config, repo, embeddings).await
    }

    /// 按配置创建嵌入提供商并打开引擎
    pub async fn from_config<R: MemoryRepository + 'static>(
        config: EngineConfig,
        repo: R,
    ) -> Result<Self> {
        let embeddings = EmbeddingService::from_config(&config.embedding)?;
        Self::with_retries(config, repo, embeddings).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| MemoriaError::Unavailable("引擎已关闭".to_string()))
    }

    async fn require_project(&self, project_id: &str) -> Result<Project> {
        self.repo
            .get_project(project_id)
            .await?
            .ok_or_else(|| MemoriaError::not_found("项目", project_id))
    }

    // ---- 项目 ----

    pub async fn create_project(&self, project: Project) -> Result<Project> {
        let _permit = self.permit().await?;
        if project.id.trim().is_empty() {
            return Err(MemoriaError::Invalid("项目 ID 不能为空".to_string()));
        }
        if self.repo.get_project(&project.id).await?.is_some() {
            return Err(MemoriaError::Conflict(format!("项目 {} 已存在", project.id)));
        }
        self.repo.upsert_project(&project).await?;
        info!("已创建项目: {} ({})", project.name, project.id);
        Ok(project)
    }

    /// 获取项目，不存在时创建
    pub async fn ensure_project(&self, id: &str, name: &str) -> Result<Project> {
        let _permit = self.permit().await?;
        if let Some(project) = self.repo.get_project(id).await? {
            return Ok(project);
        }
        let project = Project::new(id, name);
        self.repo.upsert_project(&project).await?;
        info!("已创建项目: {} ({})", name, id);
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        let _permit = self.permit().await?;
        self.require_project(id).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let _permit = self.permit().await?;
        self.repo.list_projects().await
    }

    pub async fn project_summary(&self, project_id: &str) -> Result<ProjectSummary> {
        let _permit = self.permit().await?;
        let project = self.require_project(project_id).await?;

        let memories = self.repo.fetch_candidates(project_id, None).await?;
        let mut memories_by_kind = BTreeMap::new();
        for memory in &memories {
            *memories_by_kind.entry(memory.kind.to_string()).or_insert(0) += 1;
        }

        let tasks = self.repo.list_tasks(project_id).await?;
        let mut tasks_by_status = BTreeMap::new();
        for task in &tasks {
            *tasks_by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }

        let active_thinking_chains = self
            .repo
            .list_thinking_chains(project_id)
            .await?
            .iter()
            .filter(|chain| !chain.status.is_terminal())
            .count();

        Ok(ProjectSummary {
            project,
            memory_count: memories.len(),
            last_activity: memories.iter().map(Memory::last_activity).max(),
            memories_by_kind,
            tasks_by_status,
            active_thinking_chains,
        })
    }

    // ---- 记忆 ----

    /// 写入记忆，同一项目内规范化内容相同的记忆会被合并
    pub async fn remember(&self, project_id: &str, memory: NewMemory) -> Result<MemoryId> {
        let _permit = self.permit().await?;
        let importance = match memory.importance {
            Some(value) => validate_importance(value)?,
            None => self.importance.score(&memory),
        };
        self.require_project(project_id).await?;
        let _guard = self.locks.acquire(project_id).await;
        self.remember_locked(project_id, memory, importance).await
    }

    /// 调用方需持有项目锁
    async fn remember_locked(
        &self,
        project_id: &str,
        new: NewMemory,
        importance: f32,
    ) -> Result<MemoryId> {
        let now = Utc::now();
        let fingerprint = Fingerprint::of(&new.content);

        let existing = self
            .repo
            .find_by_fingerprint(project_id, &fingerprint)
            .await?
            .into_iter()
            .filter(|memory| {
                is_duplicate(
                    (&memory.fingerprint, &memory.content),
                    (&fingerprint, &new.content),
                )
            })
            .min_by_key(|memory| memory.id);

        if let Some(mut memory) = existing {
            memory.importance = memory.importance.max(importance);
            memory.updated_at = now;
            memory.tags.extend(new.tags);
            memory.metadata.extend(new.metadata);
            if memory.file_path.is_none() {
                memory.file_path = new.file_path;
            }
            if memory.needs_embedding(self.embeddings.identity().as_deref()) {
                if let Some(embedding) = self.embeddings.embed(&memory.content).await.into_embedding() {
                    memory.embedding = Some(embedding);
                }
            }
            self.repo.update_memory(&memory).await?;
            self.repo.record_access(&[memory.id], now).await?;
            debug!("记忆 {} 内容重复，已合并写入", memory.id);
            return Ok(memory.id);
        }

        let mut memory = Memory::new(
            Some(project_id.to_string()),
            new.kind,
            new.title,
            new.content,
        )
        .with_importance(importance);
        memory.tags = new.tags;
        memory.metadata = new.metadata;
        memory.file_path = new.file_path;
        memory.embedding = self.embeddings.embed(&memory.content).await.into_embedding();

        let kind = memory.kind;
        let id = self.repo.insert_memory(memory).await?;
        info!("已写入记忆 {} ({}) 到项目 {}", id, kind, project_id);
        Ok(id)
    }

    pub async fn get_memory(&self, id: MemoryId) -> Result<Memory> {
        let _permit = self.permit().await?;
        self.repo
            .get_memory(id)
            .await?
            .ok_or_else(|| MemoriaError::not_found("记忆", id))
    }

    /// 按相关性检索项目记忆；返回的记忆记一次访问
    pub async fn recall(
        &self,
        project_id: &str,
        query: &str,
        options: RecallOptions,
    ) -> Result<RecallResult> {
        let _permit = self.permit().await?;
        self.recall_inner(project_id, query, &options).await
    }

    async fn recall_inner(
        &self,
        project_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> Result<RecallResult> {
        let custom = match &options.weights {
            Some(weights) => Some(RelevanceScorer::new(weights.clone())?),
            None => None,
        };
        let scorer = custom.as_ref().unwrap_or(&self.scorer);
        self.require_project(project_id).await?;

        let (query_embedding, degraded) = if query.trim().is_empty() {
            (None, false)
        } else {
            match self.embeddings.embed(query).await {
                EmbeddingOutcome::Ready(embedding) => (Some(embedding), false),
                EmbeddingOutcome::Unavailable(reason) => {
                    debug!("检索降级为重要性和新近度排序: {}", reason);
                    (None, true)
                }
            }
        };

        let candidates = self
            .repo
            .fetch_candidates(project_id, options.kinds.as_deref())
            .await?;
        let now = Utc::now();
        let mut items = scorer.score(query_embedding.as_ref(), candidates, now);
        items.truncate(options.limit);

        if !items.is_empty() {
            let ids: Vec<MemoryId> = items.iter().map(|item| item.memory.id).collect();
            self.repo.record_access(&ids, now).await?;
            for item in &mut items {
                item.memory.touch(now);
            }
        }

        Ok(RecallResult {
            query: query.to_string(),
            items,
            degraded,
        })
    }

    /// 删除记忆；指向它的边留给维护清理
    pub async fn forget(&self, id: MemoryId) -> Result<bool> {
        let _permit = self.permit().await?;
        let deleted = self.repo.delete_memory(id).await?;
        if deleted {
            info!("已删除记忆 {}", id);
        }
        Ok(deleted)
    }

    /// 为缺失或过期向量的记忆重新生成嵌入
    pub async fn reembed_stale(&self, project_id: &str) -> Result<ReembedReport> {
        let _permit = self.permit().await?;
        self.require_project(project_id).await?;

        let mut report = ReembedReport {
            project_id: project_id.to_string(),
            ..ReembedReport::default()
        };
        let Some(identity) = self.embeddings.identity() else {
            return Ok(report);
        };

        let _guard = self.locks.acquire(project_id).await;
        for mut memory in self.repo.fetch_candidates(project_id, None).await? {
            if !memory.needs_embedding(Some(&identity)) {
                continue;
            }
            match self.embeddings.embed(&memory.content).await {
                EmbeddingOutcome::Ready(embedding) => {
                    memory.embedding = Some(embedding);
                    self.repo.update_memory(&memory).await?;
                    report.refreshed += 1;
                }
                EmbeddingOutcome::Unavailable(_) => report.failed += 1,
            }
        }

        if report.refreshed > 0 || report.failed > 0 {
            info!(
                "项目 {} 重新嵌入: 成功 {}, 失败 {}",
                project_id, report.refreshed, report.failed
            );
        }
        Ok(report)
    }

    // ---- 知识图谱 ----

    /// 创建关系，两端实体必须存在
    pub async fn link(
        &self,
        from: EntityRef,
        to: EntityRef,
        kind: RelationshipKind,
        strength: f32,
    ) -> Result<EdgeId> {
        let _permit = self.permit().await?;
        self.link_inner(Relationship::new(from, to, kind, strength)?)
            .await
    }

    async fn link_inner(&self, mut relationship: Relationship) -> Result<EdgeId> {
        for endpoint in [&mut relationship.from, &mut relationship.to] {
            let canonical = match endpoint.canonical() {
                Some(canonical) => canonical,
                None => return Err(MemoriaError::not_found("实体", &*endpoint)),
            };
            if !self.repo.entity_exists(&canonical).await? {
                return Err(MemoriaError::not_found("实体", canonical));
            }
            *endpoint = canonical;
        }

        let id = self.repo.insert_relationship(relationship.clone()).await?;
        relationship.id = id;
        debug!(
            "已创建关系 {}: {} -[{}]-> {}",
            id, relationship.from, relationship.kind, relationship.to
        );
        self.graph.write().await.add_edge(relationship);
        Ok(id)
    }

    pub async fn unlink(&self, id: EdgeId) -> Result<bool> {
        let _permit = self.permit().await?;
        let deleted = self.repo.delete_relationship(id).await?;
        self.graph.write().await.remove_edge(id);
        Ok(deleted)
    }

    /// 从起点遍历，`max_depth` 为 None 时使用配置的默认深度
    pub async fn traverse(
        &self,
        start: &EntityRef,
        max_depth: Option<usize>,
        filter: &TraversalFilter,
    ) -> Result<Vec<TraversalHit>> {
        let _permit = self.permit().await?;
        let depth = max_depth.unwrap_or(self.config.graph.default_max_depth);
        let start = canonical_or_raw(start);
        self.graph.read().await.traverse(&start, depth, filter)
    }

    pub async fn edges_from(&self, entity: &EntityRef) -> Vec<Relationship> {
        self.graph.read().await.edges_from(&canonical_or_raw(entity))
    }

    pub async fn edges_to(&self, entity: &EntityRef) -> Vec<Relationship> {
        self.graph.read().await.edges_to(&canonical_or_raw(entity))
    }

    // ---- 维护 ----

    pub async fn maintain(&self, project_id: &str) -> Result<MaintenanceReport> {
        let _permit = self.permit().await?;
        self.maintain_inner(project_id).await
    }

    async fn maintain_inner(&self, project_id: &str) -> Result<MaintenanceReport> {
        self.require_project(project_id).await?;
        let _guard = self.locks.acquire(project_id).await;
        self.retention
            .run_maintenance(&*self.repo, &self.graph, project_id, Utc::now())
            .await
    }

    /// 依次维护所有项目
    pub async fn maintain_all(&self) -> Result<SweepReport> {
        let _permit = self.permit().await?;
        let started_at = Utc::now();
        let projects = self.repo.list_projects().await?;

        let mut results = Vec::with_capacity(projects.len());
        for project in projects {
            let status = match self.maintain_inner(&project.id).await {
                Ok(report) => SweepStatus::Completed(report),
                Err(e) => {
                    warn!("项目 {} 维护失败: {}", project.id, e);
                    SweepStatus::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
            };
            results.push(ProjectSweep {
                project_id: project.id,
                status,
            });
        }

        let report = SweepReport {
            results,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            "全量维护完成: {} 个项目, {} 个失败",
            report.results.len(),
            report.failures().len()
        );
        Ok(report)
    }

    // ---- 任务 ----

    pub async fn create_task(&self, project_id: &str, task: NewTask) -> Result<Task> {
        let _permit = self.permit().await?;
        task.validate()?;
        self.require_project(project_id).await?;

        let mut task = Task::new(project_id, task);
        task.id = self.repo.insert_task(task.clone()).await?;
        info!("已创建任务 {}: {}", task.id, task.title);
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let _permit = self.permit().await?;
        self.load_task(id).await
    }

    async fn load_task(&self, id: TaskId) -> Result<Task> {
        self.repo
            .get_task(id)
            .await?
            .ok_or_else(|| MemoriaError::not_found("任务", id))
    }

    /// 按优先级降序、创建时间升序列出任务
    pub async fn list_tasks(
        &self,
        project_id: &str,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>> {
        let _permit = self.permit().await?;
        self.list_tasks_inner(project_id, status, limit).await
    }

    async fn list_tasks_inner(
        &self,
        project_id: &str,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>> {
        self.require_project(project_id).await?;
        let mut tasks: Vec<Task> = self
            .repo
            .list_tasks(project_id)
            .await?
            .into_iter()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .collect();
        tasks.sort_by(compare_tasks);
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    pub async fn update_task_status(&self, id: TaskId, status: TaskStatus) -> Result<Task> {
        let _permit = self.permit().await?;
        let project_id = self.load_task(id).await?.project_id;
        let _guard = self.locks.acquire(&project_id).await;

        let mut task = self.load_task(id).await?;
        let previous = task.status;
        if task.apply_status(status, Utc::now())? {
            self.repo.update_task(&task).await?;
            info!("任务 {} 状态: {} -> {}", id, previous, status);
        }
        Ok(task)
    }

    // ---- 会话 ----

    pub async fn start_session(&self, project_id: &str) -> Result<Session> {
        let _permit = self.permit().await?;
        self.require_project(project_id).await?;
        let session = Session::new(project_id);
        self.repo.upsert_session(&session).await?;
        info!("会话 {} 已开始 (项目 {})", session.id, project_id);
        Ok(session)
    }

    async fn active_session(&self, id: Uuid) -> Result<Session> {
        let session = self
            .repo
            .get_session(id)
            .await?
            .ok_or_else(|| MemoriaError::not_found("会话", id))?;
        if !session.is_active() {
            return Err(MemoriaError::Conflict(format!("会话 {} 已结束", id)));
        }
        Ok(session)
    }

    pub async fn record_interaction(&self, id: Uuid) -> Result<Session> {
        let _permit = self.permit().await?;
        let mut session = self.active_session(id).await?;
        session.interaction_count += 1;
        self.repo.upsert_session(&session).await?;
        Ok(session)
    }

    pub async fn end_session(&self, id: Uuid, summary: Option<String>) -> Result<Session> {
        let _permit = self.permit().await?;
        let mut session = self.active_session(id).await?;
        session.ended_at = Some(Utc::now());
        session.summary = summary;
        self.repo.upsert_session(&session).await?;
        info!(
            "会话 {} 已结束, 共 {} 次交互",
            id, session.interaction_count
        );
        Ok(session)
    }

    // ---- 思维链 ----

    async fn load_chain(&self, id: Uuid) -> Result<ThinkingChain> {
        self.repo
            .get_thinking_chain(id)
            .await?
            .ok_or_else(|| MemoriaError::not_found("思维链", id))
    }

    /// 开始思维链，同时写入一条 thinking_chain 记忆
    pub async fn start_thinking_chain(
        &self,
        project_id: &str,
        objective: &str,
    ) -> Result<ThinkingChain> {
        let _permit = self.permit().await?;
        if objective.trim().is_empty() {
            return Err(MemoriaError::Invalid("思维链目标不能为空".to_string()));
        }
        self.require_project(project_id).await?;
        let _guard = self.locks.acquire(project_id).await;

        let mut chain = ThinkingChain::new(project_id, objective);
        let title: String = objective.chars().take(CHAIN_TITLE_CHARS).collect();
        // 正文带上链 ID，同目标的不同思维链不会被写入去重合并
        let memory = NewMemory::new(
            MemoryKind::ThinkingChain,
            format!("Thinking chain: {}", title),
            format!("{}\n\nChain: {}", objective, chain.id),
        )
        .with_metadata(Metadata::new().with("chain_id", chain.id.to_string()));
        let importance = self.importance.score(&memory);
        chain.memory_id = Some(self.remember_locked(project_id, memory, importance).await?);

        self.repo.upsert_thinking_chain(&chain).await?;
        info!("思维链 {} 已开始: {}", chain.id, objective);
        Ok(chain)
    }

    /// 追加步骤；步骤写入 thinking_step 记忆并以 implements 关系指向思维链
    pub async fn add_thinking_step(
        &self,
        chain_id: Uuid,
        request: NewThinkingStep,
    ) -> Result<ThinkingStep> {
        let _permit = self.permit().await?;
        let project_id = self.load_chain(chain_id).await?.project_id;
        let _guard = self.locks.acquire(&project_id).await;

        let mut chain = self.load_chain(chain_id).await?;
        let mut step = chain.prepare_step(&request)?;

        let mut content = match &step.reasoning {
            Some(reasoning) => format!("{}\n\nReasoning: {}", step.content, reasoning),
            None => step.content.clone(),
        };
        content.push_str(&format!("\n\nChain: {}\nStep: {}", chain.id, step.id));
        let metadata = Metadata::new()
            .with("chain_id", chain.id.to_string())
            .with("step_id", step.id.to_string())
            .with("stage", step.stage.as_str())
            .with("confidence", step.confidence);
        let memory = NewMemory::new(
            MemoryKind::ThinkingStep,
            format!("{} step: {}", step.stage, step.title),
            content,
        )
        .with_metadata(metadata);
        let importance = self.importance.score(&memory);
        let memory_id = self.remember_locked(&project_id, memory, importance).await?;
        step.memory_id = Some(memory_id);

        self.link_inner(Relationship::new(
            EntityRef::memory(memory_id),
            EntityRef::thinking_chain(chain.id),
            RelationshipKind::Implements,
            step.confidence,
        )?)
        .await?;

        chain.push_step(step.clone())?;
        self.repo.upsert_thinking_chain(&chain).await?;
        debug!("思维链 {} 追加步骤 ({})", chain.id, step.stage);
        Ok(step)
    }

    pub async fn complete_thinking_chain(
        &self,
        chain_id: Uuid,
        summary: Option<String>,
    ) -> Result<ThinkingChain> {
        self.finish_chain(chain_id, ChainStatus::Completed, summary)
            .await
    }

    pub async fn abandon_thinking_chain(
        &self,
        chain_id: Uuid,
        reason: Option<String>,
    ) -> Result<ThinkingChain> {
        self.finish_chain(chain_id, ChainStatus::Abandoned, reason)
            .await
    }

    async fn finish_chain(
        &self,
        chain_id: Uuid,
        status: ChainStatus,
        summary: Option<String>,
    ) -> Result<ThinkingChain> {
        let _permit = self.permit().await?;
        let project_id = self.load_chain(chain_id).await?.project_id;
        let _guard = self.locks.acquire(&project_id).await;

        let mut chain = self.load_chain(chain_id).await?;
        chain.finish(status, summary, Utc::now())?;
        self.repo.upsert_thinking_chain(&chain).await?;
        info!(
            "思维链 {} 已结束 ({:?}), 共 {} 个步骤",
            chain.id,
            status,
            chain.steps.len()
        );
        Ok(chain)
    }

    pub async fn get_thinking_chain(&self, id: Uuid) -> Result<ThinkingChain> {
        let _permit = self.permit().await?;
        self.load_chain(id).await
    }

    /// 最近创建的思维链在前
    pub async fn list_thinking_chains(
        &self,
        project_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ThinkingChain>> {
        let _permit = self.permit().await?;
        self.require_project(project_id).await?;
        let mut chains = self.repo.list_thinking_chains(project_id).await?;
        chains.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            chains.truncate(limit);
        }
        Ok(chains)
    }

    // ---- 上下文 ----

    /// 最相关的几条记忆和待办任务
    pub async fn memory_context(
        &self,
        project_id: &str,
        query: Option<&str>,
    ) -> Result<MemoryContext> {
        let _permit = self.permit().await?;
        let project = self.require_project(project_id).await?;

        let recalled = self
            .recall_inner(
                project_id,
                query.unwrap_or(""),
                &RecallOptions::new(CONTEXT_MEMORY_LIMIT),
            )
            .await?;
        let tasks = self
            .list_tasks_inner(project_id, Some(TaskStatus::Pending), Some(CONTEXT_TASK_LIMIT))
            .await?;

        Ok(MemoryContext {
            project_id: project.id,
            project_name: project.name,
            memories: recalled.items.iter().map(ContextMemory::from).collect(),
            pending_tasks: tasks.iter().map(ContextTask::from).collect(),
            degraded: recalled.degraded,
        })
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let _permit = self.permit().await?;
        Ok(EngineStats {
            repository: self.repo.stats().await?,
            graph: self.graph.read().await.stats(),
            embedding_provider: self.embeddings.identity(),
        })
    }
}

fn canonical_or_raw(entity: &EntityRef) -> EntityRef {
    entity.canonical().unwrap_or_else(|| entity.clone())
}
