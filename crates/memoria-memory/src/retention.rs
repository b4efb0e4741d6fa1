//! 保留管理
//!
//! 单个项目的一次维护依次执行：
//! 1. 合并重复记忆并把边改接到保留者
//! 2. 清理长期未活动且重要性低的记忆
//! 3. 超出容量时按中性排序淘汰
//! 4. 清理过期的已结束任务
//! 5. 清理端点已不存在的边
//!
//! 没有新数据时重复执行得到空报告。

use chrono::{DateTime, Duration, Utc};
use memoria_core::{Result, RetentionConfig, ScoringWeights};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::fingerprint::{normalize, Fingerprint};
use crate::knowledge_graph::KnowledgeGraph;
use crate::scorer::RelevanceScorer;
use crate::store::MemoryRepository;
use crate::types::{EntityRef, Memory};

/// 一次维护的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub project_id: String,
    pub duplicates_merged: usize,
    pub memories_expired: usize,
    pub memories_evicted: usize,
    pub tasks_expired: usize,
    pub edges_repointed: usize,
    pub edges_pruned: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MaintenanceReport {
    fn new(project_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            project_id: project_id.to_string(),
            duplicates_merged: 0,
            memories_expired: 0,
            memories_evicted: 0,
            tasks_expired: 0,
            edges_repointed: 0,
            edges_pruned: 0,
            started_at,
            finished_at: started_at,
        }
    }

    /// 没有任何变更
    pub fn is_empty(&self) -> bool {
        self.duplicates_merged == 0
            && self.memories_expired == 0
            && self.memories_evicted == 0
            && self.tasks_expired == 0
            && self.edges_repointed == 0
            && self.edges_pruned == 0
    }

    /// 被删除的记忆总数
    pub fn memories_removed(&self) -> usize {
        self.duplicates_merged + self.memories_expired + self.memories_evicted
    }
}

pub struct RetentionManager {
    config: RetentionConfig,
    scorer: RelevanceScorer,
}

impl RetentionManager {
    pub fn new(config: RetentionConfig, weights: ScoringWeights) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            scorer: RelevanceScorer::new(weights)?,
        })
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub async fn run_maintenance(
        &self,
        repo: &dyn MemoryRepository,
        graph: &RwLock<KnowledgeGraph>,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::new(project_id, Utc::now());

        if self.config.merge_duplicates {
            self.merge_duplicates(repo, graph, project_id, &mut report).await?;
        }
        self.expire_memories(repo, project_id, now, &mut report).await?;
        self.enforce_cap(repo, project_id, now, &mut report).await?;
        self.expire_tasks(repo, project_id, now, &mut report).await?;
        Self::prune_orphan_edges(repo, graph, &mut report).await?;

        report.finished_at = Utc::now();
        if report.is_empty() {
            debug!("项目 {} 维护完成，无变更", project_id);
        } else {
            info!(
                "项目 {} 维护完成: 合并 {}, 过期 {}, 淘汰 {}, 任务 {}, 改接边 {}, 清理边 {}",
                project_id,
                report.duplicates_merged,
                report.memories_expired,
                report.memories_evicted,
                report.tasks_expired,
                report.edges_repointed,
                report.edges_pruned
            );
        }
        Ok(report)
    }

    async fn merge_duplicates(
        &self,
        repo: &dyn MemoryRepository,
        graph: &RwLock<KnowledgeGraph>,
        project_id: &str,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        let memories = repo.fetch_candidates(project_id, None).await?;

        let mut groups: BTreeMap<(Fingerprint, String), Vec<Memory>> = BTreeMap::new();
        for memory in memories {
            let key = (memory.fingerprint.clone(), normalize(&memory.content));
            groups.entry(key).or_default().push(memory);
        }

        for (_, mut group) in groups {
            if group.len() < 2 {
                continue;
            }

            group.sort_by(survivor_order);
            let mut survivor = group.remove(0);
            for loser in &group {
                fold_into(&mut survivor, loser);
            }
            repo.update_memory(&survivor).await?;

            // 访问统计累加到存储中的当前值，而不是快照
            let absorbed: u64 = group.iter().map(|m| m.access_count).sum();
            let latest = group
                .iter()
                .map(|m| m.last_accessed)
                .fold(survivor.last_accessed, |a, b| a.max(b));
            repo.add_access(survivor.id, absorbed, latest).await?;

            let survivor_ref = EntityRef::memory(survivor.id);
            for loser in &group {
                let loser_ref = EntityRef::memory(loser.id);
                let plan = graph.read().await.plan_repoint(&loser_ref, &survivor_ref);
                for edge in &plan.updated {
                    repo.update_relationship(edge).await?;
                }
                for id in &plan.dropped {
                    repo.delete_relationship(*id).await?;
                }
                graph.write().await.apply_repoint(&plan);
                report.edges_repointed += plan.updated.len();
                report.edges_pruned += plan.dropped.len();

                repo.delete_memory(loser.id).await?;
                report.duplicates_merged += 1;
                debug!("重复记忆 {} 已合并到 {}", loser.id, survivor.id);
            }
        }
        Ok(())
    }

    async fn expire_memories(
        &self,
        repo: &dyn MemoryRepository,
        project_id: &str,
        now: DateTime<Utc>,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        let cutoff = now - Duration::days(self.config.memory_max_age_days as i64);
        let expired: Vec<Memory> = repo
            .fetch_candidates(project_id, None)
            .await?
            .into_iter()
            .filter(|m| m.last_activity() < cutoff && m.importance < self.config.importance_floor)
            .collect();

        for memory in expired {
            if repo.delete_memory(memory.id).await? {
                report.memories_expired += 1;
            }
        }
        Ok(())
    }

    async fn enforce_cap(
        &self,
        repo: &dyn MemoryRepository,
        project_id: &str,
        now: DateTime<Utc>,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        let memories = repo.fetch_candidates(project_id, None).await?;
        let cap = self.config.max_memory_items;
        if memories.len() <= cap {
            return Ok(());
        }

        let newest = memories
            .iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|m| m.id);

        let mut remaining = memories.len();
        let ranked = self.scorer.rank_for_retention(memories, now);

        // 排名越靠后越先淘汰
        for scored in ranked.iter().rev() {
            if remaining <= cap {
                break;
            }
            if self.config.protect_newest && Some(scored.memory.id) == newest {
                continue;
            }
            if repo.delete_memory(scored.memory.id).await? {
                report.memories_evicted += 1;
            }
            remaining -= 1;
        }
        Ok(())
    }

    async fn expire_tasks(
        &self,
        repo: &dyn MemoryRepository,
        project_id: &str,
        now: DateTime<Utc>,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        let cutoff = now - Duration::days(self.config.task_max_age_days as i64);
        for task in repo.list_tasks(project_id).await? {
            let expired = task.finished_at().is_some_and(|finished| finished < cutoff);
            if expired && repo.delete_task(task.id).await? {
                report.tasks_expired += 1;
            }
        }
        Ok(())
    }

    /// 全局清理端点已不存在的边
    async fn prune_orphan_edges(
        repo: &dyn MemoryRepository,
        graph: &RwLock<KnowledgeGraph>,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        let edges: Vec<_> = graph
            .read()
            .await
            .edges()
            .map(|e| (e.id, e.from.clone(), e.to.clone()))
            .collect();

        let mut exists: HashMap<EntityRef, bool> = HashMap::new();
        for (id, from, to) in edges {
            let mut orphan = false;
            for endpoint in [from, to] {
                let present = match exists.get(&endpoint) {
                    Some(present) => *present,
                    None => {
                        let present = repo.entity_exists(&endpoint).await?;
                        exists.insert(endpoint, present);
                        present
                    }
                };
                if !present {
                    orphan = true;
                    break;
                }
            }

            if orphan {
                let deleted = repo.delete_relationship(id).await?;
                graph.write().await.remove_edge(id);
                // 并发维护的其他项目可能已删除同一条边
                if deleted {
                    report.edges_pruned += 1;
                }
            }
        }
        Ok(())
    }
}

/// 保留者优先：重要性高、更新时间晚、ID 大
fn survivor_order(a: &Memory, b: &Memory) -> std::cmp::Ordering {
    b.importance
        .total_cmp(&a.importance)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// 合并内容字段；访问统计另行累加
fn fold_into(survivor: &mut Memory, loser: &Memory) {
    survivor.created_at = survivor.created_at.min(loser.created_at);
    survivor.tags.extend(loser.tags.iter().cloned());
    survivor.metadata.merge_missing(&loser.metadata);
    if survivor.embedding.is_none() {
        survivor.embedding = loser.embedding.clone();
    }
    if survivor.file_path.is_none() {
        survivor.file_path = loser.file_path.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_graph::{Relationship, RelationshipKind};
    use crate::store::InMemoryRepository;
    use crate::tasks::{NewTask, Task, TaskStatus};
    use crate::types::{MemoryId, MemoryKind};
    use memoria_core::Metadata;

    struct Fixture {
        repo: InMemoryRepository,
        graph: RwLock<KnowledgeGraph>,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                repo: InMemoryRepository::new(),
                graph: RwLock::new(KnowledgeGraph::new()),
                now: Utc::now(),
            }
        }

        async fn add(&self, content: &str, importance: f32, age_days: i64) -> MemoryId {
            let memory = Memory::new(Some("p".to_string()), MemoryKind::Code, "t", content)
                .with_importance(importance)
                .with_created_at(self.now - Duration::days(age_days));
            self.repo.insert_memory(memory).await.unwrap()
        }

        async fn link(&self, from: EntityRef, to: EntityRef) {
            let rel = Relationship::new(from, to, RelationshipKind::RelatesTo, 0.7).unwrap();
            let id = self.repo.insert_relationship(rel.clone()).await.unwrap();
            let mut stored = rel;
            stored.id = id;
            self.graph.write().await.add_edge(stored);
        }

        async fn run(&self, manager: &RetentionManager) -> MaintenanceReport {
            manager
                .run_maintenance(&self.repo, &self.graph, "p", self.now)
                .await
                .unwrap()
        }
    }

    fn manager(config: RetentionConfig) -> RetentionManager {
        RetentionManager::new(config, ScoringWeights::default()).unwrap()
    }

    #[tokio::test]
    async fn test_cap_keeps_important_recent_memory() {
        let fx = Fixture::new();
        let m1 = fx.add("M1", 0.9, 0).await;
        let m2 = fx.add("M2", 0.1, 100).await;

        let manager = manager(RetentionConfig {
            max_memory_items: 1,
            ..Default::default()
        });
        let report = fx.run(&manager).await;

        assert_eq!(report.memories_removed(), 1);
        assert!(fx.repo.get_memory(m1).await.unwrap().is_some());
        assert!(fx.repo.get_memory(m2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cap_eviction_by_rank() {
        let fx = Fixture::new();
        let low = fx.add("low", 0.4, 10).await;
        let mid = fx.add("mid", 0.6, 10).await;
        let high = fx.add("high", 0.9, 10).await;

        let manager = manager(RetentionConfig {
            max_memory_items: 2,
            ..Default::default()
        });
        let report = fx.run(&manager).await;

        assert_eq!(report.memories_evicted, 1);
        assert!(fx.repo.get_memory(low).await.unwrap().is_none());
        assert!(fx.repo.get_memory(mid).await.unwrap().is_some());
        assert!(fx.repo.get_memory(high).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_newest_memory_is_protected() {
        let fx = Fixture::new();
        let old_important = fx.add("old", 0.95, 5).await;
        let newest = fx.add("new", 0.35, 0).await;

        let manager = manager(RetentionConfig {
            max_memory_items: 0,
            ..Default::default()
        });
        let report = fx.run(&manager).await;

        assert_eq!(report.memories_evicted, 1);
        assert!(fx.repo.get_memory(newest).await.unwrap().is_some());
        assert!(fx.repo.get_memory(old_important).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_age_cleanup_respects_importance_floor() {
        let fx = Fixture::new();
        let old_low = fx.add("old low", 0.1, 200).await;
        let old_high = fx.add("old high", 0.8, 200).await;
        let new_low = fx.add("new low", 0.1, 1).await;

        let report = fx.run(&manager(RetentionConfig::default())).await;

        assert_eq!(report.memories_expired, 1);
        assert!(fx.repo.get_memory(old_low).await.unwrap().is_none());
        assert!(fx.repo.get_memory(old_high).await.unwrap().is_some());
        assert!(fx.repo.get_memory(new_low).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recent_access_prevents_expiry() {
        let fx = Fixture::new();
        let id = fx.add("old but used", 0.1, 200).await;
        fx.repo.record_access(&[id], fx.now).await.unwrap();

        let report = fx.run(&manager(RetentionConfig::default())).await;
        assert_eq!(report.memories_expired, 0);
    }

    #[tokio::test]
    async fn test_duplicate_merge_folds_and_repoints() {
        let fx = Fixture::new();
        let mut first = Memory::new(Some("p".to_string()), MemoryKind::Code, "a", "Fix the login bug")
            .with_importance(0.4)
            .with_tags(["auth"]);
        first.access_count = 2;
        first.metadata = Metadata::new().with("source", "first").with("file", "login.rs");
        let first = fx.repo.insert_memory(first).await.unwrap();

        let mut second = Memory::new(Some("p".to_string()), MemoryKind::Code, "b", "fix  the LOGIN bug")
            .with_importance(0.7)
            .with_tags(["bug"]);
        second.access_count = 3;
        second.metadata = Metadata::new().with("source", "second");
        let second = fx.repo.insert_memory(second).await.unwrap();

        let other = fx.add("unrelated", 0.5, 0).await;
        fx.link(EntityRef::memory(first), EntityRef::memory(other)).await;
        fx.link(EntityRef::memory(first), EntityRef::memory(second)).await;

        let report = fx.run(&manager(RetentionConfig::default())).await;
        assert_eq!(report.duplicates_merged, 1);
        assert_eq!(report.edges_repointed, 1);
        assert_eq!(report.edges_pruned, 1);

        assert!(fx.repo.get_memory(first).await.unwrap().is_none());
        let survivor = fx.repo.get_memory(second).await.unwrap().unwrap();
        assert_eq!(survivor.access_count, 5);
        assert!(survivor.tags.contains("auth") && survivor.tags.contains("bug"));
        assert_eq!(survivor.metadata.get_str("source"), Some("second"));
        assert_eq!(survivor.metadata.get_str("file"), Some("login.rs"));

        let graph = fx.graph.read().await;
        let edges = graph.edges_from(&EntityRef::memory(second));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, EntityRef::memory(other));
        assert!(graph.edges_from(&EntityRef::memory(first)).is_empty());
        assert_eq!(fx.repo.list_relationships().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_edges_are_pruned() {
        let fx = Fixture::new();
        let a = fx.add("a", 0.5, 0).await;
        let b = fx.add("b", 0.5, 0).await;
        fx.link(EntityRef::memory(a), EntityRef::memory(b)).await;
        fx.link(EntityRef::memory(b), EntityRef::memory(a)).await;

        fx.repo.delete_memory(b).await.unwrap();
        let report = fx.run(&manager(RetentionConfig::default())).await;

        assert_eq!(report.edges_pruned, 2);
        let graph = fx.graph.read().await;
        assert!(graph.edges_to(&EntityRef::memory(b)).is_empty());
        assert!(graph.edges_from(&EntityRef::memory(b)).is_empty());
        assert!(fx.repo.list_relationships().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edge_already_deleted_is_not_counted() {
        let fx = Fixture::new();
        let a = fx.add("a", 0.5, 0).await;
        let b = fx.add("b", 0.5, 0).await;
        fx.link(EntityRef::memory(a), EntityRef::memory(b)).await;
        fx.repo.delete_memory(b).await.unwrap();

        // 另一项目的维护已先一步删除了这条孤立边
        let edge_id = fx.repo.list_relationships().await.unwrap()[0].id;
        assert!(fx.repo.delete_relationship(edge_id).await.unwrap());

        let report = fx.run(&manager(RetentionConfig::default())).await;
        assert_eq!(report.edges_pruned, 0);
        assert!(fx.graph.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_old_terminal_tasks_are_removed() {
        let fx = Fixture::new();
        let mut done = Task::new("p", NewTask::new("old", ""));
        done.status = TaskStatus::Completed;
        done.completed_at = Some(fx.now - Duration::days(40));
        let done = fx.repo.insert_task(done).await.unwrap();

        let mut cancelled = Task::new("p", NewTask::new("old cancel", ""));
        cancelled.status = TaskStatus::Cancelled;
        cancelled.updated_at = fx.now - Duration::days(31);
        let cancelled = fx.repo.insert_task(cancelled).await.unwrap();

        let mut recent = Task::new("p", NewTask::new("recent", ""));
        recent.status = TaskStatus::Completed;
        recent.completed_at = Some(fx.now - Duration::days(2));
        let recent = fx.repo.insert_task(recent).await.unwrap();

        let mut pending = Task::new("p", NewTask::new("pending", ""));
        pending.created_at = fx.now - Duration::days(300);
        pending.updated_at = pending.created_at;
        let pending = fx.repo.insert_task(pending).await.unwrap();

        let report = fx.run(&manager(RetentionConfig::default())).await;
        assert_eq!(report.tasks_expired, 2);
        assert!(fx.repo.get_task(done).await.unwrap().is_none());
        assert!(fx.repo.get_task(cancelled).await.unwrap().is_none());
        assert!(fx.repo.get_task(recent).await.unwrap().is_some());
        assert!(fx.repo.get_task(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_maintenance_is_idempotent() {
        let fx = Fixture::new();
        fx.add("dup", 0.5, 0).await;
        fx.add("DUP", 0.6, 0).await;
        fx.add("stale", 0.1, 400).await;
        for i in 0..5 {
            fx.add(&format!("filler {}", i), 0.5, i).await;
        }
        let a = fx.add("a", 0.5, 0).await;
        fx.link(EntityRef::memory(a), EntityRef::memory(MemoryId(999))).await;

        let manager = manager(RetentionConfig {
            max_memory_items: 4,
            ..Default::default()
        });
        let first = fx.run(&manager).await;
        assert!(!first.is_empty());
        assert_eq!(fx.repo.count_memories("p").await.unwrap(), 4);

        let second = fx.run(&manager).await;
        assert!(second.is_empty(), "second run should be empty: {:?}", second);
    }
}
