//! 知识图谱模块
//!
//! 记忆、任务、项目、会话和思维链之间的有向关系边：
//! - 关系边的增删和按端点查询
//! - 有深度上限的广度优先遍历
//! - 重复合并时的边重定向
//!
//! 图本身是纯内存索引，不做任何 I/O；持久化由调用方先写存储再更新图。

use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, Metadata, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::types::{EdgeId, EntityRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    DependsOn,
    RelatesTo,
    ConflictsWith,
    Implements,
    References,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::DependsOn => "depends_on",
            RelationshipKind::RelatesTo => "relates_to",
            RelationshipKind::ConflictsWith => "conflicts_with",
            RelationshipKind::Implements => "implements",
            RelationshipKind::References => "references",
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipKind {
    type Err = MemoriaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "depends_on" => Ok(RelationshipKind::DependsOn),
            "relates_to" => Ok(RelationshipKind::RelatesTo),
            "conflicts_with" => Ok(RelationshipKind::ConflictsWith),
            "implements" => Ok(RelationshipKind::Implements),
            "references" => Ok(RelationshipKind::References),
            _ => Err(MemoriaError::Invalid(format!("未知的关系类型: {}", s))),
        }
    }
}

/// 有向关系边
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: EdgeId,
    pub from: EntityRef,
    pub to: EntityRef,
    pub kind: RelationshipKind,
    pub strength: f32,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl Relationship {
    /// 构造尚未持久化的关系 (id 由存储分配)
    pub fn new(from: EntityRef, to: EntityRef, kind: RelationshipKind, strength: f32) -> Result<Self> {
        if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
            return Err(MemoriaError::Invalid(format!(
                "关系强度必须在 [0, 1] 内, 实际为 {}",
                strength
            )));
        }
        Ok(Self {
            id: EdgeId(0),
            from,
            to,
            kind,
            strength,
            created_at: Utc::now(),
            metadata: Metadata::new(),
        })
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn touches(&self, entity: &EntityRef) -> bool {
        &self.from == entity || &self.to == entity
    }
}

/// 遍历过滤条件
#[derive(Debug, Clone, Default)]
pub struct TraversalFilter {
    /// 只沿这些类型的边前进，None 表示全部
    pub kinds: Option<HashSet<RelationshipKind>>,
    /// 只沿强度不低于此值的边前进
    pub min_strength: Option<f32>,
}

impl TraversalFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kinds<I: IntoIterator<Item = RelationshipKind>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_min_strength(mut self, min_strength: f32) -> Self {
        self.min_strength = Some(min_strength);
        self
    }

    fn accepts(&self, edge: &Relationship) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&edge.kind) {
                return false;
            }
        }
        match self.min_strength {
            Some(min) => edge.strength >= min,
            None => true,
        }
    }
}

/// 遍历命中的实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalHit {
    pub entity: EntityRef,
    pub depth: usize,
    /// 路径上各边强度之积
    pub path_strength: f32,
    /// 到达该实体的最后一条边
    pub via: EdgeId,
}

/// 重定向计划：需要改写端点的边和因成为自环而删除的边
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepointPlan {
    pub updated: Vec<Relationship>,
    pub dropped: Vec<EdgeId>,
}

impl RepointPlan {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.dropped.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updated.len() + self.dropped.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeGraphStats {
    pub relation_count: usize,
    pub entity_count: usize,
    pub relation_kinds: BTreeMap<String, usize>,
}

pub struct KnowledgeGraph {
    edges: BTreeMap<EdgeId, Relationship>,
    outgoing: HashMap<EntityRef, BTreeSet<EdgeId>>,
    incoming: HashMap<EntityRef, BTreeSet<EdgeId>>,
    max_depth_limit: usize,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::with_depth_limit(10)
    }

    pub fn with_depth_limit(max_depth_limit: usize) -> Self {
        Self {
            edges: BTreeMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            max_depth_limit,
        }
    }

    /// 由已持久化的边构建
    pub fn from_edges<I: IntoIterator<Item = Relationship>>(max_depth_limit: usize, edges: I) -> Self {
        let mut graph = Self::with_depth_limit(max_depth_limit);
        for edge in edges {
            graph.add_edge(edge);
        }
        graph
    }

    pub fn add_edge(&mut self, edge: Relationship) {
        if let Some(previous) = self.edges.get(&edge.id).cloned() {
            self.unindex(&previous);
        }
        self.outgoing
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.id);
        self.incoming.entry(edge.to.clone()).or_default().insert(edge.id);
        self.edges.insert(edge.id, edge);
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> Option<Relationship> {
        let edge = self.edges.remove(&id)?;
        self.unindex(&edge);
        Some(edge)
    }

    /// 删除与实体相连的全部边，返回被删除的边 ID (重复调用返回空)
    pub fn remove_edges_for(&mut self, entity: &EntityRef) -> Vec<EdgeId> {
        let ids = self.edge_ids_for(entity);
        for id in &ids {
            self.remove_edge(*id);
        }
        ids
    }

    /// 与实体相连的全部边 ID (升序)
    pub fn edge_ids_for(&self, entity: &EntityRef) -> Vec<EdgeId> {
        let mut ids: BTreeSet<EdgeId> = BTreeSet::new();
        if let Some(out) = self.outgoing.get(entity) {
            ids.extend(out.iter().copied());
        }
        if let Some(inc) = self.incoming.get(entity) {
            ids.extend(inc.iter().copied());
        }
        ids.into_iter().collect()
    }

    pub fn get(&self, id: EdgeId) -> Option<&Relationship> {
        self.edges.get(&id)
    }

    pub fn edges_from(&self, entity: &EntityRef) -> Vec<Relationship> {
        self.collect(self.outgoing.get(entity))
    }

    pub fn edges_to(&self, entity: &EntityRef) -> Vec<Relationship> {
        self.collect(self.incoming.get(entity))
    }

    pub fn edges(&self) -> impl Iterator<Item = &Relationship> {
        self.edges.values()
    }

    /// 图中出现过的全部端点
    pub fn entities(&self) -> BTreeSet<EntityRef> {
        self.outgoing
            .keys()
            .chain(self.incoming.keys())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// 从起点沿出边做广度优先遍历
    ///
    /// 起点本身不出现在结果中；`max_depth == 0` 返回空。每个实体只在最浅
    /// 的深度出现一次，同深度下取路径强度最大的那条路径。结果按深度升序、
    /// 路径强度降序、实体升序排列。
    pub fn traverse(
        &self,
        start: &EntityRef,
        max_depth: usize,
        filter: &TraversalFilter,
    ) -> Result<Vec<TraversalHit>> {
        if max_depth > self.max_depth_limit {
            return Err(MemoriaError::Invalid(format!(
                "遍历深度 {} 超过上限 {}",
                max_depth, self.max_depth_limit
            )));
        }

        let mut visited: HashSet<EntityRef> = HashSet::new();
        visited.insert(start.clone());

        let mut hits = Vec::new();
        let mut frontier: Vec<(EntityRef, f32)> = vec![(start.clone(), 1.0)];

        for depth in 1..=max_depth {
            let mut level: BTreeMap<EntityRef, (f32, EdgeId)> = BTreeMap::new();

            for (entity, strength) in &frontier {
                let Some(out) = self.outgoing.get(entity) else {
                    continue;
                };
                for edge in out.iter().filter_map(|id| self.edges.get(id)) {
                    if visited.contains(&edge.to) || !filter.accepts(edge) {
                        continue;
                    }
                    let path_strength = strength * edge.strength;
                    let better = match level.get(&edge.to) {
                        Some((best, _)) => path_strength > *best,
                        None => true,
                    };
                    if better {
                        level.insert(edge.to.clone(), (path_strength, edge.id));
                    }
                }
            }

            if level.is_empty() {
                break;
            }

            frontier = Vec::with_capacity(level.len());
            for (entity, (path_strength, via)) in level {
                visited.insert(entity.clone());
                frontier.push((entity.clone(), path_strength));
                hits.push(TraversalHit {
                    entity,
                    depth,
                    path_strength,
                    via,
                });
            }
        }

        hits.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| b.path_strength.total_cmp(&a.path_strength))
                .then_with(|| a.entity.cmp(&b.entity))
        });
        Ok(hits)
    }

    /// 计算把 `from` 的所有边改接到 `to` 所需的变更，不修改图
    pub fn plan_repoint(&self, from: &EntityRef, to: &EntityRef) -> RepointPlan {
        let mut plan = RepointPlan::default();
        if from == to {
            return plan;
        }

        for id in self.edge_ids_for(from) {
            let Some(edge) = self.edges.get(&id) else {
                continue;
            };
            let mut moved = edge.clone();
            if &moved.from == from {
                moved.from = to.clone();
            }
            if &moved.to == from {
                moved.to = to.clone();
            }
            if moved.from == moved.to {
                plan.dropped.push(id);
            } else {
                plan.updated.push(moved);
            }
        }
        plan
    }

    pub fn apply_repoint(&mut self, plan: &RepointPlan) {
        for id in &plan.dropped {
            self.remove_edge(*id);
        }
        for edge in &plan.updated {
            self.add_edge(edge.clone());
        }
    }

    /// 把 `from` 的所有边改接到 `to`，自环直接删除
    pub fn repoint(&mut self, from: &EntityRef, to: &EntityRef) -> RepointPlan {
        let plan = self.plan_repoint(from, to);
        self.apply_repoint(&plan);
        plan
    }

    pub fn stats(&self) -> KnowledgeGraphStats {
        let mut relation_kinds: BTreeMap<String, usize> = BTreeMap::new();
        for edge in self.edges.values() {
            *relation_kinds.entry(edge.kind.to_string()).or_insert(0) += 1;
        }
        KnowledgeGraphStats {
            relation_count: self.edges.len(),
            entity_count: self.entities().len(),
            relation_kinds,
        }
    }

    pub fn clear(&mut self) {
        self.edges.clear();
        self.outgoing.clear();
        self.incoming.clear();
    }

    fn collect(&self, ids: Option<&BTreeSet<EdgeId>>) -> Vec<Relationship> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.edges.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }

    fn unindex(&mut self, edge: &Relationship) {
        if let Some(out) = self.outgoing.get_mut(&edge.from) {
            out.remove(&edge.id);
            if out.is_empty() {
                self.outgoing.remove(&edge.from);
            }
        }
        if let Some(inc) = self.incoming.get_mut(&edge.to) {
            inc.remove(&edge.id);
            if inc.is_empty() {
                self.incoming.remove(&edge.to);
            }
        }
    }
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryId, TaskId};

    fn m(id: u64) -> EntityRef {
        EntityRef::memory(MemoryId(id))
    }

    fn edge(id: u64, from: EntityRef, to: EntityRef, kind: RelationshipKind, strength: f32) -> Relationship {
        let mut rel = Relationship::new(from, to, kind, strength).unwrap();
        rel.id = EdgeId(id);
        rel
    }

    #[test]
    fn test_relationship_strength_validation() {
        assert!(Relationship::new(m(1), m(2), RelationshipKind::RelatesTo, 1.5).is_err());
        assert!(Relationship::new(m(1), m(2), RelationshipKind::RelatesTo, -0.1).is_err());
        assert!(Relationship::new(m(1), m(2), RelationshipKind::RelatesTo, f32::NAN).is_err());
        assert!(Relationship::new(m(1), m(2), RelationshipKind::RelatesTo, 0.0).is_ok());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("depends-on".parse::<RelationshipKind>().unwrap(), RelationshipKind::DependsOn);
        assert!("likes".parse::<RelationshipKind>().is_err());
    }

    #[test]
    fn test_edges_are_directed() {
        let mut graph = KnowledgeGraph::new();
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::RelatesTo, 0.8));

        assert_eq!(graph.edges_from(&m(1)).len(), 1);
        assert!(graph.edges_from(&m(2)).is_empty());
        assert_eq!(graph.edges_to(&m(2)).len(), 1);
    }

    #[test]
    fn test_traverse_depth_bounds() {
        let mut graph = KnowledgeGraph::new();
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::DependsOn, 0.9));
        graph.add_edge(edge(2, m(2), m(3), RelationshipKind::DependsOn, 0.9));

        let filter = TraversalFilter::new();
        let depth1 = graph.traverse(&m(1), 1, &filter).unwrap();
        assert_eq!(depth1.len(), 1);
        assert_eq!(depth1[0].entity, m(2));
        assert_eq!(depth1[0].depth, 1);

        assert!(graph.traverse(&m(1), 0, &filter).unwrap().is_empty());

        let depth2 = graph.traverse(&m(1), 2, &filter).unwrap();
        assert_eq!(depth2.len(), 2);
        assert_eq!(depth2[1].entity, m(3));
        assert!((depth2[1].path_strength - 0.81).abs() < 1e-6);

        assert!(graph.traverse(&m(1), 11, &filter).is_err());
    }

    #[test]
    fn test_traverse_handles_cycles() {
        let mut graph = KnowledgeGraph::new();
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(2, m(2), m(3), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(3, m(3), m(1), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(4, m(2), m(2), RelationshipKind::RelatesTo, 1.0));

        let hits = graph.traverse(&m(1), 10, &TraversalFilter::new()).unwrap();
        let entities: Vec<_> = hits.iter().map(|h| h.entity.clone()).collect();
        assert_eq!(entities, vec![m(2), m(3)]);
    }

    #[test]
    fn test_traverse_prefers_strongest_path_at_same_depth() {
        let mut graph = KnowledgeGraph::new();
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::RelatesTo, 0.2));
        graph.add_edge(edge(2, m(1), m(3), RelationshipKind::RelatesTo, 0.9));
        graph.add_edge(edge(3, m(2), m(4), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(4, m(3), m(4), RelationshipKind::RelatesTo, 1.0));

        let hits = graph.traverse(&m(1), 2, &TraversalFilter::new()).unwrap();
        assert_eq!(hits[0].entity, m(3));
        assert_eq!(hits[1].entity, m(2));
        let target = hits.iter().find(|h| h.entity == m(4)).unwrap();
        assert_eq!(target.via, EdgeId(4));
        assert!((target.path_strength - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_traverse_filter() {
        let mut graph = KnowledgeGraph::new();
        let task = EntityRef::task(TaskId(7));
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::RelatesTo, 0.3));
        graph.add_edge(edge(2, m(1), task.clone(), RelationshipKind::Implements, 0.9));

        let by_kind = graph
            .traverse(&m(1), 1, &TraversalFilter::new().with_kinds([RelationshipKind::Implements]))
            .unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].entity, task);

        let by_strength = graph
            .traverse(&m(1), 1, &TraversalFilter::new().with_min_strength(0.5))
            .unwrap();
        assert_eq!(by_strength.len(), 1);

        // 未提供下限时弱边也会被遍历
        assert_eq!(graph.traverse(&m(1), 1, &TraversalFilter::new()).unwrap().len(), 2);
    }

    #[test]
    fn test_remove_edges_for_is_idempotent() {
        let mut graph = KnowledgeGraph::new();
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(2, m(3), m(1), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(3, m(2), m(3), RelationshipKind::RelatesTo, 1.0));

        assert_eq!(graph.remove_edges_for(&m(1)), vec![EdgeId(1), EdgeId(2)]);
        assert!(graph.remove_edges_for(&m(1)).is_empty());
        assert_eq!(graph.len(), 1);
        assert!(graph.edges_to(&m(1)).is_empty());
    }

    #[test]
    fn test_repoint_drops_self_loops() {
        let mut graph = KnowledgeGraph::new();
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(2, m(3), m(1), RelationshipKind::DependsOn, 0.5));
        graph.add_edge(edge(3, m(2), m(1), RelationshipKind::References, 0.5));

        // m(2) 合并进 m(1)
        let plan = graph.repoint(&m(2), &m(1));
        assert_eq!(plan.dropped, vec![EdgeId(1), EdgeId(3)]);
        assert!(plan.updated.is_empty());
        assert_eq!(graph.len(), 1);

        // m(3) 合并进 m(4)
        let plan = graph.repoint(&m(3), &m(4));
        assert_eq!(plan.updated.len(), 1);
        assert_eq!(graph.edges_from(&m(4))[0].to, m(1));
        assert!(graph.edges_from(&m(3)).is_empty());
    }

    #[test]
    fn test_stats() {
        let mut graph = KnowledgeGraph::new();
        graph.add_edge(edge(1, m(1), m(2), RelationshipKind::RelatesTo, 1.0));
        graph.add_edge(edge(2, m(2), m(1), RelationshipKind::RelatesTo, 1.0));
        let stats = graph.stats();
        assert_eq!(stats.relation_count, 2);
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.relation_kinds.get("relates_to"), Some(&2));
    }
}
