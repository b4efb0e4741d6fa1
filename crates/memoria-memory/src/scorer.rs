//! 相关性评分器
//!
//! 将语义相似度、重要性、时间新近度 (以及可选的访问频率) 按权重混合成
//! [0, 1] 内的分数。缺失的信号不参与加权，分母只累加可用信号的权重，
//! 因此没有向量的记忆不会因为相似度为 0 而被压低。
//!
//! 纯计算，不访问存储。

use chrono::{DateTime, Utc};
use memoria_core::{Result, ScoringWeights};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::embedding::cosine_similarity;
use crate::types::{Memory, StoredEmbedding};

/// 各项信号的取值，None 表示该信号不可用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub similarity: Option<f64>,
    pub importance: f64,
    pub recency: f64,
    pub frequency: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f64,
    pub signals: SignalBreakdown,
}

pub struct RelevanceScorer {
    weights: ScoringWeights,
}

impl RelevanceScorer {
    pub fn new(weights: ScoringWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// 按查询向量对候选记忆打分并排序 (分数高者在前)
    pub fn score(
        &self,
        query: Option<&StoredEmbedding>,
        candidates: Vec<Memory>,
        now: DateTime<Utc>,
    ) -> Vec<ScoredMemory> {
        Self::score_with(&self.weights, query, candidates, now)
    }

    /// 无查询的中性排序，用于容量淘汰 (排在末尾的最先淘汰)
    pub fn rank_for_retention(&self, candidates: Vec<Memory>, now: DateTime<Utc>) -> Vec<ScoredMemory> {
        Self::score_with(&self.weights.without_similarity(), None, candidates, now)
    }

    fn score_with(
        weights: &ScoringWeights,
        query: Option<&StoredEmbedding>,
        candidates: Vec<Memory>,
        now: DateTime<Utc>,
    ) -> Vec<ScoredMemory> {
        let max_access = candidates.iter().map(|m| m.access_count).max().unwrap_or(0);

        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .map(|memory| {
                let signals = SignalBreakdown {
                    similarity: similarity(query, &memory),
                    importance: memory.importance.clamp(0.0, 1.0) as f64,
                    recency: recency(&memory, now, weights.recency_half_life_hours),
                    frequency: (weights.frequency_weight > 0.0)
                        .then(|| frequency(memory.access_count, max_access)),
                };
                let score = blend(weights, &signals);
                ScoredMemory {
                    memory,
                    score,
                    signals,
                }
            })
            .collect();

        scored.sort_by(compare_ranked);
        scored
    }
}

fn similarity(query: Option<&StoredEmbedding>, memory: &Memory) -> Option<f64> {
    let query = query?;
    let embedding = memory.embedding.as_ref()?;
    if !embedding.is_comparable(query) {
        return None;
    }
    Some((cosine_similarity(&query.vector, &embedding.vector) as f64).clamp(0.0, 1.0))
}

/// 0.5^(闲置小时数 / 半衰期)，下限为最小正数
pub fn recency(memory: &Memory, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    let age_ms = (now - memory.last_activity()).num_milliseconds().max(0) as f64;
    let age_hours = age_ms / 3_600_000.0;
    0.5f64
        .powf(age_hours / half_life_hours)
        .clamp(f64::MIN_POSITIVE, 1.0)
}

fn frequency(access_count: u64, max_access: u64) -> f64 {
    if max_access == 0 {
        return 0.0;
    }
    ((1.0 + access_count as f64).ln() / (1.0 + max_access as f64).ln()).clamp(0.0, 1.0)
}

fn blend(weights: &ScoringWeights, signals: &SignalBreakdown) -> f64 {
    let mut total = weights.importance_weight * signals.importance
        + weights.recency_weight * signals.recency;
    let mut denominator = weights.importance_weight + weights.recency_weight;

    if let Some(similarity) = signals.similarity {
        total += weights.similarity_weight * similarity;
        denominator += weights.similarity_weight;
    }
    if let Some(frequency) = signals.frequency {
        total += weights.frequency_weight * frequency;
        denominator += weights.frequency_weight;
    }

    if denominator <= 0.0 {
        return 0.0;
    }
    (total / denominator).clamp(0.0, 1.0)
}

/// 全序：分数降序、重要性降序、更新时间降序、ID 升序
pub fn compare_ranked(a: &ScoredMemory, b: &ScoredMemory) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.memory.importance.total_cmp(&a.memory.importance))
        .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
        .then_with(|| a.memory.id.cmp(&b.memory.id))
}
