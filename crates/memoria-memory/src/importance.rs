//! 重要性评分器
//!
//! 写入记忆时未指定重要性，则用此启发式估算。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{MemoryKind, NewMemory};

static ENTITY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // URL
        r"https?://[^\s]+",
        // 文件路径
        r"(?:[\w.-]+/)+[\w.-]+\.[A-Za-z0-9]{1,6}",
        // issue / PR 编号
        r"#\d{1,6}\b",
        // 邮箱
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
        // 日期
        r"\d{4}[-/年]\d{1,2}[-/月]\d{1,2}[日]?",
        // 版本号
        r"\bv?\d+\.\d+\.\d+\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

const IMPORTANT_KEYWORDS: &[&str] = &[
    "重要",
    "关键",
    "必须",
    "决定",
    "important",
    "critical",
    "must",
    "decision",
    "security",
    "breaking",
    "deprecated",
    "bug",
    "fix",
    "todo",
];

/// 记忆重要性评分器
pub struct ImportanceScorer {
    important_keywords: Vec<String>,
}

impl ImportanceScorer {
    pub fn new() -> Self {
        Self {
            important_keywords: IMPORTANT_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.important_keywords
            .extend(keywords.into_iter().map(|k| k.into().to_lowercase()));
        self
    }

    /// 计算记忆的重要性分数 (0.0 - 1.0)
    pub fn score(&self, memory: &NewMemory) -> f32 {
        let mut score = Self::base_score(memory.kind);

        let text = format!("{}\n{}", memory.title, memory.content);

        let entity_count = self.count_entities(&text);
        score += (entity_count as f32 * 0.05).min(0.2);

        let keyword_count = self.count_keywords(&text);
        score += (keyword_count as f32 * 0.05).min(0.2);

        // 中等长度的内容通常信息量更高
        let len = memory.content.chars().count();
        if len > 50 && len < 2000 {
            score += 0.1;
        }

        if text.contains('?') || text.contains('？') {
            score += 0.05;
        }

        if !memory.tags.is_empty() {
            score += 0.05;
        }

        score.clamp(0.0, 1.0)
    }

    fn base_score(kind: MemoryKind) -> f32 {
        match kind {
            MemoryKind::Decision => 0.5,
            MemoryKind::Error => 0.45,
            MemoryKind::Pattern => 0.4,
            MemoryKind::Code | MemoryKind::ThinkingChain => 0.35,
            MemoryKind::ThinkingStep => 0.3,
            MemoryKind::Conversation => 0.25,
        }
    }

    fn count_entities(&self, text: &str) -> usize {
        ENTITY_PATTERNS
            .iter()
            .map(|r| r.find_iter(text).count())
            .sum()
    }

    fn count_keywords(&self, text: &str) -> usize {
        let lower = text.to_lowercase();
        self.important_keywords
            .iter()
            .filter(|kw| lower.contains(kw.as_str()))
            .count()
    }
}

impl Default for ImportanceScorer {
    fn default() -> Self {
        Self::new()
    }
}
