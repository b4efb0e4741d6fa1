//! 配置管理
//!
//! 引擎的所有可调参数都集中在 [`EngineConfig`] 中，由调用方显式传入，
//! 引擎内部不保存任何进程级全局状态。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{MemoriaError, Result};

/// 引擎主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 相关性评分权重
    pub scoring: ScoringWeights,
    /// 保留策略
    pub retention: RetentionConfig,
    /// 知识图谱遍历限制
    pub graph: GraphConfig,
    /// 嵌入提供商
    pub embedding: EmbeddingConfig,
    /// 存储重试策略
    pub retry: RetryPolicy,
    /// 并发限制
    pub concurrency: ConcurrencyConfig,
}

/// 相关性评分权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// 语义相似度权重
    pub similarity_weight: f64,
    /// 重要性权重
    pub importance_weight: f64,
    /// 时间新近度权重
    pub recency_weight: f64,
    /// 访问频率权重 (默认关闭)
    pub frequency_weight: f64,
    /// 新近度半衰期 (小时)
    pub recency_half_life_hours: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            similarity_weight: 0.5,
            importance_weight: 0.3,
            recency_weight: 0.2,
            frequency_weight: 0.0,
            recency_half_life_hours: 168.0,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        let weights = [
            ("similarity_weight", self.similarity_weight),
            ("importance_weight", self.importance_weight),
            ("recency_weight", self.recency_weight),
            ("frequency_weight", self.frequency_weight),
        ];

        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(MemoriaError::Invalid(format!(
                    "{} 必须是非负有限数, 实际为 {}",
                    name, value
                )));
            }
        }

        if weights.iter().all(|(_, v)| *v == 0.0) {
            return Err(MemoriaError::Invalid("至少需要一个正权重".to_string()));
        }

        if !self.recency_half_life_hours.is_finite() || self.recency_half_life_hours <= 0.0 {
            return Err(MemoriaError::Invalid(format!(
                "recency_half_life_hours 必须大于 0, 实际为 {}",
                self.recency_half_life_hours
            )));
        }

        Ok(())
    }

    /// 中性查询 (无相似度项) 使用的权重
    pub fn without_similarity(&self) -> Self {
        Self {
            similarity_weight: 0.0,
            ..self.clone()
        }
    }
}

/// 保留策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// 每个项目最多保留的记忆数
    pub max_memory_items: usize,
    /// 记忆最大闲置天数 (与重要性下限共同决定是否清理)
    pub memory_max_age_days: u32,
    /// 重要性下限 (低于此值的旧记忆可被清理)
    pub importance_floor: f32,
    /// 已结束任务的保留天数
    pub task_max_age_days: u32,
    /// 是否合并重复记忆
    pub merge_duplicates: bool,
    /// 容量淘汰时保护项目最新创建的记忆
    pub protect_newest: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_memory_items: 1000,
            memory_max_age_days: 90,
            importance_floor: 0.3,
            task_max_age_days: 30,
            merge_duplicates: true,
            protect_newest: true,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.importance_floor) {
            return Err(MemoriaError::Invalid(format!(
                "importance_floor 必须在 [0, 1] 内, 实际为 {}",
                self.importance_floor
            )));
        }
        Ok(())
    }
}

/// 知识图谱配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// 未指定深度时的默认遍历深度
    pub default_max_depth: usize,
    /// 允许的最大遍历深度
    pub max_depth_limit: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_max_depth: 3,
            max_depth_limit: 10,
        }
    }
}

/// 嵌入提供商配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// 提供商 (openai, ollama, none)
    pub provider: String,
    /// 嵌入模型
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 单次嵌入调用超时 (秒)
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            api_key: None,
            timeout_secs: 10,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// 存储调用重试策略 (指数退避)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数 (含首次)
    pub max_attempts: u32,
    /// 首次退避 (毫秒)
    pub initial_backoff_ms: u64,
    /// 退避上限 (毫秒)
    pub max_backoff_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 单次尝试超时 (毫秒)
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            multiplier: 2.0,
            attempt_timeout_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间 (attempt 从 1 开始)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }
}

/// 并发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// 同时处理的最大请求数
    pub max_concurrent_requests: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
        }
    }
}

impl EngineConfig {
    /// 从文件加载配置
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MemoriaError::Config(format!("读取配置文件失败: {}", e)))?;

        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| MemoriaError::Config(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        tracing::debug!("已加载引擎配置: {}", path.display());
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MemoriaError::Config(format!("创建目录失败: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MemoriaError::Config(format!("序列化配置失败: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| MemoriaError::Config(format!("写入配置文件失败: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;
        self.retention.validate()?;
        if self.graph.default_max_depth > self.graph.max_depth_limit {
            return Err(MemoriaError::Invalid(format!(
                "default_max_depth ({}) 超过 max_depth_limit ({})",
                self.graph.default_max_depth, self.graph.max_depth_limit
            )));
        }
        if self.concurrency.max_concurrent_requests == 0 {
            return Err(MemoriaError::Invalid(
                "max_concurrent_requests 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}
