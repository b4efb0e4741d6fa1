//! Embedding Provider Trait
//!
//! 定义独立的嵌入向量生成接口，以及引擎使用的容错适配层 [`EmbeddingService`]。
//! 提供商失败只会让调用降级，不会让写入或检索失败。

use async_trait::async_trait;
use memoria_core::{EmbeddingConfig, MemoriaError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::StoredEmbedding;

pub type Embedding = Vec<f32>;
pub type Embeddings = Vec<Embedding>;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Embedding>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Embeddings>;

    /// 写入向量时记录的模型标识
    fn identity(&self) -> String {
        format!("{}:{}", self.name(), self.model())
    }
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// 余弦相似度；维度不一致或任一向量模为 0 时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let denominator = magnitude(a) * magnitude(b);
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    dot_product(a, b) / denominator
}

fn parse_vector(value: &serde_json::Value) -> Option<Embedding> {
    value
        .as_array()
        .map(|items| items.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

pub struct OpenAIEmbedding {
    client: reqwest::Client,
    model: String,
    dimensions: usize,
    api_key: String,
    base_url: String,
}

impl OpenAIEmbedding {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self.dimensions = match model {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };
        self
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MemoriaError::Embedding("响应中没有嵌入向量".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Embeddings> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "input": texts,
                "model": self.model,
            }))
            .send()
            .await
            .map_err(|e| MemoriaError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(MemoriaError::Embedding(format!("{}: {}", status, error)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoriaError::Embedding(e.to_string()))?;

        json["data"]
            .as_array()
            .ok_or_else(|| MemoriaError::Embedding("响应格式无效".to_string()))?
            .iter()
            .map(|item| {
                parse_vector(&item["embedding"])
                    .ok_or_else(|| MemoriaError::Embedding("响应缺少 embedding 字段".to_string()))
            })
            .collect()
    }
}

pub struct OllamaEmbedding {
    client: reqwest::Client,
    model: String,
    base_url: String,
}

impl OllamaEmbedding {
    pub fn new(model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.to_string(),
            base_url: "http://localhost:11434".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        match self.model.as_str() {
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768,
        }
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": text,
            }))
            .send()
            .await
            .map_err(|e| MemoriaError::Embedding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(MemoriaError::Embedding(format!("{}: {}", status, error)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoriaError::Embedding(e.to_string()))?;

        parse_vector(&json["embedding"])
            .ok_or_else(|| MemoriaError::Embedding("响应缺少 embedding 字段".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Embeddings> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }
}

/// 根据配置创建嵌入提供商，`none` 表示不使用向量
pub fn create_embedding_provider(
    config: &EmbeddingConfig,
) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.to_lowercase().as_str() {
        "none" | "" => Ok(None),
        "openai" => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| MemoriaError::Config("OpenAI 嵌入需要 api_key".to_string()))?;
            let mut provider = OpenAIEmbedding::new(api_key).with_model(&config.model);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Some(Arc::new(provider)))
        }
        "ollama" => {
            let mut provider = OllamaEmbedding::new(&config.model);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Some(Arc::new(provider)))
        }
        other => Err(MemoriaError::Config(format!("未知的嵌入提供商: {}", other))),
    }
}

/// 嵌入结果：成功或降级
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingOutcome {
    Ready(StoredEmbedding),
    Unavailable(String),
}

impl EmbeddingOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, EmbeddingOutcome::Ready(_))
    }

    pub fn into_embedding(self) -> Option<StoredEmbedding> {
        match self {
            EmbeddingOutcome::Ready(embedding) => Some(embedding),
            EmbeddingOutcome::Unavailable(_) => None,
        }
    }
}

/// 容错的嵌入适配层
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    timeout: Duration,
}

impl EmbeddingService {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(10))
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(create_embedding_provider(config)?, config.timeout()))
    }

    /// 当前提供商标识，未配置时为 None
    pub fn identity(&self) -> Option<String> {
        self.provider.as_ref().map(|p| p.identity())
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn embed(&self, text: &str) -> EmbeddingOutcome {
        let Some(provider) = &self.provider else {
            return EmbeddingOutcome::Unavailable("未配置嵌入提供商".to_string());
        };

        let result = tokio::time::timeout(self.timeout, provider.embed(text)).await;
        let vector = match result {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!("嵌入提供商 {} 调用失败: {}", provider.name(), e);
                return EmbeddingOutcome::Unavailable(e.to_string());
            }
            Err(_) => {
                warn!("嵌入提供商 {} 调用超时 ({:?})", provider.name(), self.timeout);
                return EmbeddingOutcome::Unavailable(format!("嵌入超时 ({:?})", self.timeout));
            }
        };

        if vector.is_empty() {
            warn!("嵌入提供商 {} 返回了空向量", provider.name());
            return EmbeddingOutcome::Unavailable("空向量".to_string());
        }

        if vector.len() != provider.dimensions() {
            warn!(
                "嵌入维度不一致: 期望 {}, 实际 {}",
                provider.dimensions(),
                vector.len()
            );
            return EmbeddingOutcome::Unavailable(format!(
                "维度不一致: 期望 {}, 实际 {}",
                provider.dimensions(),
                vector.len()
            ));
        }

        debug!("已生成嵌入向量: {} 维", vector.len());
        EmbeddingOutcome::Ready(StoredEmbedding::new(vector, provider.identity()))
    }
}
