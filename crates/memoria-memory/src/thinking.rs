//! 思维链
//!
//! 结构化推理过程：analysis → planning → execution → validation → reflection。
//! 链和每个步骤同时以记忆的形式保存，便于检索。

use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::types::{MemoryId, ProjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStage {
    Analysis,
    Planning,
    Execution,
    Validation,
    Reflection,
}

impl ThinkingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingStage::Analysis => "analysis",
            ThinkingStage::Planning => "planning",
            ThinkingStage::Execution => "execution",
            ThinkingStage::Validation => "validation",
            ThinkingStage::Reflection => "reflection",
        }
    }

    /// 下一阶段，reflection 之后没有下一阶段
    pub fn next(&self) -> Option<ThinkingStage> {
        match self {
            ThinkingStage::Analysis => Some(ThinkingStage::Planning),
            ThinkingStage::Planning => Some(ThinkingStage::Execution),
            ThinkingStage::Execution => Some(ThinkingStage::Validation),
            ThinkingStage::Validation => Some(ThinkingStage::Reflection),
            ThinkingStage::Reflection => None,
        }
    }
}

impl fmt::Display for ThinkingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThinkingStage {
    type Err = MemoriaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "analysis" => Ok(ThinkingStage::Analysis),
            "planning" => Ok(ThinkingStage::Planning),
            "execution" => Ok(ThinkingStage::Execution),
            "validation" => Ok(ThinkingStage::Validation),
            "reflection" => Ok(ThinkingStage::Reflection),
            _ => Err(MemoriaError::Invalid(format!("未知的思考阶段: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Active,
    Completed,
    Abandoned,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChainStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub id: Uuid,
    pub stage: ThinkingStage,
    pub title: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub confidence: f32,
    pub memory_id: Option<MemoryId>,
    pub created_at: DateTime<Utc>,
}

/// 追加思考步骤的请求
#[derive(Debug, Clone)]
pub struct NewThinkingStep {
    /// None 时使用链的当前阶段
    pub stage: Option<ThinkingStage>,
    pub title: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub confidence: f32,
}

impl NewThinkingStep {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            stage: None,
            title: title.into(),
            content: content.into(),
            reasoning: None,
            confidence: 0.8,
        }
    }

    pub fn with_stage(mut self, stage: ThinkingStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(MemoriaError::Invalid(format!(
                "置信度必须在 [0, 1] 内, 实际为 {}",
                self.confidence
            )));
        }
        if self.content.trim().is_empty() {
            return Err(MemoriaError::Invalid("思考步骤内容不能为空".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingChain {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub objective: String,
    pub status: ChainStatus,
    /// 下一个步骤默认使用的阶段
    pub current_stage: ThinkingStage,
    pub steps: Vec<ThinkingStep>,
    pub memory_id: Option<MemoryId>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ThinkingChain {
    pub fn new(project_id: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            objective: objective.into(),
            status: ChainStatus::Active,
            current_stage: ThinkingStage::Analysis,
            steps: Vec::new(),
            memory_id: None,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(MemoriaError::Conflict(format!(
                "思维链 {} 已结束 ({:?})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// 根据请求构造步骤 (不修改链)
    pub fn prepare_step(&self, step: &NewThinkingStep) -> Result<ThinkingStep> {
        self.ensure_active()?;
        step.validate()?;
        Ok(ThinkingStep {
            id: Uuid::new_v4(),
            stage: step.stage.unwrap_or(self.current_stage),
            title: step.title.clone(),
            content: step.content.clone(),
            reasoning: step.reasoning.clone(),
            confidence: step.confidence,
            memory_id: None,
            created_at: Utc::now(),
        })
    }

    /// 追加步骤并推进当前阶段
    pub fn push_step(&mut self, step: ThinkingStep) -> Result<()> {
        self.ensure_active()?;
        self.current_stage = step.stage.next().unwrap_or(ThinkingStage::Reflection);
        self.steps.push(step);
        Ok(())
    }

    pub fn finish(&mut self, status: ChainStatus, summary: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_active()?;
        if !status.is_terminal() {
            return Err(MemoriaError::Invalid("结束状态必须是 completed 或 abandoned".to_string()));
        }
        self.status = status;
        self.summary = summary;
        self.completed_at = Some(now);
        Ok(())
    }

    /// 各步骤置信度的平均值
    pub fn average_confidence(&self) -> Option<f32> {
        if self.steps.is_empty() {
            return None;
        }
        Some(self.steps.iter().map(|s| s.confidence).sum::<f32>() / self.steps.len() as f32)
    }
}
