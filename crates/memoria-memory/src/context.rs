//! 上下文组装
//!
//! 把最相关的记忆和待办任务整理成可直接注入提示词的 Markdown，
//! 并提供按 token 预算截断的粗略压缩。

use serde::{Deserialize, Serialize};

use crate::scorer::ScoredMemory;
use crate::tasks::{Task, TaskPriority};

/// 每条记忆在上下文中的最大字符数
const MEMORY_PREVIEW_CHARS: usize = 200;
const TRUNCATION_MARKER: &str = "... [content truncated]";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMemory {
    pub title: String,
    pub kind: String,
    pub content: String,
    pub score: f64,
}

impl From<&ScoredMemory> for ContextMemory {
    fn from(scored: &ScoredMemory) -> Self {
        Self {
            title: scored.memory.title.clone(),
            kind: scored.memory.kind.to_string(),
            content: scored.memory.content.clone(),
            score: scored.score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextTask {
    pub title: String,
    pub priority: TaskPriority,
}

impl From<&Task> for ContextTask {
    fn from(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            priority: task.priority,
        }
    }
}

/// 项目的记忆上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryContext {
    pub project_id: String,
    pub project_name: String,
    pub memories: Vec<ContextMemory>,
    pub pending_tasks: Vec<ContextTask>,
    /// 检索时嵌入提供商不可用
    pub degraded: bool,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty() && self.pending_tasks.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut parts = vec![format!("## Current Project: {}", self.project_name)];

        if !self.memories.is_empty() {
            parts.push("## Relevant Memories".to_string());
            for memory in &self.memories {
                parts.push(format!("### {}: {}", capitalize(&memory.kind), memory.title));
                parts.push(preview(&memory.content, MEMORY_PREVIEW_CHARS));
            }
        }

        if !self.pending_tasks.is_empty() {
            parts.push("## Pending Tasks".to_string());
            let lines: Vec<String> = self
                .pending_tasks
                .iter()
                .map(|task| format!("- [{}] {}", task.priority.as_str(), task.title))
                .collect();
            parts.push(lines.join("\n"));
        }

        parts.join("\n\n")
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.to_markdown())
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let head: String = content.chars().take(max_chars).collect();
    format!("{}...", head)
}

/// 粗略估算 token 数 (约 4 个字符一个 token，至少为 1)
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// 压缩结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedContext {
    pub content: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub compression_ratio: f64,
}

/// 截断内容以适应 token 预算
pub fn compress_context(content: &str, target_tokens: usize) -> CompressedContext {
    let original_tokens = estimate_tokens(content);
    if original_tokens <= target_tokens {
        return CompressedContext {
            content: content.to_string(),
            original_tokens,
            compressed_tokens: original_tokens,
            compression_ratio: 1.0,
        };
    }

    let head: String = content.chars().take(target_tokens * 4).collect();
    let compressed = format!("{}{}", head, TRUNCATION_MARKER);
    let compressed_tokens = estimate_tokens(&compressed);

    CompressedContext {
        content: compressed,
        original_tokens,
        compressed_tokens,
        compression_ratio: compressed_tokens as f64 / original_tokens as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(400)), 100);
    }

    #[test]
    fn test_compress_within_budget_is_unchanged() {
        let result = compress_context("short text", 100);
        assert_eq!(result.content, "short text");
        assert_eq!(result.compression_ratio, 1.0);
    }

    #[test]
    fn test_compress_truncates() {
        let content = "x".repeat(1000);
        let result = compress_context(&content, 10);
        assert!(result.content.starts_with(&"x".repeat(40)));
        assert!(result.content.ends_with(TRUNCATION_MARKER));
        assert_eq!(result.original_tokens, 250);
        assert!(result.compressed_tokens < result.original_tokens);
        assert!(result.compression_ratio < 1.0);
    }

    #[test]
    fn test_compress_respects_char_boundaries() {
        let content = "记忆".repeat(100);
        let result = compress_context(&content, 5);
        assert!(result.content.starts_with(&"记忆".repeat(10)));
    }

    #[test]
    fn test_markdown_rendering() {
        let context = MemoryContext {
            project_id: "p".to_string(),
            project_name: "Demo".to_string(),
            memories: vec![ContextMemory {
                title: "Login flow".to_string(),
                kind: "decision".to_string(),
                content: "y".repeat(250),
                score: 0.9,
            }],
            pending_tasks: vec![ContextTask {
                title: "Fix the login bug".to_string(),
                priority: TaskPriority::High,
            }],
            degraded: false,
        };

        let markdown = context.to_markdown();
        assert!(markdown.contains("## Current Project: Demo"));
        assert!(markdown.contains("### Decision: Login flow"));
        assert!(markdown.contains(&format!("{}...", "y".repeat(200))));
        assert!(!markdown.contains(&"y".repeat(201)));
        assert!(markdown.contains("- [high] Fix the login bug"));
    }

    #[test]
    fn test_empty_context() {
        let context = MemoryContext {
            project_id: "p".to_string(),
            project_name: "Demo".to_string(),
            memories: Vec::new(),
            pending_tasks: Vec::new(),
            degraded: true,
        };
        assert!(context.is_empty());
        assert_eq!(context.to_markdown(), "## Current Project: Demo");
    }
}
