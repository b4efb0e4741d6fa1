//! 任务跟踪
//!
//! 状态流转：pending → in_progress → completed，pending / in_progress → cancelled。
//! completed 和 cancelled 是终态。

use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, Metadata, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::types::{ProjectId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// 检查状态流转是否合法
    ///
    /// 返回 `Ok(false)` 表示目标状态与当前相同，无需变更。
    pub fn check_transition(self, to: TaskStatus) -> Result<bool> {
        if self == to {
            return Ok(false);
        }
        if self.is_terminal() {
            return Err(MemoriaError::Conflict(format!(
                "任务已处于终态 {}, 不能变更为 {}",
                self, to
            )));
        }
        match (self, to) {
            (TaskStatus::Pending, TaskStatus::InProgress)
            | (TaskStatus::InProgress, TaskStatus::Completed)
            | (TaskStatus::Pending, TaskStatus::Cancelled)
            | (TaskStatus::InProgress, TaskStatus::Cancelled) => Ok(true),
            _ => Err(MemoriaError::Invalid(format!(
                "不允许的状态流转: {} -> {}",
                self, to
            ))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = MemoriaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            _ => Err(MemoriaError::Invalid(format!("未知的任务状态: {}", s))),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = MemoriaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            _ => Err(MemoriaError::Invalid(format!("未知的任务优先级: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub category: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f32>,
    pub actual_hours: Option<f32>,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(project_id: impl Into<String>, new_task: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId(0),
            project_id: project_id.into(),
            title: new_task.title,
            description: new_task.description,
            status: TaskStatus::Pending,
            priority: new_task.priority,
            category: new_task.category,
            due_date: new_task.due_date,
            estimated_hours: new_task.estimated_hours,
            actual_hours: None,
            tags: new_task.tags,
            metadata: new_task.metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// 变更状态，进入终态时记录结束时间；返回是否发生了变更
    pub fn apply_status(&mut self, status: TaskStatus, now: DateTime<Utc>) -> Result<bool> {
        if !self.status.check_transition(status)? {
            return Ok(false);
        }
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(true)
    }

    /// 终态任务的结束时间 (缺失时取更新时间)
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.status
            .is_terminal()
            .then(|| self.completed_at.unwrap_or(self.updated_at))
    }
}

/// 创建任务的请求
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub category: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f32>,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
}

impl NewTask {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_estimated_hours(mut self, hours: f32) -> Self {
        self.estimated_hours = Some(hours);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(MemoriaError::Invalid("任务标题不能为空".to_string()));
        }
        if let Some(hours) = self.estimated_hours {
            if !hours.is_finite() || hours < 0.0 {
                return Err(MemoriaError::Invalid(format!("预估工时无效: {}", hours)));
            }
        }
        Ok(())
    }
}

/// 任务列表排序：优先级降序、创建时间升序、ID 升序
pub fn compare_tasks(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_allowed_transitions() {
        assert!(TaskStatus::Pending.check_transition(TaskStatus::InProgress).unwrap());
        assert!(TaskStatus::InProgress.check_transition(TaskStatus::Completed).unwrap());
        assert!(TaskStatus::Pending.check_transition(TaskStatus::Cancelled).unwrap());
        assert!(TaskStatus::InProgress.check_transition(TaskStatus::Cancelled).unwrap());
        assert!(!TaskStatus::Pending.check_transition(TaskStatus::Pending).unwrap());
        assert!(!TaskStatus::Completed.check_transition(TaskStatus::Completed).unwrap());
    }

    #[test]
    fn test_rejected_transitions() {
        let err = TaskStatus::Completed
            .check_transition(TaskStatus::Pending)
            .unwrap_err();
        assert_eq!(err.kind(), memoria_core::ErrorKind::Conflict);

        let err = TaskStatus::Cancelled
            .check_transition(TaskStatus::InProgress)
            .unwrap_err();
        assert_eq!(err.kind(), memoria_core::ErrorKind::Conflict);

        let err = TaskStatus::Pending
            .check_transition(TaskStatus::Completed)
            .unwrap_err();
        assert_eq!(err.kind(), memoria_core::ErrorKind::Invalid);

        let err = TaskStatus::InProgress
            .check_transition(TaskStatus::Pending)
            .unwrap_err();
        assert_eq!(err.kind(), memoria_core::ErrorKind::Invalid);
    }

    #[test]
    fn test_apply_status_records_completion() {
        let mut task = Task::new("p", NewTask::new("Fix login", ""));
        let now = Utc::now() + Duration::minutes(5);

        assert!(task.finished_at().is_none());
        assert!(task.apply_status(TaskStatus::InProgress, now).unwrap());
        assert!(task.completed_at.is_none());
        assert!(task.apply_status(TaskStatus::Completed, now).unwrap());
        assert_eq!(task.completed_at, Some(now));
        assert_eq!(task.finished_at(), Some(now));
        assert!(!task.apply_status(TaskStatus::Completed, now).unwrap());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
    }

    #[test]
    fn test_compare_tasks() {
        let mut low = Task::new("p", NewTask::new("a", "").with_priority(TaskPriority::Low));
        low.id = TaskId(1);
        let mut high = Task::new("p", NewTask::new("b", "").with_priority(TaskPriority::High));
        high.id = TaskId(2);
        let mut tasks = vec![low, high];
        tasks.sort_by(compare_tasks);
        assert_eq!(tasks[0].id, TaskId(2));
    }

    #[test]
    fn test_new_task_validation() {
        assert!(NewTask::new("  ", "").validate().is_err());
        assert!(NewTask::new("t", "").with_estimated_hours(-1.0).validate().is_err());
        assert!(NewTask::new("t", "").validate().is_ok());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in-progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
