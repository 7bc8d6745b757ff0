//! Task data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Versioned;
use crate::mcp_client::ServerId;

/// Opaque task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    AgentExecution,
    SkillExecution,
    Shell,
    FileOperation,
    RemoteToolCall,
    Checkpoint,
    Sync,
    Async,
}

/// Task priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Task progress information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub current: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Always within 0..=100 once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f32>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            current: 0,
            total: None,
            percentage: None,
            message: "Starting...".to_string(),
            details: None,
        }
    }
}

impl TaskProgress {
    pub fn indeterminate(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_total(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total: Some(total),
            percentage: None,
            message: message.into(),
            details: None,
        }
        .normalized()
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Derive the percentage from `current/total` when it is missing and
    /// clamp it into range.
    pub fn normalized(mut self) -> Self {
        if self.percentage.is_none() {
            if let Some(total) = self.total.filter(|t| *t > 0) {
                self.percentage = Some(self.current as f32 / total as f32 * 100.0);
            }
        }
        self.percentage = self
            .percentage
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0));
        self
    }
}

/// What a caller asks the registry to track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_true")]
    pub cancellable: bool,
    /// Whether the operation honours pause at its checkpoints.
    #[serde(default = "default_true")]
    pub pausable: bool,
    #[serde(default)]
    pub server_id: Option<ServerId>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl TaskSpec {
    pub fn new(kind: TaskKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: None,
            priority: TaskPriority::Normal,
            background: false,
            cancellable: true,
            pausable: true,
            server_id: None,
            tags: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    pub fn pausable(mut self, pausable: bool) -> Self {
        self.pausable = pausable;
        self
    }

    pub fn server(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A tracked unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress: TaskProgress,
    pub background: bool,
    pub cancellable: bool,
    #[serde(default = "default_true")]
    pub pausable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub version: u64,
}

impl Task {
    /// A fresh `pending` task stamped with `version`.
    pub fn new(spec: TaskSpec, version: u64) -> Self {
        Self {
            id: TaskId::generate(),
            kind: spec.kind,
            name: spec.name,
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority,
            progress: TaskProgress::default(),
            background: spec.background,
            cancellable: spec.cancellable,
            pausable: spec.pausable,
            server_id: spec.server_id,
            tags: spec.tags,
            error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            version,
        }
    }

    /// Move into a terminal status, stamping completion time and duration.
    pub(crate) fn finish(&mut self, status: TaskStatus) {
        let now = Utc::now();
        let since = self.started_at.unwrap_or(self.created_at);
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - since).num_milliseconds().max(0) as u64);
    }
}

impl Versioned for Task {
    type Key = TaskId;

    fn key(&self) -> TaskId {
        self.id.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Selection for `list`. Empty filter matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub kind: Option<TaskKind>,
    pub background: Option<bool>,
    pub server_id: Option<ServerId>,
    pub active_only: bool,
}

impl TaskFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Default::default()
        }
    }

    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.active_only && task.status.is_terminal() {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if self.kind.is_some_and(|k| k != task.kind) {
            return false;
        }
        if self.background.is_some_and(|b| b != task.background) {
            return false;
        }
        if let Some(server) = &self.server_id {
            if task.server_id.as_ref() != Some(server) {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts. `total == active + completed + failed + cancelled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub total: usize,
    pub active: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub(crate) fn add(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Paused => self.paused += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
        if status.is_active() {
            self.active += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage_is_derived_and_clamped() {
        let p = TaskProgress::with_total(3, 4, "step 3");
        assert_eq!(p.percentage, Some(75.0));

        let over = TaskProgress {
            percentage: Some(140.0),
            ..TaskProgress::default()
        }
        .normalized();
        assert_eq!(over.percentage, Some(100.0));

        let nan = TaskProgress {
            percentage: Some(f32::NAN),
            ..TaskProgress::default()
        }
        .normalized();
        assert_eq!(nan.percentage, None);

        assert_eq!(TaskProgress::with_total(1, 0, "x").percentage, None);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(TaskKind::RemoteToolCall).unwrap(),
            "remote-tool-call"
        );
        assert_eq!(
            serde_json::to_value(TaskKind::FileOperation).unwrap(),
            "file-operation"
        );
    }

    #[test]
    fn test_filter_matches() {
        let mut task = Task::new(
            TaskSpec::new(TaskKind::RemoteToolCall, "search")
                .server(ServerId::from("s1"))
                .background(true),
            1,
        );
        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::active().matches(&task));
        assert!(TaskFilter {
            server_id: Some(ServerId::from("s1")),
            kind: Some(TaskKind::RemoteToolCall),
            ..Default::default()
        }
        .matches(&task));
        assert!(!TaskFilter {
            background: Some(false),
            ..Default::default()
        }
        .matches(&task));

        task.finish(TaskStatus::Completed);
        assert!(!TaskFilter::active().matches(&task));
        assert!(TaskFilter::with_status(TaskStatus::Completed).matches(&task));
    }

    #[test]
    fn test_finish_sets_duration() {
        let mut task = Task::new(TaskSpec::new(TaskKind::Shell, "ls"), 1);
        task.started_at = Some(task.created_at);
        task.finish(TaskStatus::Failed);
        assert!(task.completed_at.is_some());
        assert!(task.duration_ms.is_some());
        assert!(task.status.is_terminal());
    }
}
