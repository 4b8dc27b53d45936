//! Core data model: tasks, dependency edges, execution records and the
//! closed enums the rest of the crate dispatches on.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task id. Generated as a UUIDv4 string when the caller doesn't
/// supply one; treated as an opaque string everywhere else (I8).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Feature,
    BugFix,
    Security,
    Performance,
    Docs,
    Refactor,
    Test,
    Analysis,
    Deployment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Enterprise,
}

impl Complexity {
    /// A coarse [0,1] score used by the breakdown threshold comparison.
    pub fn score(self) -> f64 {
        match self {
            Complexity::Trivial => 0.1,
            Complexity::Simple => 0.3,
            Complexity::Moderate => 0.55,
            Complexity::Complex => 0.8,
            Complexity::Enterprise => 0.95,
        }
    }
}

/// Closed, ordered base priority. `Ord` derives in declaration order, so
/// `Priority::Critical > Priority::Background` holds directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Background,
    Low,
    Medium,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Integer weight used as the `Base` factor in the dynamic priority score.
    pub fn weight(self) -> i64 {
        match self {
            Priority::Background => 10,
            Priority::Low => 50,
            Priority::Medium => 100,
            Priority::Normal => 200,
            Priority::High => 400,
            Priority::Critical => 800,
        }
    }
}

/// The lifecycle automaton's closed state set (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Analyzed,
    Assigned,
    Preparing,
    ResourceAllocated,
    Starting,
    InProgress,
    Paused,
    Resuming,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    RollingBack,
    Blocked,
    Expired,
    Archived,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Archived
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::InProgress | TaskStatus::Starting | TaskStatus::Resuming
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Dependency edge kind (§3). Only `Hard`/`Data` block scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    Hard,
    Soft,
    Resource,
    Data,
    Validation,
}

impl DependencyKind {
    pub fn blocks_scheduling(self) -> bool {
        matches!(self, DependencyKind::Hard | DependencyKind::Data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub dependent: TaskId,
    pub depends_on: TaskId,
    pub kind: DependencyKind,
    pub optional: bool,
    pub min_delay: Option<chrono::Duration>,
}

impl DependencyEdge {
    pub fn new(dependent: TaskId, depends_on: TaskId, kind: DependencyKind) -> Self {
        Self {
            dependent,
            depends_on,
            kind,
            optional: false,
            min_delay: None,
        }
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<String>,
    pub artifacts: HashMap<String, serde_json::Value>,
    pub work_units: u64,
    pub child_task_count: u32,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub task_type: Category,
    pub complexity: Complexity,
    pub base_priority: Priority,
    pub dynamic_priority: i64,
    pub starvation_boost: i64,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub estimated_duration: chrono::Duration,
    pub last_error: Option<String>,

    pub required_resources: HashSet<String>,
    pub batch_group: Option<String>,
    pub parent_task_id: Option<TaskId>,
    pub subtask_ids: Vec<TaskId>,
    pub dependency_ids: HashSet<TaskId>,
    pub dependent_ids: HashSet<TaskId>,

    pub payload: serde_json::Value,
    pub runner_name: String,
    pub expected_outputs: HashMap<String, String>,
    pub use_autonomous_breakdown: bool,

    pub tags: HashSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,

    pub execution_history: Vec<ExecutionRecord>,
}

impl Task {
    pub fn new(title: impl Into<String>, runner_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.into(),
            description: String::new(),
            category: Category::Feature,
            task_type: Category::Feature,
            complexity: Complexity::Simple,
            base_priority: Priority::Normal,
            dynamic_priority: Priority::Normal.weight(),
            starvation_boost: 0,
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            deadline: None,
            retry_count: 0,
            max_retries: 3,
            estimated_duration: chrono::Duration::minutes(5),
            last_error: None,
            required_resources: HashSet::new(),
            batch_group: None,
            parent_task_id: None,
            subtask_ids: Vec::new(),
            dependency_ids: HashSet::new(),
            dependent_ids: HashSet::new(),
            payload: serde_json::Value::Null,
            runner_name: runner_name.into(),
            expected_outputs: HashMap::new(),
            use_autonomous_breakdown: false,
            tags: HashSet::new(),
            metadata: HashMap::new(),
            execution_history: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.base_priority = priority;
        self.dynamic_priority = priority.weight();
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self.task_type = category;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependency_ids.extend(deps);
        self
    }

    pub fn with_required_resources(mut self, resources: impl IntoIterator<Item = String>) -> Self {
        self.required_resources.extend(resources);
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_expected_outputs(mut self, outputs: HashMap<String, String>) -> Self {
        self.expected_outputs = outputs;
        self
    }

    pub fn with_autonomous_breakdown(mut self, enabled: bool) -> Self {
        self.use_autonomous_breakdown = enabled;
        self
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    pub fn is_starving(&self, max_starvation_time: chrono::Duration) -> bool {
        self.status == TaskStatus::Queued && self.age() > max_starvation_time
    }
}

/// Closed set of events the Monitor emits over the typed subscription API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    TaskSubmitted { task_id: TaskId },
    TaskStatusChanged { task_id: TaskId, from: TaskStatus, to: TaskStatus },
    TaskFailed { task_id: TaskId, error: String },
    TaskCancelled { task_id: TaskId, reason: String },
    TaskRetrying { task_id: TaskId, attempt: u32 },
    TaskCompleted { task_id: TaskId },
    EdgeDroppedToResolveCycle { edge: (TaskId, TaskId), cycle: Vec<TaskId> },
    AlertRaised { code: String, message: String },
    AlertResolved { code: String },
    AdaptationApplied { parameter: String, old_value: String, new_value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_total() {
        assert!(Priority::Critical > Priority::Background);
        assert!(Priority::High > Priority::Normal);
    }

    #[test]
    fn task_builder_sets_dynamic_priority_from_base() {
        let task = Task::new("index the corpus", "default").with_priority(Priority::High);
        assert_eq!(task.dynamic_priority, Priority::High.weight());
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn terminal_states_are_closed_under_is_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }
}
