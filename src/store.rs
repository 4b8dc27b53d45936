//! C1 — Task Store: authoritative in-memory map of tasks, indexed by id,
//! status, category and tag. No scheduling policy lives here.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::{QueueError, Result};
use crate::types::{Category, ExecutionRecord, Task, TaskId, TaskStatus};

#[derive(Debug, Default, Clone)]
pub struct SearchFilter {
    pub status: Option<TaskStatus>,
    pub category: Option<Category>,
    pub tag: Option<String>,
    pub parent_task_id: Option<TaskId>,
}

/// A serialisable point-in-time copy of the store, used by C8 Persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub tasks: Vec<Task>,
}

struct Indices {
    by_status: HashMap<TaskStatus, HashSet<TaskId>>,
    by_category: HashMap<Category, HashSet<TaskId>>,
    by_tag: HashMap<String, HashSet<TaskId>>,
    by_parent: HashMap<TaskId, HashSet<TaskId>>,
}

impl Indices {
    fn new() -> Self {
        Self {
            by_status: HashMap::new(),
            by_category: HashMap::new(),
            by_tag: HashMap::new(),
            by_parent: HashMap::new(),
        }
    }

    fn insert(&mut self, task: &Task) {
        self.by_status.entry(task.status).or_default().insert(task.id.clone());
        self.by_category.entry(task.category).or_default().insert(task.id.clone());
        for tag in &task.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(task.id.clone());
        }
        if let Some(parent) = &task.parent_task_id {
            self.by_parent.entry(parent.clone()).or_default().insert(task.id.clone());
        }
    }

    fn remove(&mut self, task: &Task) {
        if let Some(set) = self.by_status.get_mut(&task.status) {
            set.remove(&task.id);
        }
        if let Some(set) = self.by_category.get_mut(&task.category) {
            set.remove(&task.id);
        }
        for tag in &task.tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&task.id);
            }
        }
        if let Some(parent) = &task.parent_task_id {
            if let Some(set) = self.by_parent.get_mut(parent) {
                set.remove(&task.id);
            }
        }
    }

    fn rebuild(tasks: &HashMap<TaskId, Task>) -> Self {
        let mut indices = Self::new();
        for task in tasks.values() {
            indices.insert(task);
        }
        indices
    }
}

pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    indices: RwLock<Indices>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            indices: RwLock::new(Indices::new()),
        }
    }

    /// Inserts a new task. Fails with `DuplicateId` unless `upsert` is set.
    pub async fn put(&self, task: Task, upsert: bool) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) && !upsert {
            return Err(QueueError::DuplicateId(task.id.clone()));
        }
        let mut indices = self.indices.write().await;
        if let Some(previous) = tasks.get(&task.id) {
            indices.remove(previous);
        }
        indices.insert(&task);
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Atomic read-modify-write. The mutator must not violate I4/I5; if it
    /// does, the update is rejected and the stored task is left unchanged.
    pub async fn update(
        &self,
        id: &TaskId,
        mutator: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let before = task.clone();
        mutator(task);
        task.updated_at = chrono::Utc::now();

        if task.retry_count > task.max_retries {
            *task = before;
            return Err(QueueError::InvariantViolation {
                component: "TaskStore".into(),
                detail: "retryCount exceeds maxRetries (I4)".into(),
            });
        }
        if task.status == TaskStatus::InProgress && task.started_at.is_none() {
            *task = before;
            return Err(QueueError::InvariantViolation {
                component: "TaskStore".into(),
                detail: "in_progress task missing startedAt (I5)".into(),
            });
        }
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) && task.completed_at.is_none() {
            *task = before;
            return Err(QueueError::InvariantViolation {
                component: "TaskStore".into(),
                detail: "terminal task missing completedAt (I5)".into(),
            });
        }

        let after = task.clone();
        let mut indices = self.indices.write().await;
        indices.remove(&before);
        indices.insert(&after);
        Ok(after)
    }

    pub async fn append_execution_record(&self, id: &TaskId, record: ExecutionRecord) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| QueueError::NotFound(id.clone()))?;
        task.execution_history.push(record);
        Ok(())
    }

    pub async fn remove(&self, id: &TaskId) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks.remove(id);
        if let Some(task) = &removed {
            self.indices.write().await.remove(task);
        }
        removed
    }

    pub async fn list(&self, filter: &SearchFilter) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|task| {
                filter.status.map_or(true, |s| task.status == s)
                    && filter.category.map_or(true, |c| task.category == c)
                    && filter
                        .tag
                        .as_ref()
                        .map_or(true, |tag| task.tags.contains(tag))
                    && filter
                        .parent_task_id
                        .as_ref()
                        .map_or(true, |parent| task.parent_task_id.as_ref() == Some(parent))
            })
            .cloned()
            .collect()
    }

    pub async fn by_status(&self, status: TaskStatus) -> Vec<Task> {
        let ids = self.indices.read().await.by_status.get(&status).cloned().unwrap_or_default();
        let tasks = self.tasks.read().await;
        ids.iter().filter_map(|id| tasks.get(id).cloned()).collect()
    }

    pub async fn count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// P5: the union of `status -> set` index sizes equals the store's size.
    pub async fn index_count_matches_store(&self) -> bool {
        let indices = self.indices.read().await;
        let total: usize = indices.by_status.values().map(|s| s.len()).sum();
        total == self.tasks.read().await.len()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tasks: self.tasks.read().await.values().cloned().collect(),
        }
    }

    /// Restores from a snapshot, rebuilding indices in O(N). Any task left
    /// `in_progress` is reset to `queued` by the caller (C8's contract),
    /// not by the store itself, since that touches Lifecycle semantics.
    pub async fn restore(&self, snapshot: StoreSnapshot) {
        let mut tasks = self.tasks.write().await;
        tasks.clear();
        for task in snapshot.tasks {
            tasks.insert(task.id.clone(), task);
        }
        *self.indices.write().await = Indices::rebuild(&tasks);
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[tokio::test]
    async fn put_rejects_duplicate_without_upsert() {
        let store = TaskStore::new();
        let task = Task::new("a", "default");
        store.put(task.clone(), false).await.unwrap();
        let err = store.put(task, false).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn update_rejects_retry_count_exceeding_max() {
        let store = TaskStore::new();
        let task = Task::new("a", "default").with_priority(Priority::Normal);
        let id = task.id.clone();
        store.put(task, false).await.unwrap();
        let err = store
            .update(&id, |t| {
                t.max_retries = 1;
                t.retry_count = 2;
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn status_index_stays_consistent_with_store_size() {
        let store = TaskStore::new();
        for i in 0..5 {
            store.put(Task::new(format!("t{i}"), "default"), false).await.unwrap();
        }
        assert!(store.index_count_matches_store().await);
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_tasks() {
        let store = TaskStore::new();
        store.put(Task::new("a", "default"), false).await.unwrap();
        store.put(Task::new("b", "default"), false).await.unwrap();
        let snapshot = store.snapshot().await;

        let restored = TaskStore::new();
        restored.restore(snapshot).await;
        assert_eq!(restored.count().await, 2);
        assert!(restored.index_count_matches_store().await);
    }
}
