//! C5 — Lifecycle Manager: the only component permitted to mutate a task's
//! status, validated against the transition matrix, with ordered hooks.

use std::collections::HashMap;

use tracing::{error, warn};

use crate::errors::{QueueError, Result};
use crate::store::TaskStore;
use crate::types::{QueueEvent, TaskId, TaskStatus};

pub trait TransitionHook: Send + Sync {
    fn before(&self, task_id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<()> {
        let _ = (task_id, from, to);
        Ok(())
    }
    fn after(&self, task_id: &TaskId, from: TaskStatus, to: TaskStatus) {
        let _ = (task_id, from, to);
    }
}

fn transition_matrix() -> HashMap<TaskStatus, Vec<TaskStatus>> {
    use TaskStatus::*;
    HashMap::from([
        (Queued, vec![Analyzed, Assigned, Cancelled, Blocked]),
        (Analyzed, vec![Assigned, Blocked, Cancelled]),
        (Assigned, vec![Preparing, InProgress, Cancelled, Blocked]),
        (Preparing, vec![InProgress, Cancelled, Failed]),
        (ResourceAllocated, vec![Starting, Cancelled]),
        (Starting, vec![InProgress, Cancelled, Failed]),
        (InProgress, vec![Paused, Completing, Failed, Cancelled]),
        (Paused, vec![Resuming, Cancelled]),
        (Resuming, vec![InProgress, Cancelled]),
        (Completing, vec![Completed, Failed]),
        (Blocked, vec![Queued, Cancelled, Expired]),
        (Failed, vec![Retrying, Archived]),
        (Retrying, vec![Queued]),
        (Completed, vec![Archived]),
        (Cancelled, vec![Archived]),
        (Expired, vec![Archived]),
        (RollingBack, vec![Failed, Cancelled]),
        (Archived, vec![]),
    ])
}

pub struct LifecycleManager {
    matrix: HashMap<TaskStatus, Vec<TaskStatus>>,
    hooks: Vec<Box<dyn TransitionHook>>,
    events: tokio::sync::broadcast::Sender<QueueEvent>,
}

impl LifecycleManager {
    pub fn new(events: tokio::sync::broadcast::Sender<QueueEvent>) -> Self {
        Self {
            matrix: transition_matrix(),
            hooks: Vec::new(),
            events,
        }
    }

    pub fn register_hook(&mut self, hook: Box<dyn TransitionHook>) {
        self.hooks.push(hook);
    }

    /// The only entry point permitted to change a task's status.
    /// Re-issuing the current status is a no-op (L3).
    pub async fn transition(
        &self,
        store: &TaskStore,
        task_id: &TaskId,
        to: TaskStatus,
        trigger: &str,
    ) -> Result<()> {
        let current = store
            .get(task_id)
            .await
            .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;
        let from = current.status;

        if from == to {
            return Ok(());
        }

        let permitted = self.matrix.get(&from).cloned().unwrap_or_default();
        if !permitted.contains(&to) {
            return Err(QueueError::InvalidInput(format!(
                "transition {from} -> {to} is not permitted (trigger: {trigger})"
            )));
        }

        for hook in &self.hooks {
            if let Err(err) = hook.before(task_id, from, to) {
                warn!(%task_id, %err, "before-hook aborted transition");
                return Err(err);
            }
        }

        let now = chrono::Utc::now();
        store
            .update(task_id, |task| {
                task.status = to;
                match to {
                    TaskStatus::InProgress if task.started_at.is_none() => {
                        task.started_at = Some(now);
                    }
                    TaskStatus::Completed | TaskStatus::Failed => {
                        task.completed_at = Some(now);
                    }
                    _ => {}
                }
                if matches!(to, TaskStatus::InProgress | TaskStatus::Cancelled) {
                    task.starvation_boost = 0;
                }
            })
            .await?;

        let _ = self.events.send(QueueEvent::TaskStatusChanged {
            task_id: task_id.clone(),
            from,
            to,
        });

        for hook in &self.hooks {
            hook.after(task_id, from, to);
        }

        if to == TaskStatus::Failed {
            let _ = self.events.send(QueueEvent::TaskFailed {
                task_id: task_id.clone(),
                error: current.last_error.clone().unwrap_or_default(),
            });
        }
        if to == TaskStatus::Cancelled {
            let _ = self.events.send(QueueEvent::TaskCancelled {
                task_id: task_id.clone(),
                reason: trigger.to_string(),
            });
        }
        if to == TaskStatus::Completed {
            let _ = self.events.send(QueueEvent::TaskCompleted { task_id: task_id.clone() });
        }

        Ok(())
    }

    pub fn log_after_hook_failure(&self, task_id: &TaskId, err: &QueueError) {
        error!(%task_id, %err, "after-hook failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Task;

    #[tokio::test]
    async fn valid_transition_updates_status() {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let manager = LifecycleManager::new(tx);
        let store = TaskStore::new();
        let task = Task::new("a", "default");
        let id = task.id.clone();
        store.put(task, false).await.unwrap();

        manager.transition(&store, &id, TaskStatus::Assigned, "test").await.unwrap();
        let task = store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let manager = LifecycleManager::new(tx);
        let store = TaskStore::new();
        let task = Task::new("a", "default");
        let id = task.id.clone();
        store.put(task, false).await.unwrap();

        let err = manager
            .transition(&store, &id, TaskStatus::Completed, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn repeated_transition_is_idempotent() {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let manager = LifecycleManager::new(tx);
        let store = TaskStore::new();
        let task = Task::new("a", "default");
        let id = task.id.clone();
        store.put(task, false).await.unwrap();

        manager.transition(&store, &id, TaskStatus::Assigned, "t1").await.unwrap();
        manager.transition(&store, &id, TaskStatus::Assigned, "t2").await.unwrap();
        let task = store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }
}
