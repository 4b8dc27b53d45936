//! C4 — Executor Pool: semaphore-bounded concurrent execution of assigned
//! tasks, with per-attempt timeout, retry backoff, cancellation and
//! dependent-cascade on terminal failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::FutureExt;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::ExecutionSection;
use crate::errors::{QueueError, Result};
use crate::graph::DependencyGraph;
use crate::lifecycle::LifecycleManager;
use crate::monitor::Monitor;
use crate::runner::{ExecutionContext, RunnerRegistry};
use crate::store::TaskStore;
use crate::types::{ExecutionRecord, Task, TaskId, TaskStatus};

/// Commands accepted by the executor's control loop, mirroring the
/// command-channel actor pattern used throughout this codebase's pool
/// components.
#[derive(Debug)]
pub enum ExecutorCommand {
    Dispatch(TaskId),
    Cancel(TaskId),
    Shutdown,
}

struct InFlight {
    cancellation: CancellationToken,
}

pub struct ExecutorPool {
    semaphore: Arc<Semaphore>,
    config: ExecutionSection,
    store: Arc<TaskStore>,
    graph: Arc<RwLock<DependencyGraph>>,
    lifecycle: Arc<LifecycleManager>,
    runners: Arc<RunnerRegistry>,
    monitor: Arc<Monitor>,
    in_flight: tokio::sync::RwLock<HashMap<TaskId, InFlight>>,
    command_tx: mpsc::UnboundedSender<ExecutorCommand>,
}

impl ExecutorPool {
    pub fn new(
        config: ExecutionSection,
        store: Arc<TaskStore>,
        graph: Arc<RwLock<DependencyGraph>>,
        lifecycle: Arc<LifecycleManager>,
        runners: Arc<RunnerRegistry>,
        monitor: Arc<Monitor>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutorCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            store,
            graph,
            lifecycle,
            runners,
            monitor,
            in_flight: tokio::sync::RwLock::new(HashMap::new()),
            command_tx,
        });
        (pool, command_rx)
    }

    pub fn command_sender(&self) -> mpsc::UnboundedSender<ExecutorCommand> {
        self.command_tx.clone()
    }

    /// Drives the control loop until `Shutdown` is received or the channel
    /// closes. Each `Dispatch` spawns an independent task bounded by the
    /// pool's semaphore; the loop itself never blocks on task completion.
    pub async fn run(self: Arc<Self>, mut command_rx: mpsc::UnboundedReceiver<ExecutorCommand>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                ExecutorCommand::Dispatch(task_id) => {
                    let pool = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = pool.execute(task_id.clone()).await {
                            warn!(%task_id, %err, "execution attempt failed");
                        }
                    });
                }
                ExecutorCommand::Cancel(task_id) => {
                    self.cancel(&task_id).await;
                }
                ExecutorCommand::Shutdown => break,
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.config.max_concurrent_tasks - self.semaphore.available_permits()
    }

    async fn cancel(&self, task_id: &TaskId) {
        if let Some(in_flight) = self.in_flight.read().await.get(task_id) {
            in_flight.cancellation.cancel();
        }
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn execute(&self, task_id: TaskId) -> Result<()> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::ResourceUnavailable {
                pool: "executor".into(),
                capacity: self.config.max_concurrent_tasks as u32,
            })?;

        let task = self
            .store
            .get(&task_id)
            .await
            .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;

        let cancellation = CancellationToken::new();
        self.in_flight
            .write()
            .await
            .insert(task_id.clone(), InFlight { cancellation: cancellation.clone() });

        let result = self.run_with_retry(&task, cancellation.clone()).await;

        self.in_flight.write().await.remove(&task_id);
        drop(permit);

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.cascade_failure(&task_id).await;
                Err(err)
            }
        }
    }

    async fn run_with_retry(&self, task: &Task, cancellation: CancellationToken) -> Result<()> {
        let mut attempt = task.retry_count;

        // One `ExponentialBackoff` per execution, advanced past the attempts
        // already spent (e.g. a task resumed after a crash) so its internal
        // state lines up with `attempt` before the first retry delay.
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.retry_base_delay_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.1)
            .with_max_interval(Duration::from_millis(self.config.retry_max_delay_ms))
            .with_max_elapsed_time(None)
            .build();
        for _ in 0..attempt {
            backoff.next_backoff();
        }

        loop {
            self.lifecycle
                .transition(&self.store, &task.id, TaskStatus::InProgress, "executor:attempt")
                .await?;

            let started_at = chrono::Utc::now();
            let outcome = self
                .run_once(task, attempt, cancellation.clone())
                .await
                .and_then(|output| self.validate_expected_outputs(task, output));
            let ended_at = chrono::Utc::now();

            match outcome {
                Ok(output) => {
                    self.store
                        .append_execution_record(
                            &task.id,
                            ExecutionRecord {
                                attempt,
                                started_at,
                                ended_at: Some(ended_at),
                                success: true,
                                error: None,
                                artifacts: output.outputs,
                                work_units: output.work_units,
                                child_task_count: 0,
                            },
                        )
                        .await?;
                    self.lifecycle
                        .transition(&self.store, &task.id, TaskStatus::Completing, "executor:done")
                        .await?;
                    self.lifecycle
                        .transition(&self.store, &task.id, TaskStatus::Completed, "executor:done")
                        .await?;
                    let wait_ms = (ended_at - task.created_at).num_milliseconds().max(0) as f64;
                    self.monitor.record_completed(wait_ms).await;
                    return Ok(());
                }
                Err(err) => {
                    self.store
                        .append_execution_record(
                            &task.id,
                            ExecutionRecord {
                                attempt,
                                started_at,
                                ended_at: Some(ended_at),
                                success: false,
                                error: Some(err.to_string()),
                                artifacts: HashMap::new(),
                                work_units: 0,
                                child_task_count: 0,
                            },
                        )
                        .await?;

                    if matches!(err, QueueError::Cancelled(_)) {
                        self.lifecycle
                            .transition(&self.store, &task.id, TaskStatus::Cancelled, "executor:cancelled")
                            .await?;
                        return Err(err);
                    }

                    if !err.is_retryable() || attempt >= task.max_retries {
                        self.store
                            .update(&task.id, |t| t.last_error = Some(err.to_string()))
                            .await?;
                        self.lifecycle
                            .transition(&self.store, &task.id, TaskStatus::Failed, "executor:exhausted")
                            .await?;
                        self.monitor.record_failed().await;
                        return Err(err);
                    }

                    attempt += 1;
                    self.store.update(&task.id, |t| t.retry_count = attempt).await?;
                    self.lifecycle
                        .transition(&self.store, &task.id, TaskStatus::Retrying, "executor:retry")
                        .await?;
                    self.monitor.record_retry().await;

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.config.retry_max_delay_ms));
                    info!(task_id = %task.id, attempt, ?delay, "retrying task");
                    tokio::time::sleep(delay).await;
                    self.lifecycle
                        .transition(&self.store, &task.id, TaskStatus::Queued, "executor:retry")
                        .await?;
                    self.lifecycle
                        .transition(&self.store, &task.id, TaskStatus::Assigned, "executor:retry")
                        .await?;
                }
            }
        }
    }

    async fn run_once(
        &self,
        task: &Task,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Result<crate::runner::RunnerOutput> {
        let runner = self.runners.get(&task.runner_name).await?;
        let timeout = Duration::from_millis(self.config.default_timeout_ms);
        let ctx = ExecutionContext {
            dependency_outputs: HashMap::new(),
            cancellation: cancellation.clone(),
            attempt,
        };

        let guarded = std::panic::AssertUnwindSafe(runner.run(task, ctx)).catch_unwind();

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(QueueError::Cancelled(task.id.clone())),
            result = tokio::time::timeout(timeout, guarded) => {
                match result {
                    Ok(Ok(Ok(output))) => Ok(output),
                    Ok(Ok(Err(err))) => Err(err),
                    Ok(Err(payload)) => Err(QueueError::RunnerError {
                        task_id: task.id.clone(),
                        message: panic_message(&payload),
                    }),
                    Err(_) => Err(QueueError::Timeout { task_id: task.id.clone() }),
                }
            }
        }
    }

    fn validate_expected_outputs(
        &self,
        task: &Task,
        output: crate::runner::RunnerOutput,
    ) -> Result<crate::runner::RunnerOutput> {
        for key in task.expected_outputs.keys() {
            if !output.outputs.contains_key(key) {
                return Err(QueueError::RunnerError {
                    task_id: task.id.clone(),
                    message: format!("expected output '{key}' missing from runner result"),
                });
            }
        }
        Ok(output)
    }

    /// On terminal failure, every hard/data dependent transitions to
    /// `blocked` (§4.2); soft dependents are left untouched.
    async fn cascade_failure(&self, task_id: &TaskId) {
        let dependents = self.graph.read().await.dependents(task_id);
        for dependent_id in dependents {
            if let Some(dependent) = self.store.get(&dependent_id).await {
                if dependent.status.is_terminal() {
                    continue;
                }
                let _ = self
                    .lifecycle
                    .transition(&self.store, &dependent_id, TaskStatus::Blocked, "cascade:dependency-failed")
                    .await;
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "runner panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_respects_base_and_cap() {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(60_000))
            .with_multiplier(2.0)
            .with_randomization_factor(0.1)
            .with_max_interval(Duration::from_millis(300_000))
            .with_max_elapsed_time(None)
            .build();

        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(54_000));
        assert!(first <= Duration::from_millis(66_000));

        for _ in 0..10 {
            backoff.next_backoff();
        }
        let capped = backoff.next_backoff().unwrap();
        assert!(capped <= Duration::from_millis(330_000));
    }

    #[tokio::test]
    async fn running_count_reflects_acquired_permits() {
        let store = Arc::new(TaskStore::new());
        let graph = Arc::new(RwLock::new(DependencyGraph::new()));
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let monitor = Arc::new(Monitor::new(tx.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(tx));
        let runners = Arc::new(RunnerRegistry::new());
        let (pool, _command_rx) = ExecutorPool::new(
            ExecutionSection { max_concurrent_tasks: 2, ..ExecutionSection::default() },
            store,
            graph,
            lifecycle,
            runners,
            monitor,
        );
        assert_eq!(pool.running_count(), 0);
    }
}
