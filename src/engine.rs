//! Top-level façade wiring C1-C9 into the public Core API (§6). `QueueEngine`
//! owns no scheduling policy itself; it orchestrates the components that do.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::breakdown::DefaultBreakdowner;
use crate::config::{CycleResolution, QueueConfig};
use crate::errors::{QueueError, Result};
use crate::executor::{ExecutorCommand, ExecutorPool};
use crate::graph::{DependencyGraph, TaskFacts};
use crate::lifecycle::LifecycleManager;
use crate::monitor::{Monitor, MetricsSnapshot, Subscription, SubscriptionRegistry};
use crate::optimizer::Optimizer;
use crate::persistence::{load_and_repair, PersistedState, SnapshotStore};
use crate::runner::{Breakdowner, BreakdownerRegistry, Runner, RunnerRegistry};
use crate::scheduler::{PriorityInput, PriorityScheduler, ScoredTask};
use crate::store::{SearchFilter, TaskStore};
use crate::types::{Category, Complexity, DependencyEdge, DependencyKind, Priority, QueueEvent, Task, TaskId, TaskStatus};

/// Caller-facing request to create a task, mirroring §6's `taskSpec`.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub complexity: Complexity,
    pub base_priority: Priority,
    pub runner_name: String,
    pub dependencies: Vec<TaskId>,
    pub required_resources: HashSet<String>,
    pub expected_outputs: HashMap<String, String>,
    pub estimated_duration: Option<chrono::Duration>,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub max_retries: Option<u32>,
    pub tags: HashSet<String>,
    pub payload: serde_json::Value,
    pub use_autonomous_breakdown: bool,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>, runner_name: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            category: Category::Feature,
            complexity: Complexity::Simple,
            base_priority: Priority::Normal,
            runner_name: runner_name.into(),
            dependencies: Vec::new(),
            required_resources: HashSet::new(),
            expected_outputs: HashMap::new(),
            estimated_duration: None,
            deadline: None,
            max_retries: None,
            tags: HashSet::new(),
            payload: serde_json::Value::Null,
            use_autonomous_breakdown: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub status: &'static str,
    pub score: u8,
    pub queue_depth: u64,
    pub running_count: u64,
}

pub struct QueueEngine {
    session_id: String,
    config: Arc<RwLock<QueueConfig>>,
    store: Arc<TaskStore>,
    graph: Arc<RwLock<DependencyGraph>>,
    scheduler: Arc<RwLock<PriorityScheduler>>,
    lifecycle: Arc<LifecycleManager>,
    runners: Arc<RunnerRegistry>,
    breakdowners: Arc<BreakdownerRegistry>,
    executor: Arc<ExecutorPool>,
    executor_commands: tokio::sync::mpsc::UnboundedSender<ExecutorCommand>,
    monitor: Arc<Monitor>,
    subscriptions: Arc<SubscriptionRegistry>,
    optimizer: Arc<Optimizer>,
    snapshot_store: Arc<dyn SnapshotStore>,
    events: tokio::sync::broadcast::Sender<QueueEvent>,
    transitions_since_snapshot: std::sync::atomic::AtomicU32,
}

impl QueueEngine {
    pub async fn new(config: QueueConfig, snapshot_store: Arc<dyn SnapshotStore>) -> Result<Arc<Self>> {
        config.validate()?;

        let (events, _rx) = tokio::sync::broadcast::channel(4096);
        let store = Arc::new(TaskStore::new());

        load_and_repair(snapshot_store.as_ref(), &store, config.persistence.repair_on_load).await?;

        let graph = Arc::new(RwLock::new(DependencyGraph::new()));
        for task in store.list(&SearchFilter::default()).await {
            graph.write().await.ensure_node(&task.id);
        }
        for task in store.list(&SearchFilter::default()).await {
            for dep in &task.dependency_ids {
                let edge = DependencyEdge::new(task.id.clone(), dep.clone(), DependencyKind::Hard);
                let _ = graph.write().await.add_edge(edge, config.scheduler.cycle_resolution);
            }
        }

        let scheduler = Arc::new(RwLock::new(PriorityScheduler::new(config.scheduler.clone())));
        let lifecycle = Arc::new(LifecycleManager::new(events.clone()));
        let runners = Arc::new(RunnerRegistry::new());
        let breakdowners = Arc::new(BreakdownerRegistry::new(Arc::new(DefaultBreakdowner)));
        let monitor = Arc::new(Monitor::new(events.clone()));
        let subscriptions = Arc::new(SubscriptionRegistry::new(events.clone()));
        let optimizer = Arc::new(Optimizer::new(config.optimizer.clone(), events.clone()));

        let (executor, command_rx) = ExecutorPool::new(
            config.execution.clone(),
            Arc::clone(&store),
            Arc::clone(&graph),
            Arc::clone(&lifecycle),
            Arc::clone(&runners),
            Arc::clone(&monitor),
        );
        let executor_commands = executor.command_sender();
        tokio::spawn(Arc::clone(&executor).run(command_rx));

        let engine = Arc::new(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            config: Arc::new(RwLock::new(config)),
            store,
            graph,
            scheduler,
            lifecycle,
            runners,
            breakdowners,
            executor,
            executor_commands,
            monitor,
            subscriptions,
            optimizer,
            snapshot_store,
            events,
            transitions_since_snapshot: std::sync::atomic::AtomicU32::new(0),
        });

        tokio::spawn(Arc::clone(&engine).run_optimizer_ticker());
        tokio::spawn(Arc::clone(&engine).run_auto_save_ticker());

        Ok(engine)
    }

    /// Two independent tickers (§4.7): `observe` feeds the rolling trend at
    /// `optimizationInterval`, `tune` applies at most one bounded adjustment
    /// at the slower `adaptiveParameterTuningMs` cadence.
    async fn run_optimizer_ticker(self: Arc<Self>) {
        let mut observe_tick = tokio::time::interval(self.optimizer.optimization_interval());
        let mut tune_tick = tokio::time::interval(self.optimizer.tuning_interval());
        loop {
            tokio::select! {
                _ = observe_tick.tick() => {
                    let snapshot = self.monitor.snapshot().await;
                    self.optimizer.observe(&snapshot).await;
                }
                _ = tune_tick.tick() => {
                    let snapshot = self.monitor.snapshot().await;
                    let mut config = self.config.write().await;
                    let events = {
                        let config = &mut *config;
                        self.optimizer
                            .tune(&mut config.execution, &mut config.scheduler, &snapshot)
                            .await
                    };
                    drop(config);
                    if !events.is_empty() {
                        self.optimizer.push_history(events).await;
                    }
                }
            }
        }
    }

    async fn run_auto_save_ticker(self: Arc<Self>) {
        loop {
            let interval_ms = self.config.read().await.persistence.auto_save_interval_ms;
            tokio::time::sleep(std::time::Duration::from_millis(interval_ms)).await;
            if let Err(err) = self.persist_state().await {
                warn!(%err, "periodic auto-save failed");
            }
        }
    }

    async fn persist_state(&self) -> Result<()> {
        let tasks = self.store.snapshot().await.tasks;
        let metrics = self.monitor.snapshot().await;
        let optimizer_history = self.optimizer.history().await;
        let state = PersistedState::new(self.session_id.clone(), tasks, metrics, optimizer_history);
        self.snapshot_store.save(&state).await
    }

    pub async fn register_runner(&self, name: impl Into<String>, runner: Arc<dyn Runner>) {
        self.runners.register(name, runner).await;
    }

    pub async fn register_breakdowner(&self, name: impl Into<String>, breakdowner: Arc<dyn Breakdowner>) {
        self.breakdowners.register(name, breakdowner).await;
    }

    #[instrument(skip(self, spec), fields(title = %spec.title))]
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        let config = self.config.read().await.clone();

        let mut task = Task::new(spec.title.clone(), spec.runner_name.clone())
            .with_category(spec.category)
            .with_complexity(spec.complexity)
            .with_priority(spec.base_priority)
            .with_dependencies(spec.dependencies.clone())
            .with_required_resources(spec.required_resources.clone())
            .with_expected_outputs(spec.expected_outputs.clone())
            .with_tags(spec.tags.clone())
            .with_payload(spec.payload.clone())
            .with_autonomous_breakdown(spec.use_autonomous_breakdown);
        task.description = spec.description.clone();
        if let Some(duration) = spec.estimated_duration {
            task.estimated_duration = duration;
        }
        if let Some(deadline) = spec.deadline {
            task = task.with_deadline(deadline);
        }
        if let Some(max_retries) = spec.max_retries {
            task = task.with_max_retries(max_retries);
        }

        let should_break_down = spec.use_autonomous_breakdown
            && config.breakdown.enable_autonomous_breakdown
            && task.complexity.score() >= config.breakdown.breakdown_threshold;

        if should_break_down {
            return self.submit_with_breakdown(task).await;
        }

        self.insert_task(task.clone(), &config).await?;
        Ok(task.id)
    }

    async fn submit_with_breakdown(&self, mut task: Task) -> Result<TaskId> {
        let breakdowner = self.breakdowners.get("default").await?;
        let plan = breakdowner.breakdown(&task).await?;
        self.monitor.record_breakdown(plan.is_beneficial()).await;

        if !plan.is_beneficial() {
            let config = self.config.read().await.clone();
            self.insert_task(task.clone(), &config).await?;
            return Ok(task.id);
        }

        let config = self.config.read().await.clone();
        let mut sub_ids = Vec::with_capacity(plan.sub_tasks.len());
        for sub_task in plan.sub_tasks {
            sub_ids.push(sub_task.id.clone());
            self.insert_task(sub_task, &config).await?;
        }
        for edge in plan.internal_edges {
            self.add_dependency_edge(edge, &config).await?;
        }

        task.subtask_ids = sub_ids.clone();
        task.dependency_ids = sub_ids.into_iter().collect();
        task.runner_name = "noop".to_string();
        let tracker_id = task.id.clone();
        self.insert_task(task, &config).await?;

        info!(tracker = %tracker_id, "task replaced with tracker + sub-DAG via breakdown");
        Ok(tracker_id)
    }

    async fn insert_task(&self, task: Task, config: &QueueConfig) -> Result<()> {
        self.graph.write().await.ensure_node(&task.id);
        let deps: Vec<TaskId> = task.dependency_ids.iter().cloned().collect();
        self.store.put(task.clone(), false).await?;
        self.monitor.record_submitted().await;
        let _ = self.events.send(QueueEvent::TaskSubmitted { task_id: task.id.clone() });

        for dep in deps {
            let edge = DependencyEdge::new(task.id.clone(), dep, DependencyKind::Hard);
            self.add_dependency_edge(edge, config).await?;
        }
        Ok(())
    }

    /// Inserts a blocking edge, applying the configured cycle-resolution
    /// policy when the graph reports a cycle. `graph.rs` only detects and
    /// surfaces cycles; choosing which edge to drop/downgrade under
    /// `bestEffort`/`parallelOptimized` is a priority-aware decision that
    /// belongs here, where Store data is available.
    async fn add_dependency_edge(&self, edge: DependencyEdge, config: &QueueConfig) -> Result<()> {
        let resolution = config.scheduler.cycle_resolution;
        let attempt = self.graph.write().await.add_edge(edge.clone(), resolution);

        match attempt {
            Ok(()) => Ok(()),
            Err(QueueError::CycleIntroduced { cycle }) if resolution == CycleResolution::Strict => {
                Err(QueueError::CycleIntroduced { cycle })
            }
            Err(QueueError::CycleIntroduced { cycle }) => {
                self.resolve_cycle(&edge, cycle, resolution).await
            }
            Err(other) => Err(other),
        }
    }

    async fn resolve_cycle(
        &self,
        edge: &DependencyEdge,
        cycle: Vec<TaskId>,
        resolution: CycleResolution,
    ) -> Result<()> {
        let graph = self.graph.read().await;
        let candidate_edges = graph.edges_in_cycle(&cycle);
        drop(graph);

        let mut weakest: Option<(TaskId, TaskId, i64)> = None;
        for (dependent, depends_on) in &candidate_edges {
            let combined = self.combined_priority(dependent, depends_on).await;
            if weakest.as_ref().map_or(true, |(_, _, w)| combined < *w) {
                weakest = Some((dependent.clone(), depends_on.clone(), combined));
            }
        }

        let Some((dependent, depends_on, _)) = weakest else {
            return Err(QueueError::CycleIntroduced { cycle });
        };

        let mut graph = self.graph.write().await;
        match resolution {
            CycleResolution::BestEffort => {
                graph.remove_edge(&dependent, &depends_on);
                drop(graph);
                let _ = self.events.send(QueueEvent::EdgeDroppedToResolveCycle {
                    edge: (dependent.clone(), depends_on.clone()),
                    cycle: cycle.clone(),
                });
                warn!(?dependent, ?depends_on, "dropped lowest-priority edge to resolve cycle");
            }
            CycleResolution::ParallelOptimized => {
                graph.remove_edge(&dependent, &depends_on);
                let downgraded = DependencyEdge::new(dependent.clone(), depends_on.clone(), DependencyKind::Soft);
                graph.insert_downgraded(downgraded);
                drop(graph);
                warn!(?dependent, ?depends_on, "downgraded hard edge to soft to resolve cycle");
            }
            CycleResolution::Strict => unreachable!("handled by caller"),
        }

        // Ensure the originally requested edge itself ends up present unless
        // it was the one just dropped/downgraded.
        if edge.dependent != dependent || edge.depends_on != depends_on {
            let mut graph = self.graph.write().await;
            let _ = graph.add_edge(edge.clone(), CycleResolution::BestEffort);
        }
        Ok(())
    }

    async fn combined_priority(&self, a: &TaskId, b: &TaskId) -> i64 {
        let a_weight = self.store.get(a).await.map(|t| t.base_priority.weight()).unwrap_or(0);
        let b_weight = self.store.get(b).await.map(|t| t.base_priority.weight()).unwrap_or(0);
        a_weight + b_weight
    }

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: SearchFilter) -> Vec<Task> {
        self.store.list(&filter).await
    }

    pub async fn cancel(&self, id: &TaskId, reason: &str) -> bool {
        let Some(task) = self.store.get(id).await else {
            return false;
        };
        if task.status.is_terminal() {
            return true;
        }

        let _ = self.executor_commands.send(ExecutorCommand::Cancel(id.clone()));
        let result = self
            .lifecycle
            .transition(&self.store, id, TaskStatus::Cancelled, reason)
            .await;
        self.monitor.record_cancelled().await;

        for dependent_id in self.graph.read().await.dependents(id) {
            let _ = self
                .lifecycle
                .transition(&self.store, &dependent_id, TaskStatus::Blocked, "cascade:dependency-cancelled")
                .await;
        }

        result.is_ok()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscriptions.subscribe()
    }

    pub fn unsubscribe(&self, _subscription: Subscription) {
        // broadcast::Receiver unsubscribes by being dropped; nothing further to release.
    }

    pub async fn status(&self) -> SystemHealth {
        let snapshot = self.monitor.snapshot().await;
        SystemHealth {
            status: snapshot.health_status.unwrap_or("healthy"),
            score: snapshot.health_score,
            queue_depth: snapshot.queue_depth,
            running_count: snapshot.running_count,
        }
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.monitor.snapshot().await
    }

    /// One selection-and-dispatch round: computes the ready set, scores it,
    /// selects up to the executor's free slot count, and dispatches.
    #[instrument(skip(self))]
    pub async fn run_scheduling_tick(&self) -> Result<usize> {
        let config = self.config.read().await.clone();
        let pending = self.store.by_status(TaskStatus::Queued).await;

        let mut facts: HashMap<TaskId, TaskFacts> = HashMap::new();
        for task in &pending {
            facts.insert(
                task.id.clone(),
                TaskFacts {
                    estimated_duration: task.estimated_duration,
                    required_resources: task.required_resources.clone(),
                    is_pending: true,
                },
            );
        }
        // Non-pending tasks still need to register as "done" facts for readiness checks.
        for task in self.store.list(&SearchFilter::default()).await {
            facts.entry(task.id.clone()).or_insert(TaskFacts {
                estimated_duration: task.estimated_duration,
                required_resources: task.required_resources.clone(),
                is_pending: !task.status.is_terminal() && task.status != TaskStatus::Completed,
            });
        }

        let ready_ids = self.graph.read().await.ready(&facts);
        if ready_ids.is_empty() {
            self.monitor.set_queue_depth(pending.len() as u64).await;
            return Ok(0);
        }

        let scheduler = self.scheduler.read().await;
        let now = chrono::Utc::now();
        let mut scored = Vec::with_capacity(ready_ids.len());
        for id in &ready_ids {
            let Some(task) = self.store.get(id).await else { continue };
            let dependents_count = self.graph.read().await.dependents(id).len();
            let input = PriorityInput {
                task_id: id.clone(),
                base_priority: task.base_priority,
                age: task.age(),
                deadline: task.deadline,
                dependents_count,
                system_criticality: 0.0,
                starvation_boost: task.starvation_boost,
                category_key: format!("{:?}", task.category),
                resources: task.required_resources.clone(),
            };
            let score = scheduler.score(&input, now);
            scored.push(ScoredTask {
                task_id: id.clone(),
                score,
                category_key: input.category_key,
                resources: input.resources,
                age_hours: task.age().num_seconds() as f64 / 3600.0,
            });

            if scheduler.is_starving(task.age()) {
                let boost = scheduler.starvation_boost_increment(task.starvation_boost);
                let _ = self.store.update(id, |t| t.starvation_boost = boost).await;
            }
        }

        let free_slots = config.execution.max_concurrent_tasks.saturating_sub(self.executor.running_count());
        let outcome = scheduler.select(&scored, free_slots, config.scheduler.selection_policy);
        drop(scheduler);

        for id in &outcome.selected {
            self.lifecycle
                .transition(&self.store, id, TaskStatus::Assigned, "scheduler:selected")
                .await?;
            let _ = self.executor_commands.send(ExecutorCommand::Dispatch(id.clone()));
        }

        self.monitor.set_queue_depth(pending.len() as u64).await;
        self.monitor.set_running_count(self.executor.running_count() as u64).await;
        Ok(outcome.selected.len())
    }

    pub async fn maybe_snapshot(&self) -> Result<()> {
        let config = self.config.read().await.clone();
        let count = self.transitions_since_snapshot.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if count >= config.persistence.snapshot_every_n_transitions {
            self.transitions_since_snapshot.store(0, std::sync::atomic::Ordering::SeqCst);
            self.persist_state().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.executor_commands.send(ExecutorCommand::Shutdown);
        self.persist_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemorySnapshotStore;

    #[tokio::test]
    async fn submit_creates_queued_task() {
        let engine = QueueEngine::new(QueueConfig::default(), Arc::new(InMemorySnapshotStore::new()))
            .await
            .unwrap();
        let id = engine.submit(TaskSpec::new("index corpus", "noop")).await.unwrap();
        let task = engine.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_false() {
        let engine = QueueEngine::new(QueueConfig::default(), Arc::new(InMemorySnapshotStore::new()))
            .await
            .unwrap();
        assert!(!engine.cancel(&TaskId::from("missing"), "test").await);
    }

    #[tokio::test]
    async fn scheduling_tick_dispatches_ready_task() {
        let engine = QueueEngine::new(QueueConfig::default(), Arc::new(InMemorySnapshotStore::new()))
            .await
            .unwrap();
        engine.submit(TaskSpec::new("index corpus", "noop")).await.unwrap();
        let dispatched = engine.run_scheduling_tick().await.unwrap();
        assert_eq!(dispatched, 1);
    }
}
