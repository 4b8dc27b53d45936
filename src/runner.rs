//! Abstract `Runner`/`Breakdowner` capabilities and their name-keyed
//! registries (§9 design note: domain task bodies and AI-assisted breakdown
//! are both external collaborators behind a trait, never built-in logic).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::errors::{QueueError, Result};
use crate::types::{DependencyEdge, Task, TaskId};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub dependency_outputs: HashMap<TaskId, serde_json::Value>,
    pub cancellation: CancellationToken,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerOutput {
    pub outputs: HashMap<String, serde_json::Value>,
    pub work_units: u64,
}

impl RunnerOutput {
    pub fn empty() -> Self {
        Self {
            outputs: HashMap::new(),
            work_units: 0,
        }
    }
}

/// A domain task body. The queue core never implements one directly; the
/// caller registers implementations under a stable name (see §6).
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, task: &Task, ctx: ExecutionContext) -> Result<RunnerOutput>;
}

/// A no-op runner used by tracker tasks created by the Breakdowner (§4.6):
/// it "runs" instantly and succeeds, since its real work is already done by
/// the time all of its sub-task dependencies are `completed`.
pub struct NoopRunner;

#[async_trait]
impl Runner for NoopRunner {
    async fn run(&self, _task: &Task, _ctx: ExecutionContext) -> Result<RunnerOutput> {
        Ok(RunnerOutput::empty())
    }
}

#[derive(Debug, Clone)]
pub struct BreakdownPlan {
    pub sub_tasks: Vec<Task>,
    pub internal_edges: Vec<DependencyEdge>,
    pub improvement_estimate: f64,
}

impl BreakdownPlan {
    pub fn not_beneficial() -> Self {
        Self {
            sub_tasks: Vec::new(),
            internal_edges: Vec::new(),
            improvement_estimate: 0.0,
        }
    }

    pub fn is_beneficial(&self) -> bool {
        self.improvement_estimate >= 1.0 && !self.sub_tasks.is_empty()
    }
}

#[async_trait]
pub trait Breakdowner: Send + Sync {
    async fn breakdown(&self, task: &Task) -> Result<BreakdownPlan>;
}

pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, Arc<dyn Runner>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        let mut runners: HashMap<String, Arc<dyn Runner>> = HashMap::new();
        runners.insert("noop".to_string(), Arc::new(NoopRunner));
        Self {
            runners: RwLock::new(runners),
        }
    }

    pub async fn register(&self, name: impl Into<String>, runner: Arc<dyn Runner>) {
        self.runners.write().await.insert(name.into(), runner);
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Runner>> {
        self.runners
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::RunnerMissing(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.runners.read().await.contains_key(name)
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BreakdownerRegistry {
    breakdowners: RwLock<HashMap<String, Arc<dyn Breakdowner>>>,
}

impl BreakdownerRegistry {
    pub fn new(default: Arc<dyn Breakdowner>) -> Self {
        let mut breakdowners: HashMap<String, Arc<dyn Breakdowner>> = HashMap::new();
        breakdowners.insert("default".to_string(), default);
        Self {
            breakdowners: RwLock::new(breakdowners),
        }
    }

    pub async fn register(&self, name: impl Into<String>, breakdowner: Arc<dyn Breakdowner>) {
        self.breakdowners.write().await.insert(name.into(), breakdowner);
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Breakdowner>> {
        self.breakdowners
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::RunnerMissing(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_runner_is_registered_by_default() {
        let registry = RunnerRegistry::new();
        assert!(registry.contains("noop").await);
    }

    #[tokio::test]
    async fn missing_runner_returns_runner_missing() {
        let registry = RunnerRegistry::new();
        let result = registry.get("does-not-exist").await;
        assert!(matches!(result, Err(QueueError::RunnerMissing(_))));
    }
}
