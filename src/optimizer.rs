//! C7 — Optimizer: periodic, guarded-delta tuning of scheduling and
//! execution parameters from observed throughput/success-rate trends, with
//! regression detection and rollback. No learned model: every adjustment is
//! a small bounded nudge justified by a concrete signal (§9 design note).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{ExecutionSection, OptimizerSection, SchedulerSection};
use crate::monitor::MetricsSnapshot;
use crate::types::QueueEvent;

const TREND_WINDOW: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationEvent {
    pub parameter: String,
    pub old_value: String,
    pub new_value: String,
    pub reason: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

struct Trend {
    success_rate: VecDeque<f64>,
    average_wait_ms: VecDeque<f64>,
}

impl Trend {
    fn new() -> Self {
        Self { success_rate: VecDeque::new(), average_wait_ms: VecDeque::new() }
    }

    fn push(&mut self, snapshot: &MetricsSnapshot) {
        if self.success_rate.len() == TREND_WINDOW {
            self.success_rate.pop_front();
        }
        if self.average_wait_ms.len() == TREND_WINDOW {
            self.average_wait_ms.pop_front();
        }
        self.success_rate.push_back(snapshot.success_rate);
        self.average_wait_ms.push_back(snapshot.average_wait_ms);
    }

    fn average_success_rate(&self) -> f64 {
        avg(&self.success_rate)
    }

    fn average_wait(&self) -> f64 {
        avg(&self.average_wait_ms)
    }
}

fn avg(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Bounds and applies a single-step change to `execution.maxConcurrentTasks`
/// and `scheduler.maxStarvationTimeMs`, keeping a rollback checkpoint so a
/// regression in the following interval can be undone.
pub struct Optimizer {
    config: OptimizerSection,
    trend: RwLock<Trend>,
    last_checkpoint: RwLock<Option<(ExecutionSection, SchedulerSection, MetricsSnapshot)>>,
    history: RwLock<Vec<AdaptationEvent>>,
    events: tokio::sync::broadcast::Sender<QueueEvent>,
}

impl Optimizer {
    pub fn new(config: OptimizerSection, events: tokio::sync::broadcast::Sender<QueueEvent>) -> Self {
        Self {
            config,
            trend: RwLock::new(Trend::new()),
            last_checkpoint: RwLock::new(None),
            history: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn optimization_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.optimization_interval_ms)
    }

    pub fn tuning_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.adaptive_parameter_tuning_ms)
    }

    pub async fn observe(&self, snapshot: &MetricsSnapshot) {
        self.trend.write().await.push(snapshot);
    }

    /// Applies one bounded adjustment to `execution` and `scheduler`, given
    /// the rolling trend so far, and records a rollback checkpoint against
    /// the snapshot in effect at the time of the change.
    pub async fn tune(
        &self,
        execution: &mut ExecutionSection,
        scheduler: &mut SchedulerSection,
        current_snapshot: &MetricsSnapshot,
    ) -> Vec<AdaptationEvent> {
        if self.maybe_rollback(execution, scheduler, current_snapshot).await {
            return Vec::new();
        }

        let trend = self.trend.read().await;
        let mut events = Vec::new();

        let before_execution = execution.clone();
        let before_scheduler = scheduler.clone();

        let success_rate = trend.average_success_rate();
        let average_wait = trend.average_wait();

        // Sustained low success rate: shrink concurrency so retries don't
        // compound resource contention.
        if success_rate > 0.0 && success_rate < 0.7 && execution.max_concurrent_tasks > 1 {
            let old = execution.max_concurrent_tasks;
            execution.max_concurrent_tasks = (old - 1).max(1);
            events.push(self.record(
                "execution.maxConcurrentTasks",
                old.to_string(),
                execution.max_concurrent_tasks.to_string(),
                format!("success rate trending at {success_rate:.2}"),
            ));
        }

        // Healthy success rate and growing queue wait: cautiously raise the
        // ceiling, never past the configured cap.
        if success_rate >= 0.95
            && average_wait > 5_000.0
            && execution.max_concurrent_tasks < self.config.max_concurrent_tasks_ceiling
        {
            let old = execution.max_concurrent_tasks;
            execution.max_concurrent_tasks = (old + 1).min(self.config.max_concurrent_tasks_ceiling);
            events.push(self.record(
                "execution.maxConcurrentTasks",
                old.to_string(),
                execution.max_concurrent_tasks.to_string(),
                format!("high success rate ({success_rate:.2}) with rising wait ({average_wait:.0}ms)"),
            ));
        }

        // Wait time creeping toward the starvation floor: loosen it slightly
        // so the aging boost kicks in sooner.
        if average_wait > scheduler.max_starvation_time_ms as f64 * 0.8 {
            let old = scheduler.max_starvation_time_ms;
            scheduler.max_starvation_time_ms = (old as f64 * 0.9) as u64;
            events.push(self.record(
                "scheduler.maxStarvationTimeMs",
                old.to_string(),
                scheduler.max_starvation_time_ms.to_string(),
                "average wait approaching starvation threshold".into(),
            ));
        }

        if !events.is_empty() {
            *self.last_checkpoint.write().await =
                Some((before_execution, before_scheduler, current_snapshot.clone()));
        }

        events
    }

    /// Reverts the last applied delta if the snapshot since then regressed
    /// by more than `regressionThreshold` on success rate.
    async fn maybe_rollback(
        &self,
        execution: &mut ExecutionSection,
        scheduler: &mut SchedulerSection,
        current_snapshot: &MetricsSnapshot,
    ) -> bool {
        let Some((prev_execution, prev_scheduler, baseline)) = self.last_checkpoint.read().await.clone() else {
            return false;
        };

        let regressed = baseline.success_rate - current_snapshot.success_rate > self.config.regression_threshold;
        if !regressed {
            return false;
        }

        warn!(
            baseline = baseline.success_rate,
            current = current_snapshot.success_rate,
            "optimizer detected regression, rolling back last adjustment"
        );
        *execution = prev_execution;
        *scheduler = prev_scheduler;
        *self.last_checkpoint.write().await = None;
        let _ = self.events.send(QueueEvent::AlertRaised {
            code: "optimizer-rollback".into(),
            message: "reverted last adaptive tuning step due to success-rate regression".into(),
        });
        true
    }

    fn record(&self, parameter: &str, old_value: String, new_value: String, reason: String) -> AdaptationEvent {
        let event = AdaptationEvent {
            parameter: parameter.to_string(),
            old_value: old_value.clone(),
            new_value: new_value.clone(),
            reason,
            applied_at: chrono::Utc::now(),
        };
        info!(parameter, old_value, new_value, "adaptive tuning applied");
        let _ = self.events.send(QueueEvent::AdaptationApplied {
            parameter: parameter.to_string(),
            old_value,
            new_value,
        });
        event
    }

    pub async fn history(&self) -> Vec<AdaptationEvent> {
        self.history.read().await.clone()
    }

    pub async fn push_history(&self, events: Vec<AdaptationEvent>) {
        self.history.write().await.extend(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(success_rate: f64, average_wait_ms: f64) -> MetricsSnapshot {
        MetricsSnapshot { success_rate, average_wait_ms, ..Default::default() }
    }

    #[tokio::test]
    async fn low_success_rate_shrinks_concurrency() {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let optimizer = Optimizer::new(OptimizerSection::default(), tx);
        for _ in 0..10 {
            optimizer.observe(&snapshot(0.5, 1_000.0)).await;
        }
        let mut execution = ExecutionSection { max_concurrent_tasks: 8, ..ExecutionSection::default() };
        let mut scheduler = SchedulerSection::default();
        let events = optimizer.tune(&mut execution, &mut scheduler, &snapshot(0.5, 1_000.0)).await;
        assert_eq!(execution.max_concurrent_tasks, 7);
        assert!(!events.is_empty());
    }

    #[tokio::test]
    async fn regression_triggers_rollback() {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let optimizer = Optimizer::new(OptimizerSection::default(), tx);
        for _ in 0..10 {
            optimizer.observe(&snapshot(0.5, 1_000.0)).await;
        }
        let mut execution = ExecutionSection { max_concurrent_tasks: 8, ..ExecutionSection::default() };
        let mut scheduler = SchedulerSection::default();
        optimizer.tune(&mut execution, &mut scheduler, &snapshot(0.5, 1_000.0)).await;
        assert_eq!(execution.max_concurrent_tasks, 7);

        let regressed = snapshot(0.1, 1_000.0);
        optimizer.tune(&mut execution, &mut scheduler, &regressed).await;
        assert_eq!(execution.max_concurrent_tasks, 8);
    }
}
