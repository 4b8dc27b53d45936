//! C9 — Monitor/Metrics: rolling counters and histograms, health scoring,
//! and the typed event subscription surface. Observation-only: nothing here
//! mutates task state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::types::QueueEvent;

#[cfg(feature = "metrics")]
use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Registry};

const ROLLING_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retries: u64,
    pub success_rate: f64,
    pub average_wait_ms: f64,
    pub p95_wait_ms: f64,
    pub throughput_per_minute: f64,
    pub queue_depth: u64,
    pub running_count: u64,
    pub breakdown_success_rate: f64,
    pub health_score: u8,
    // Recomputable from `health_score`; not worth a lifetime in the persisted envelope.
    #[serde(skip)]
    pub health_status: Option<&'static str>,
}

struct RollingWindow {
    samples: VecDeque<f64>,
}

impl RollingWindow {
    fn new() -> Self {
        Self { samples: VecDeque::with_capacity(ROLLING_WINDOW) }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == ROLLING_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64 - 1.0) * 0.95).round() as usize;
        sorted[idx]
    }
}

struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retries: u64,
    breakdowns_attempted: u64,
    breakdowns_beneficial: u64,
    running: u64,
    queue_depth: u64,
}

#[cfg(feature = "metrics")]
struct PrometheusHandles {
    registry: Registry,
    submitted: Counter,
    completed: Counter,
    failed: Counter,
    queue_depth_gauge: Gauge,
    wait_histogram: Histogram,
}

#[cfg(feature = "metrics")]
impl PrometheusHandles {
    fn new() -> Self {
        let registry = Registry::new();
        let submitted = Counter::new("queue_tasks_submitted_total", "tasks submitted").unwrap();
        let completed = Counter::new("queue_tasks_completed_total", "tasks completed").unwrap();
        let failed = Counter::new("queue_tasks_failed_total", "tasks failed").unwrap();
        let queue_depth_gauge = Gauge::new("queue_depth", "pending tasks").unwrap();
        let wait_histogram =
            Histogram::with_opts(HistogramOpts::new("queue_wait_ms", "wait time in ms")).unwrap();
        registry.register(Box::new(submitted.clone())).ok();
        registry.register(Box::new(completed.clone())).ok();
        registry.register(Box::new(failed.clone())).ok();
        registry.register(Box::new(queue_depth_gauge.clone())).ok();
        registry.register(Box::new(wait_histogram.clone())).ok();
        Self {
            registry,
            submitted,
            completed,
            failed,
            queue_depth_gauge,
            wait_histogram,
        }
    }
}

pub struct Monitor {
    counters: RwLock<Counters>,
    wait_window: RwLock<RollingWindow>,
    sequence: AtomicU64,
    events_tx: broadcast::Sender<QueueEvent>,
    warning_queue_depth: u64,
    warning_error_rate: f64,
    warning_wait_ms: f64,
    #[cfg(feature = "metrics")]
    prometheus: Option<PrometheusHandles>,
}

impl Monitor {
    pub fn new(events_tx: broadcast::Sender<QueueEvent>) -> Self {
        Self {
            counters: RwLock::new(Counters {
                submitted: 0,
                completed: 0,
                failed: 0,
                cancelled: 0,
                retries: 0,
                breakdowns_attempted: 0,
                breakdowns_beneficial: 0,
                running: 0,
                queue_depth: 0,
            }),
            wait_window: RwLock::new(RollingWindow::new()),
            sequence: AtomicU64::new(0),
            events_tx,
            warning_queue_depth: 500,
            warning_error_rate: 0.2,
            warning_wait_ms: 60_000.0,
            #[cfg(feature = "metrics")]
            prometheus: Some(PrometheusHandles::new()),
        }
    }

    #[cfg(feature = "metrics")]
    pub fn prometheus_registry(&self) -> Option<&Registry> {
        self.prometheus.as_ref().map(|p| &p.registry)
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn record_submitted(&self) {
        self.counters.write().await.submitted += 1;
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.submitted.inc();
        }
    }

    pub async fn record_completed(&self, wait_ms: f64) {
        {
            let mut counters = self.counters.write().await;
            counters.completed += 1;
        }
        self.wait_window.write().await.push(wait_ms);
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.completed.inc();
            p.wait_histogram.observe(wait_ms);
        }
    }

    pub async fn record_failed(&self) {
        self.counters.write().await.failed += 1;
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.failed.inc();
        }
    }

    pub async fn record_cancelled(&self) {
        self.counters.write().await.cancelled += 1;
    }

    pub async fn record_retry(&self) {
        self.counters.write().await.retries += 1;
    }

    pub async fn record_breakdown(&self, beneficial: bool) {
        let mut counters = self.counters.write().await;
        counters.breakdowns_attempted += 1;
        if beneficial {
            counters.breakdowns_beneficial += 1;
        }
    }

    pub async fn set_running_count(&self, running: u64) {
        self.counters.write().await.running = running;
    }

    pub async fn set_queue_depth(&self, depth: u64) {
        self.counters.write().await.queue_depth = depth;
        #[cfg(feature = "metrics")]
        if let Some(p) = &self.prometheus {
            p.queue_depth_gauge.set(depth as f64);
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read().await;
        let wait_window = self.wait_window.read().await;

        let total_terminal = counters.completed + counters.failed;
        let success_rate = if total_terminal > 0 {
            counters.completed as f64 / total_terminal as f64
        } else {
            0.0
        };
        let breakdown_success_rate = if counters.breakdowns_attempted > 0 {
            counters.breakdowns_beneficial as f64 / counters.breakdowns_attempted as f64
        } else {
            0.0
        };

        let health_score = Self::health_score(
            counters.queue_depth,
            self.warning_queue_depth,
            1.0 - success_rate,
            self.warning_error_rate,
            wait_window.average(),
            self.warning_wait_ms,
            counters.queue_depth > 0 && counters.running == 0,
        );

        MetricsSnapshot {
            total_submitted: counters.submitted,
            total_completed: counters.completed,
            total_failed: counters.failed,
            total_cancelled: counters.cancelled,
            total_retries: counters.retries,
            success_rate,
            average_wait_ms: wait_window.average(),
            p95_wait_ms: wait_window.p95(),
            throughput_per_minute: counters.completed as f64, // caller windows this externally
            queue_depth: counters.queue_depth,
            running_count: counters.running,
            breakdown_success_rate,
            health_score,
            health_status: Some(Self::health_status(health_score).label()),
        }
    }

    /// Four penalties, each capped at 25 points, summed and subtracted from 100.
    fn health_score(
        queue_depth: u64,
        warning_depth: u64,
        error_rate: f64,
        warning_error_rate: f64,
        wait_ms: f64,
        warning_wait_ms: f64,
        stagnating: bool,
    ) -> u8 {
        let depth_penalty = if queue_depth > warning_depth {
            ((queue_depth - warning_depth) as f64 / warning_depth.max(1) as f64 * 25.0).min(25.0)
        } else {
            0.0
        };
        let error_penalty = if error_rate > warning_error_rate {
            ((error_rate - warning_error_rate) / (1.0 - warning_error_rate).max(0.01) * 25.0).min(25.0)
        } else {
            0.0
        };
        let wait_penalty = if wait_ms > warning_wait_ms {
            ((wait_ms - warning_wait_ms) / warning_wait_ms.max(1.0) * 25.0).min(25.0)
        } else {
            0.0
        };
        let stagnation_penalty = if stagnating { 25.0 } else { 0.0 };

        let total_penalty = depth_penalty + error_penalty + wait_penalty + stagnation_penalty;
        (100.0 - total_penalty).clamp(0.0, 100.0) as u8
    }

    fn health_status(score: u8) -> HealthStatus {
        match score {
            90..=100 => HealthStatus::Healthy,
            70..=89 => HealthStatus::Warning,
            40..=69 => HealthStatus::Critical,
            _ => HealthStatus::Emergency,
        }
    }

    pub fn emit(&self, event: QueueEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl HealthStatus {
    fn label(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Emergency => "emergency",
        }
    }
}

pub struct Subscription {
    pub id: u64,
    pub receiver: broadcast::Receiver<QueueEvent>,
}

pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    tx: broadcast::Sender<QueueEvent>,
}

impl SubscriptionRegistry {
    pub fn new(tx: broadcast::Sender<QueueEvent>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            receiver: self.tx.subscribe(),
        }
    }
}

pub fn new_event_bus() -> (broadcast::Sender<QueueEvent>, Arc<SubscriptionRegistry>) {
    let (tx, _rx) = broadcast::channel(1024);
    let registry = Arc::new(SubscriptionRegistry::new(tx.clone()));
    (tx, registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_rate_is_zero_with_no_terminal_tasks() {
        let (tx, _rx) = broadcast::channel(16);
        let monitor = Monitor::new(tx);
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot.success_rate, 0.0);
    }

    #[tokio::test]
    async fn success_rate_reflects_completed_vs_failed() {
        let (tx, _rx) = broadcast::channel(16);
        let monitor = Monitor::new(tx);
        monitor.record_completed(100.0).await;
        monitor.record_completed(100.0).await;
        monitor.record_failed().await;
        let snapshot = monitor.snapshot().await;
        assert!((snapshot.success_rate - 0.6666).abs() < 0.01);
    }

    #[tokio::test]
    async fn stagnation_with_zero_running_and_nonzero_depth_drops_health() {
        let (tx, _rx) = broadcast::channel(16);
        let monitor = Monitor::new(tx);
        monitor.set_queue_depth(10).await;
        monitor.set_running_count(0).await;
        let snapshot = monitor.snapshot().await;
        assert!(snapshot.health_score < 100);
    }

    #[test]
    fn subscription_ids_increase_monotonically() {
        let (tx, _rx) = broadcast::channel(16);
        let registry = SubscriptionRegistry::new(tx);
        let a = registry.subscribe();
        let b = registry.subscribe();
        assert!(b.id > a.id);
    }
}
