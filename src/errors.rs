//! Closed error surface for the queue core, plus the retry/circuit-breaker
//! primitives shared by the executor and the persistence writer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::types::TaskId;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),

    #[error("adding this edge would close a cycle: {cycle:?}")]
    CycleIntroduced { cycle: Vec<TaskId> },

    #[error("invariant violation in {component}: {detail}")]
    InvariantViolation { component: String, detail: String },

    #[error("runner error for task {task_id}: {message}")]
    RunnerError { task_id: TaskId, message: String },

    #[error("task {task_id} exceeded its execution deadline")]
    Timeout { task_id: TaskId },

    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("resource pool {pool} unavailable (capacity {capacity})")]
    ResourceUnavailable { pool: String, capacity: u32 },

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("no runner registered under name '{0}'")]
    RunnerMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QueueError {
    /// Whether the failure is in principle retryable by the executor.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::RunnerError { .. } | QueueError::Timeout { .. }
        )
    }
}

/// Exponential-backoff retry helper for internal components (persistence I/O)
/// that retry within a single call. The executor's task-retry path spans
/// multiple scheduler ticks instead, so it drives its own
/// `backoff::ExponentialBackoff` instance directly rather than looping
/// inside this helper.
pub struct RetryManager {
    max_attempts: u32,
    metrics: Arc<RwLock<RetryMetrics>>,
}

#[derive(Debug, Default, Clone)]
struct RetryMetrics {
    total_attempts: u64,
    successful_retries: u64,
    failed_retries: u64,
}

impl RetryManager {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            metrics: Arc::new(RwLock::new(RetryMetrics::default())),
        }
    }

    #[tracing::instrument(skip(self, operation))]
    pub async fn retry_with_backoff<T, E, F, Fut>(&self, mut operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.metrics.write().await.total_attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.metrics.write().await.successful_retries += 1;
                        info!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_attempts => {
                    self.metrics.write().await.failed_retries += 1;
                    let wait = backoff::backoff::Backoff::next_backoff(&mut backoff)
                        .unwrap_or(Duration::from_secs(10));
                    warn!(attempt, %err, ?wait, "operation failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    error!(attempt, %err, "operation failed, giving up");
                    return Err(err);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Guards the persistence writer: opens after repeated consecutive
/// `PersistenceError`s, putting the engine into degraded-no-persistence mode.
pub struct CircuitBreaker {
    name: String,
    state: RwLock<CircuitBreakerState>,
    consecutive_failures: RwLock<u32>,
    failure_threshold: u32,
    opened_at: RwLock<Option<std::time::Instant>>,
    half_open_after: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, half_open_after: Duration) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(CircuitBreakerState::Closed),
            consecutive_failures: RwLock::new(0),
            failure_threshold,
            opened_at: RwLock::new(None),
            half_open_after,
        }
    }

    pub async fn state(&self) -> CircuitBreakerState {
        let mut state = self.state.write().await;
        if *state == CircuitBreakerState::Open {
            if let Some(opened) = *self.opened_at.read().await {
                if opened.elapsed() >= self.half_open_after {
                    *state = CircuitBreakerState::HalfOpen;
                }
            }
        }
        *state
    }

    pub async fn record_success(&self) {
        *self.consecutive_failures.write().await = 0;
        *self.state.write().await = CircuitBreakerState::Closed;
    }

    pub async fn record_failure(&self) {
        let mut failures = self.consecutive_failures.write().await;
        *failures += 1;
        if *failures >= self.failure_threshold {
            *self.state.write().await = CircuitBreakerState::Open;
            *self.opened_at.write().await = Some(std::time::Instant::now());
            error!(breaker = %self.name, failures = *failures, "circuit breaker opened");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == CircuitBreakerState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let manager = RetryManager::new(3);
        let mut attempts = 0;
        let result: std::result::Result<&str, QueueError> = manager
            .retry_with_backoff(|| {
                attempts += 1;
                async move {
                    if attempts == 1 {
                        Err(QueueError::PersistenceError("disk full".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("persistence", 2, Duration::from_secs(60));
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
        breaker.record_failure().await;
        assert!(breaker.is_open().await);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitBreakerState::Closed);
    }
}
