//! Layered configuration: defaults, overlaid by a file, overlaid by
//! `QUEUE_`-prefixed environment variables. Mirrors the nested-struct +
//! `validate()` + `for_environment()` shape used throughout this codebase's
//! ambient configuration.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStrategy {
    Static,
    AgeBased,
    DeadlineDriven,
    DependencyAware,
    WorkloadAdaptive,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionPolicy {
    StrictPriority,
    WeightedRoundRobin,
    FairQueuing,
    ClassBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StarvationMode {
    None,
    Aging,
    Timeslice,
    Quota,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CycleResolution {
    Strict,
    BestEffort,
    ParallelOptimized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSection {
    pub scheduling_strategy: SchedulingStrategy,
    pub selection_policy: SelectionPolicy,
    pub starvation_mode: StarvationMode,
    pub max_starvation_time_ms: u64,
    pub max_priority_boost: i64,
    pub adjustment_interval_ms: u64,
    pub cycle_resolution: CycleResolution,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            scheduling_strategy: SchedulingStrategy::Hybrid,
            selection_policy: SelectionPolicy::StrictPriority,
            starvation_mode: StarvationMode::Adaptive,
            max_starvation_time_ms: 300_000,
            max_priority_boost: 500,
            adjustment_interval_ms: 30_000,
            cycle_resolution: CycleResolution::Strict,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSection {
    pub max_concurrent_tasks: usize,
    pub default_timeout_ms: u64,
    pub max_retries: u32,
    pub resource_pools: HashMap<String, u32>,
    /// Base for the executor's `min(base * 2^attempt, cap)` retry backoff.
    /// Exposed so tests can shrink it well below the 60s production default.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: num_cpus::get().max(1) * 2,
            default_timeout_ms: 300_000,
            max_retries: 3,
            resource_pools: HashMap::new(),
            retry_base_delay_ms: 60_000,
            retry_max_delay_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownSection {
    pub enable_autonomous_breakdown: bool,
    pub breakdown_threshold: f64,
    pub max_breakdown_depth: u32,
}

impl Default for BreakdownSection {
    fn default() -> Self {
        Self {
            enable_autonomous_breakdown: true,
            breakdown_threshold: 0.7,
            max_breakdown_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerSection {
    pub optimization_interval_ms: u64,
    pub adaptive_parameter_tuning_ms: u64,
    pub regression_threshold: f64,
    pub max_concurrent_tasks_ceiling: usize,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            optimization_interval_ms: 60_000,
            adaptive_parameter_tuning_ms: 300_000,
            regression_threshold: 0.15,
            max_concurrent_tasks_ceiling: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSection {
    pub storage_dir: String,
    pub auto_save_interval_ms: u64,
    pub snapshot_every_n_transitions: u32,
    pub max_backups: u32,
    pub repair_on_load: bool,
    pub persistence_failure_threshold: u32,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            storage_dir: "./queue-data".to_string(),
            auto_save_interval_ms: 30_000,
            snapshot_every_n_transitions: 50,
            max_backups: 10,
            repair_on_load: false,
            persistence_failure_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilitySection {
    pub log_level: LogLevel,
    pub enable_metrics: bool,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub environment: Environment,
    pub scheduler: SchedulerSection,
    pub execution: ExecutionSection,
    pub breakdown: BreakdownSection,
    pub optimizer: OptimizerSection,
    pub persistence: PersistenceSection,
    pub observability: ObservabilitySection,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            scheduler: SchedulerSection::default(),
            execution: ExecutionSection::default(),
            breakdown: BreakdownSection::default(),
            optimizer: OptimizerSection::default(),
            persistence: PersistenceSection::default(),
            observability: ObservabilitySection::default(),
        }
    }
}

impl QueueConfig {
    /// Loads defaults, overlays an optional file, then overlays
    /// `QUEUE_`-prefixed environment variables (e.g. `QUEUE_EXECUTION__MAX_CONCURRENT_TASKS`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let builder = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("QUEUE").separator("__"));
        let merged: Self = builder.build()?.try_deserialize()?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution.max_concurrent_tasks == 0 {
            return Err(QueueError::InvalidInput(
                "execution.maxConcurrentTasks must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.breakdown.breakdown_threshold) {
            return Err(QueueError::InvalidInput(
                "breakdown.breakdownThreshold must be in [0,1]".into(),
            ));
        }
        if self.persistence.max_backups == 0 {
            return Err(QueueError::InvalidInput(
                "persistence.maxBackups must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn for_environment(env: Environment) -> Self {
        let mut config = Self {
            environment: env,
            ..Self::default()
        };
        match env {
            Environment::Development => {
                config.observability.log_level = LogLevel::Debug;
            }
            Environment::Staging => {
                config.observability.log_level = LogLevel::Info;
            }
            Environment::Production => {
                config.observability.log_level = LogLevel::Warn;
                config.persistence.max_backups = 20;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = QueueConfig::default();
        config.execution.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_profile_raises_backup_retention() {
        let config = QueueConfig::for_environment(Environment::Production);
        assert_eq!(config.persistence.max_backups, 20);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = QueueConfig::from_file("/nonexistent/path/queue.toml").unwrap();
        assert_eq!(config.execution.max_retries, 3);
    }
}
