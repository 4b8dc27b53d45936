//! An autonomous, dependency-aware task-queue scheduler: priority-driven
//! selection, concurrent execution with retry/backoff, crash-safe
//! persistence and continuous self-tuning, built on tokio.
//!
//! The public surface is [`engine::QueueEngine`]; everything else is an
//! internal component the engine wires together (see each module's
//! top-of-file doc comment for its responsibility).

pub mod breakdown;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod lifecycle;
pub mod monitor;
pub mod optimizer;
pub mod persistence;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod types;

pub use config::QueueConfig;
pub use engine::{QueueEngine, SystemHealth, TaskSpec};
pub use errors::{QueueError, Result};
pub use runner::{Breakdowner, BreakdownPlan, ExecutionContext, Runner, RunnerOutput};
pub use types::{Category, Complexity, DependencyEdge, DependencyKind, Priority, QueueEvent, Task, TaskId, TaskStatus};

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` global default from `RUST_LOG` (falling
/// back to the configured [`config::LogLevel`]). Safe to call once per
/// process; subsequent calls are no-ops.
pub fn init_logging(default_level: config::LogLevel) {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level.as_filter()));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}

/// Optional process-global default engine, for callers that want a single
/// shared instance instead of threading `Arc<QueueEngine>` through their own
/// code (§9 design note). The core itself never reaches for this; it is
/// purely a convenience for embedders.
static GLOBAL_ENGINE: OnceLock<std::sync::Arc<QueueEngine>> = OnceLock::new();

/// Registers `engine` as the process-global instance. Returns `Err(engine)`
/// if one was already installed.
pub fn set_global_engine(engine: std::sync::Arc<QueueEngine>) -> std::result::Result<(), std::sync::Arc<QueueEngine>> {
    GLOBAL_ENGINE.set(engine)
}

pub fn global_engine() -> Option<&'static std::sync::Arc<QueueEngine>> {
    GLOBAL_ENGINE.get()
}
