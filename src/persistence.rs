//! C8 — Persistence: crash-safe snapshotting of the task store to the local
//! filesystem, with rolling backups and a startup repair pass.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::PersistenceSection;
use crate::errors::{CircuitBreaker, QueueError, Result, RetryManager};
use crate::monitor::MetricsSnapshot;
use crate::optimizer::AdaptationEvent;
use crate::store::{StoreSnapshot, TaskStore};
use crate::types::{Task, TaskStatus};

const STATE_FILENAME: &str = "queue-state.json";
const SCHEMA_VERSION: u32 = 1;

/// The full durable envelope (§6/§4.8): task data plus enough of the engine's
/// runtime state — metrics, optimizer history — to resume without a gap in
/// the observability trail across a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub schema_version: u32,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub metrics: MetricsSnapshot,
    pub optimizer_history: Vec<AdaptationEvent>,
}

impl PersistedState {
    pub fn new(
        session_id: String,
        tasks: Vec<Task>,
        metrics: MetricsSnapshot,
        optimizer_history: Vec<AdaptationEvent>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id,
            timestamp: Utc::now(),
            tasks,
            metrics,
            optimizer_history,
        }
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, state: &PersistedState) -> Result<()>;
    async fn load(&self) -> Result<Option<PersistedState>>;
}

/// Writes via a temp-file-then-rename so a crash mid-write never corrupts
/// the previous snapshot, and rotates the last `maxBackups` copies aside
/// before each write.
pub struct FilesystemSnapshotStore {
    dir: PathBuf,
    max_backups: u32,
    retry: RetryManager,
    breaker: CircuitBreaker,
}

impl FilesystemSnapshotStore {
    pub fn new(config: &PersistenceSection) -> Self {
        Self {
            dir: PathBuf::from(&config.storage_dir),
            max_backups: config.max_backups,
            retry: RetryManager::new(3),
            breaker: CircuitBreaker::new("persistence", config.persistence_failure_threshold, Duration::from_secs(60)),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILENAME)
    }

    fn backups_dir(&self) -> PathBuf {
        self.dir.join("backups")
    }

    fn backup_path(&self, state: &PersistedState) -> PathBuf {
        self.backups_dir()
            .join(format!("backup-{}-{}.json", state.session_id, state.timestamp.to_rfc3339()))
    }

    /// Writes a timestamped copy of `state` into `backups/`, then prunes the
    /// oldest entries beyond `maxBackups` (sorted by filename, which sorts
    /// chronologically since the timestamp is RFC3339).
    async fn write_backup(&self, state: &PersistedState) -> Result<()> {
        if self.max_backups == 0 {
            return Ok(());
        }
        fs::create_dir_all(self.backups_dir()).await?;
        let bytes = serde_json::to_vec_pretty(state)?;
        fs::write(self.backup_path(state), bytes).await?;
        self.prune_backups().await
    }

    async fn prune_backups(&self) -> Result<()> {
        let mut entries = self.list_backups().await;
        entries.sort();
        while entries.len() > self.max_backups as usize {
            let oldest = entries.remove(0);
            let _ = fs::remove_file(&oldest).await;
        }
        Ok(())
    }

    async fn list_backups(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let mut read_dir = match fs::read_dir(self.backups_dir()).await {
            Ok(read_dir) => read_dir,
            Err(_) => return paths,
        };
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => paths.push(entry.path()),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        paths
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes).await?;
        let file = fs::File::open(&tmp_path).await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn newest_backup(&self) -> Option<PathBuf> {
        let mut entries = self.list_backups().await;
        entries.sort();
        entries.pop()
    }
}

#[async_trait]
impl SnapshotStore for FilesystemSnapshotStore {
    async fn save(&self, state: &PersistedState) -> Result<()> {
        if self.breaker.is_open().await {
            return Err(QueueError::PersistenceError(
                "circuit breaker open, skipping write".into(),
            ));
        }

        let result = self
            .retry
            .retry_with_backoff(|| async {
                fs::create_dir_all(&self.dir).await?;
                self.write_backup(state).await?;
                let bytes = serde_json::to_vec_pretty(state)?;
                self.write_atomic(&self.state_path(), &bytes).await
            })
            .await;

        match &result {
            Ok(()) => self.breaker.record_success().await,
            Err(_) => self.breaker.record_failure().await,
        }
        result
    }

    async fn load(&self) -> Result<Option<PersistedState>> {
        let primary = self.state_path();
        if fs::try_exists(&primary).await.unwrap_or(false) {
            match fs::read(&primary).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(state) => return Ok(Some(state)),
                    Err(err) => warn!(%err, "primary state file corrupt, falling back to backup"),
                },
                Err(err) => warn!(%err, "failed reading primary state file, falling back to backup"),
            }
        }

        if let Some(backup) = self.newest_backup().await {
            info!(path = %backup.display(), "restoring from newest backup");
            let bytes = fs::read(&backup).await?;
            let state = serde_json::from_slice(&bytes)?;
            return Ok(Some(state));
        }

        Ok(None)
    }
}

/// In-memory double used by tests and by callers that opt out of durability.
pub struct InMemorySnapshotStore {
    slot: tokio::sync::RwLock<Option<PersistedState>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self { slot: tokio::sync::RwLock::new(None) }
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, state: &PersistedState) -> Result<()> {
        *self.slot.write().await = Some(state.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistedState>> {
        Ok(self.slot.read().await.clone())
    }
}

/// Startup recovery: loads the most recent valid snapshot (if any), resets
/// any task stranded `in_progress`/`starting`/`resuming` back to `queued`
/// (preserving its retry count), and drops dependency edges pointing at
/// tasks no longer present, per the repair contract (§4.8).
pub async fn load_and_repair(
    snapshot_store: &dyn SnapshotStore,
    store: &TaskStore,
    repair: bool,
) -> Result<bool> {
    let Some(mut state) = snapshot_store.load().await? else {
        return Ok(false);
    };

    if repair {
        let known_ids: std::collections::HashSet<_> = state.tasks.iter().map(|t| t.id.clone()).collect();
        for task in &mut state.tasks {
            if task.status.is_active() {
                info!(task_id = %task.id, "resetting stranded in-flight task to queued");
                task.status = TaskStatus::Queued;
                task.started_at = None;
            }
            let before = task.dependency_ids.len();
            task.dependency_ids.retain(|dep| known_ids.contains(dep));
            if task.dependency_ids.len() != before {
                warn!(task_id = %task.id, "dropped dangling dependency edges during repair");
            }
        }
    }

    store.restore(StoreSnapshot { tasks: state.tasks }).await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Task;

    fn empty_state(tasks: Vec<Task>) -> PersistedState {
        PersistedState::new("test-session".to_string(), tasks, MetricsSnapshot::default(), Vec::new())
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let snapshot_store = InMemorySnapshotStore::new();
        let store = TaskStore::new();
        store.put(Task::new("a", "default"), false).await.unwrap();
        let tasks = store.snapshot().await.tasks;
        snapshot_store.save(&empty_state(tasks)).await.unwrap();

        let loaded = snapshot_store.load().await.unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
    }

    #[tokio::test]
    async fn filesystem_store_round_trips_through_tempdir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PersistenceSection {
            storage_dir: tmp.path().to_string_lossy().to_string(),
            ..PersistenceSection::default()
        };
        let snapshot_store = FilesystemSnapshotStore::new(&config);
        let store = TaskStore::new();
        store.put(Task::new("a", "default"), false).await.unwrap();
        let tasks = store.snapshot().await.tasks;
        snapshot_store.save(&empty_state(tasks)).await.unwrap();

        let loaded = snapshot_store.load().await.unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
    }

    #[tokio::test]
    async fn filesystem_store_writes_timestamped_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PersistenceSection {
            storage_dir: tmp.path().to_string_lossy().to_string(),
            ..PersistenceSection::default()
        };
        let snapshot_store = FilesystemSnapshotStore::new(&config);
        snapshot_store.save(&empty_state(Vec::new())).await.unwrap();

        let mut entries = fs::read_dir(tmp.path().join("backups")).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn repair_resets_stranded_in_progress_tasks() {
        let snapshot_store = InMemorySnapshotStore::new();
        let mut task = Task::new("a", "default");
        task.status = TaskStatus::InProgress;
        task.started_at = Some(chrono::Utc::now());
        snapshot_store.save(&empty_state(vec![task])).await.unwrap();

        let store = TaskStore::new();
        load_and_repair(&snapshot_store, &store, true).await.unwrap();
        let restored = store.list(&Default::default()).await;
        assert_eq!(restored[0].status, TaskStatus::Queued);
    }
}
