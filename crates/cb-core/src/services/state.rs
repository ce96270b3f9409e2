use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::error::{BootstrapError, Result};
use crate::models::{ExecutionRecord, Outcome, Step, StepStatus};

pub const STATE_FILENAME: &str = "state.json";

/// (host id, step id)
pub type RecordKey = (String, String);

/// Durable (host, step) completion records. The single source of truth for
/// resuming a run.
pub struct StateTracker {
    state_file_path: Option<PathBuf>,
    records: RwLock<BTreeMap<RecordKey, ExecutionRecord>>,
    /// Serializes file writes so the last write always carries the latest map.
    write_lock: Mutex<()>,
}

impl StateTracker {
    pub fn new(state_directory: &Path) -> Self {
        Self {
            state_file_path: Some(state_directory.join(STATE_FILENAME)),
            records: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Tracker that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            state_file_path: None,
            records: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a tracker and load any records persisted by a previous run.
    pub async fn open(state_directory: &Path) -> Result<Self> {
        let tracker = Self::new(state_directory);
        tracker.load().await?;
        Ok(tracker)
    }

    pub fn state_file_path(&self) -> Option<&Path> {
        self.state_file_path.as_deref()
    }

    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.state_file_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BootstrapError::State(format!("failed to read state file: {e}")))?;
        let loaded: Vec<ExecutionRecord> = serde_json::from_str(&json)?;
        let mut records = self.records.write().await;
        *records = loaded
            .into_iter()
            .map(|r| ((r.host.clone(), r.step.clone()), r))
            .collect();
        tracing::debug!(count = records.len(), "state_loaded");
        Ok(())
    }

    /// Store the status implied by `outcome`. Outcomes that record nothing
    /// (cancelled work) leave the existing record untouched.
    pub async fn record_outcome(&self, host: &str, step: &Step, outcome: &Outcome) -> Result<()> {
        let Some(status) = outcome.status() else {
            return Ok(());
        };
        {
            let mut records = self.records.write().await;
            let record = records
                .entry((host.to_string(), step.id.clone()))
                .or_insert_with(|| ExecutionRecord::pending(host, &step.id, step.phase));
            record.status = status;
            record.phase = step.phase;
            record.updated_at = Utc::now();
            record.last_error = outcome.detail().filter(|_| status != StepStatus::Success);
            record.attempts += 1;
        }
        self.persist().await
    }

    /// Mark work on (host, step) as started. A `pending` record that
    /// survives a crash tells the next run the step never finished.
    pub async fn mark_pending(&self, host: &str, step: &Step) -> Result<()> {
        {
            let mut records = self.records.write().await;
            let record = records
                .entry((host.to_string(), step.id.clone()))
                .or_insert_with(|| ExecutionRecord::pending(host, &step.id, step.phase));
            record.status = StepStatus::Pending;
            record.updated_at = Utc::now();
        }
        self.persist().await
    }

    pub async fn is_satisfied(&self, host: &str, step: &str) -> bool {
        self.status(host, step).await == Some(StepStatus::Success)
    }

    pub async fn status(&self, host: &str, step: &str) -> Option<StepStatus> {
        self.record(host, step).await.map(|r| r.status)
    }

    pub async fn record(&self, host: &str, step: &str) -> Option<ExecutionRecord> {
        let records = self.records.read().await;
        records
            .get(&(host.to_string(), step.to_string()))
            .cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<RecordKey, ExecutionRecord> {
        self.records.read().await.clone()
    }

    /// Drop records for a host, or only the named step. Returns how many
    /// records were removed.
    pub async fn reset(&self, host: &str, step: Option<&str>) -> Result<usize> {
        self.reset_matching(host, |s| step.map_or(true, |id| id == s))
            .await
    }

    /// Drop the records of `host` whose step id satisfies `matches`.
    pub async fn reset_matching(&self, host: &str, matches: impl Fn(&str) -> bool) -> Result<usize> {
        let removed = {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|(h, s), _| !(h == host && matches(s.as_str())));
            before - records.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_file_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let records: Vec<ExecutionRecord> = self.records.read().await.values().cloned().collect();
        let json = serde_json::to_string_pretty(&records)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BootstrapError::State(format!("failed to create state dir: {e}")))?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| BootstrapError::State(format!("failed to write state file: {e}")))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|e| BootstrapError::State(format!("failed to replace state file: {e}")))?;
        Ok(())
    }
}
