//! Where terminal outcomes go.
//!
//! The scheduler hands every [`OutcomeRecord`] to a [`TrackingSink`] exactly
//! once. A failed write is logged by the caller and never rolls back the
//! task's terminal state.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::state_machine::OutcomeRecord;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracking record could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait TrackingSink: Send + Sync {
    async fn record(&self, outcome: &OutcomeRecord) -> Result<(), TrackingError>;
}

/// Appends one JSON object per line.
pub struct JsonlTrackingSink {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlTrackingSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read every record back. Blank lines are ignored; a missing file is empty.
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<OutcomeRecord>, TrackingError> {
        let contents = match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(TrackingError::from))
            .collect()
    }
}

#[async_trait]
impl TrackingSink for JsonlTrackingSink {
    async fn record(&self, outcome: &OutcomeRecord) -> Result<(), TrackingError> {
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory. Used by the demo and by tests.
#[derive(Default)]
pub struct MemoryTrackingSink {
    records: Mutex<Vec<OutcomeRecord>>,
    failing: Mutex<bool>,
}

impl MemoryTrackingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn records_guard(&self) -> MutexGuard<'_, Vec<OutcomeRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.records_guard().clone()
    }

    /// Make every following write fail, as a broken disk would.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = failing;
    }
}

#[async_trait]
impl TrackingSink for MemoryTrackingSink {
    async fn record(&self, outcome: &OutcomeRecord) -> Result<(), TrackingError> {
        if *self.failing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            return Err(TrackingError::Io(std::io::Error::other("sink unavailable")));
        }
        self.records_guard().push(outcome.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::platform::JobListing;
    use crate::state_machine::{
        AppState, ApplicationTask, FinalState, StateMachine, StepOutcome, TaskLimits,
    };

    fn finished(job_id: &str) -> OutcomeRecord {
        let mut task = ApplicationTask::new(
            JobListing::new("board", job_id, "Rust Engineer", "Acme", "Remote"),
            0.5,
            0,
            TaskLimits {
                max_retries: 3,
                max_detections: 2,
            },
            Duration::from_secs(60),
        );
        while !task.state.is_terminal() {
            StateMachine::next(&mut task, StepOutcome::Done);
        }
        assert_eq!(task.state, AppState::Succeeded);
        OutcomeRecord::from_task(&task)
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outcomes.jsonl");
        let sink = JsonlTrackingSink::new(&path);

        sink.record(&finished("1")).await.unwrap();
        sink.record(&finished("2")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);

        let records = JsonlTrackingSink::read_all(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].job_id, "1");
        assert_eq!(records[1].final_state, FinalState::Succeeded);
    }

    #[tokio::test]
    async fn read_all_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = JsonlTrackingSink::read_all(dir.path().join("none.jsonl"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn read_all_rejects_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        assert!(matches!(
            JsonlTrackingSink::read_all(&path).await,
            Err(TrackingError::Json(_))
        ));
    }

    #[tokio::test]
    async fn memory_sink_can_fail_on_demand() {
        let sink = MemoryTrackingSink::new();
        sink.record(&finished("1")).await.unwrap();
        sink.set_failing(true);
        assert!(sink.record(&finished("2")).await.is_err());
        sink.set_failing(false);
        assert_eq!(sink.records().len(), 1);
    }
}
