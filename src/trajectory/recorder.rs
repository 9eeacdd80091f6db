//! Trajectory recorder.
//!
//! `record_step` flushes to disk before returning; the worker only acks a
//! queue entry after the step that produced it is durable. `finalize` seals
//! the file with a single outcome record carrying the summed aggregates.

use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::TrajectoryError;
use crate::task::{Environment, ErrorKind, Outcome, Step, Task, TrajectoryStatus};
use crate::trajectory::{Grouping, TrajectoryRecord};

/// Writes trajectory files under a root directory, grouped by UTC date.
pub struct TrajectoryRecorder {
    root: PathBuf,
    grouping: Grouping,
    environment: Environment,
}

/// Open trajectory for one task attempt. Sealed by
/// [`TrajectoryRecorder::finalize`]; recording after that is an error.
pub struct TrajectoryHandle {
    task_id: Uuid,
    attempt: u32,
    path: PathBuf,
    file: File,
    sealed: bool,
    started: Instant,
    steps: u32,
    last_step_id: u32,
    total_tokens_in: u64,
    total_tokens_out: u64,
    total_cost_micros: i64,
}

impl TrajectoryHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Highest step id recorded so far.
    pub fn last_step_id(&self) -> u32 {
        self.last_step_id
    }
}

impl TrajectoryRecorder {
    pub fn new(root: impl Into<PathBuf>, grouping: Grouping) -> Self {
        Self {
            root: root.into(),
            grouping,
            environment: Environment::capture(),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn file_path(&self, task_id: Uuid, attempt: u32) -> PathBuf {
        let dir = match self.grouping.dir_for(Utc::now()) {
            Some(group) => self.root.join(group),
            None => self.root.clone(),
        };
        let name = if attempt <= 1 {
            format!("{task_id}.ndjson")
        } else {
            // Redelivered tasks get their own file so every (task, attempt)
            // pair has exactly one outcome record.
            format!("{task_id}.a{attempt}.ndjson")
        };
        dir.join(name)
    }

    /// Open a trajectory file for a task attempt.
    pub async fn begin_task(
        &self,
        task: &Task,
        attempt: u32,
    ) -> Result<TrajectoryHandle, TrajectoryError> {
        let path = self.file_path(task.task_id, attempt);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(TrajectoryHandle {
            task_id: task.task_id,
            attempt,
            path,
            file,
            sealed: false,
            started: Instant::now(),
            steps: 0,
            last_step_id: 0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            total_cost_micros: 0,
        })
    }

    /// Append one step record; flushed and synced before returning.
    pub async fn record_step(
        &self,
        handle: &mut TrajectoryHandle,
        step: &Step,
    ) -> Result<(), TrajectoryError> {
        if handle.sealed {
            return Err(TrajectoryError::Sealed {
                task_id: handle.task_id,
            });
        }
        if step.step_id != handle.last_step_id + 1 {
            tracing::warn!(
                task = %handle.task_id,
                expected = handle.last_step_id + 1,
                got = step.step_id,
                "non-contiguous step id"
            );
        }

        let mut line = serde_json::to_vec(&TrajectoryRecord::Step(step.clone()))?;
        line.push(b'\n');
        handle.file.write_all(&line).await?;
        handle.file.sync_data().await?;

        handle.steps += 1;
        handle.last_step_id = handle.last_step_id.max(step.step_id);
        handle.total_tokens_in += step.tokens_in;
        handle.total_tokens_out += step.tokens_out;
        handle.total_cost_micros += step.cost_micros;
        Ok(())
    }

    /// Seal the trajectory with its outcome record.
    pub async fn finalize(
        &self,
        mut handle: TrajectoryHandle,
        status: TrajectoryStatus,
        error_kind: Option<ErrorKind>,
        final_answer: Option<String>,
    ) -> Result<Outcome, TrajectoryError> {
        if handle.sealed {
            return Err(TrajectoryError::Sealed {
                task_id: handle.task_id,
            });
        }
        handle.sealed = true;

        let outcome = Outcome {
            task_id: handle.task_id,
            attempt: handle.attempt,
            status,
            error_kind,
            final_answer,
            steps: handle.steps,
            total_duration_ms: handle.started.elapsed().as_millis() as u64,
            total_tokens_in: handle.total_tokens_in,
            total_tokens_out: handle.total_tokens_out,
            total_cost_micros: handle.total_cost_micros,
            environment: self.environment.clone(),
        };

        let mut line = serde_json::to_vec(&TrajectoryRecord::Outcome(outcome.clone()))?;
        line.push(b'\n');
        handle.file.write_all(&line).await?;
        handle.file.sync_data().await?;
        Ok(outcome)
    }

    /// Read a trajectory file back into records.
    pub async fn read(
        &self,
        path: &std::path::Path,
    ) -> Result<Vec<TrajectoryRecord>, TrajectoryError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let mut records = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    /// Locate the trajectory file for a task, searching all groups.
    pub async fn find(&self, task_id: Uuid) -> Option<PathBuf> {
        let name = format!("{task_id}.ndjson");
        let mut dirs = vec![self.root.clone()];
        if let Ok(mut entries) = tokio::fs::read_dir(&self.root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    dirs.push(entry.path());
                }
            }
        }
        for dir in dirs {
            let candidate = dir.join(&name);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn recorder(dir: &std::path::Path, grouping: Grouping) -> TrajectoryRecorder {
        TrajectoryRecorder::new(dir, grouping)
    }

    #[tokio::test]
    async fn test_steps_then_outcome_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), Grouping::Daily);
        let task = Task::new("t", TaskType::General);

        let mut handle = recorder.begin_task(&task, 1).await.unwrap();
        recorder
            .record_step(&mut handle, &Step::think(1, "hm").with_usage(10, 5, 7))
            .await
            .unwrap();
        recorder
            .record_step(&mut handle, &Step::answer(2, "4").with_usage(20, 2, 3))
            .await
            .unwrap();
        let path = handle.path().to_path_buf();
        let outcome = recorder
            .finalize(handle, TrajectoryStatus::Success, None, Some("4".to_string()))
            .await
            .unwrap();

        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.total_tokens_in, 30);
        assert_eq!(outcome.total_tokens_out, 7);
        assert_eq!(outcome.total_cost_micros, 10);

        let records = recorder.read(&path).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records.last(), Some(TrajectoryRecord::Outcome(o)) if o.task_id == task.task_id));
    }

    #[tokio::test]
    async fn test_grouped_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), Grouping::Daily);
        let task = Task::new("t", TaskType::General);
        let handle = recorder.begin_task(&task, 1).await.unwrap();

        let group = Grouping::Daily.dir_for(Utc::now()).unwrap();
        assert!(handle.path().starts_with(dir.path().join(group)));

        let flat = TrajectoryRecorder::new(dir.path(), Grouping::None);
        let handle = flat.begin_task(&task, 1).await.unwrap();
        assert_eq!(handle.path().parent().unwrap(), dir.path());
    }

    #[tokio::test]
    async fn test_record_after_finalize_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), Grouping::None);
        let task = Task::new("t", TaskType::General);

        let mut handle = recorder.begin_task(&task, 1).await.unwrap();
        recorder
            .record_step(&mut handle, &Step::think(1, "x"))
            .await
            .unwrap();
        handle.sealed = true;
        let err = recorder
            .record_step(&mut handle, &Step::think(2, "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrajectoryError::Sealed { .. }));
    }

    #[tokio::test]
    async fn test_attempt_files_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), Grouping::None);
        let task = Task::new("t", TaskType::General);

        let first = recorder.begin_task(&task, 1).await.unwrap();
        let second = recorder.begin_task(&task, 2).await.unwrap();
        assert_ne!(first.path(), second.path());
        assert!(second.path().to_string_lossy().contains(".a2."));
    }

    #[tokio::test]
    async fn test_find_searches_groups() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), Grouping::Monthly);
        let task = Task::new("t", TaskType::General);
        let mut handle = recorder.begin_task(&task, 1).await.unwrap();
        recorder
            .record_step(&mut handle, &Step::think(1, "x"))
            .await
            .unwrap();

        let found = recorder.find(task.task_id).await.unwrap();
        assert_eq!(found, handle.path());
        assert!(recorder.find(Uuid::now_v7()).await.is_none());
    }
}
