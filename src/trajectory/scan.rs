//! Startup recovery scan.
//!
//! A trajectory file without a final outcome record means the process died
//! mid-task before the queue entry was acked. The scan runs before workers
//! start: it seals every such file with a `crashed` outcome so no task ever
//! lacks an outcome record, and reports the affected task ids so their
//! statuses can be corrected.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::TrajectoryError;
use crate::task::{Environment, Outcome, TrajectoryStatus};
use crate::trajectory::TrajectoryRecord;

/// A partial trajectory found (and sealed) by the scan.
#[derive(Debug, Clone)]
pub struct CrashedTask {
    pub task_id: Uuid,
    pub attempt: u32,
    pub path: PathBuf,
    pub steps: u32,
}

/// Scan the trajectory root and seal outcome-less files as `crashed`.
pub async fn scan_and_mark_crashed(root: &Path) -> Result<Vec<CrashedTask>, TrajectoryError> {
    let mut crashed = Vec::new();
    if !root.exists() {
        return Ok(crashed);
    }

    for file in collect_trajectory_files(root).await? {
        let Some((task_id, attempt)) = parse_file_name(&file) else {
            tracing::debug!("skipping non-trajectory file {}", file.display());
            continue;
        };

        let raw = tokio::fs::read_to_string(&file).await?;
        let mut steps = 0u32;
        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        let mut cost = 0i64;
        let mut has_outcome = false;

        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<TrajectoryRecord>(line) {
                Ok(TrajectoryRecord::Step(step)) => {
                    steps += 1;
                    tokens_in += step.tokens_in;
                    tokens_out += step.tokens_out;
                    cost += step.cost_micros;
                }
                Ok(TrajectoryRecord::Outcome(_)) => has_outcome = true,
                Err(e) => {
                    tracing::warn!("unreadable record in {}: {e}", file.display());
                }
            }
        }

        if has_outcome {
            continue;
        }

        let outcome = Outcome {
            task_id,
            attempt,
            status: TrajectoryStatus::Crashed,
            error_kind: None,
            final_answer: None,
            steps,
            total_duration_ms: 0,
            total_tokens_in: tokens_in,
            total_tokens_out: tokens_out,
            total_cost_micros: cost,
            environment: Environment::capture(),
        };

        let mut line = serde_json::to_vec(&TrajectoryRecord::Outcome(outcome))?;
        line.push(b'\n');
        let mut handle = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&file)
            .await?;
        handle.write_all(&line).await?;
        handle.sync_data().await?;

        tracing::warn!(task = %task_id, attempt, "marked partial trajectory as crashed");
        crashed.push(CrashedTask {
            task_id,
            attempt,
            path: file,
            steps,
        });
    }

    Ok(crashed)
}

async fn collect_trajectory_files(root: &Path) -> Result<Vec<PathBuf>, TrajectoryError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    // One level of grouping directories under the root.
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() && dir == root {
                dirs.push(path);
            } else if file_type.is_file()
                && path.extension().map(|e| e == "ndjson").unwrap_or(false)
            {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `{task_id}.ndjson` or `{task_id}.a{attempt}.ndjson`.
fn parse_file_name(path: &Path) -> Option<(Uuid, u32)> {
    let stem = path.file_stem()?.to_str()?;
    match stem.split_once('.') {
        None => Some((Uuid::parse_str(stem).ok()?, 1)),
        Some((id, attempt)) => {
            let attempt = attempt.strip_prefix('a')?.parse().ok()?;
            Some((Uuid::parse_str(id).ok()?, attempt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Step, Task, TaskType};
    use crate::trajectory::{Grouping, TrajectoryRecorder};

    #[tokio::test]
    async fn test_partial_file_marked_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TrajectoryRecorder::new(dir.path(), Grouping::Daily);
        let task = Task::new("t", TaskType::General);

        let mut handle = recorder.begin_task(&task, 1).await.unwrap();
        recorder
            .record_step(&mut handle, &Step::think(1, "hm").with_usage(5, 5, 1))
            .await
            .unwrap();
        recorder
            .record_step(&mut handle, &Step::think(2, "hm again"))
            .await
            .unwrap();
        // Dropped without finalize: simulates a worker crash.
        drop(handle);

        let crashed = scan_and_mark_crashed(dir.path()).await.unwrap();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].task_id, task.task_id);
        assert_eq!(crashed[0].steps, 2);

        // The file now ends with a crashed outcome record.
        let records = recorder.read(&crashed[0].path).await.unwrap();
        match records.last().unwrap() {
            TrajectoryRecord::Outcome(outcome) => {
                assert_eq!(outcome.status, TrajectoryStatus::Crashed);
                assert_eq!(outcome.steps, 2);
                assert_eq!(outcome.total_tokens_in, 5);
            }
            other => panic!("expected outcome, got {other:?}"),
        }

        // Idempotent: a second scan finds nothing to repair.
        let again = scan_and_mark_crashed(dir.path()).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_finalized_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TrajectoryRecorder::new(dir.path(), Grouping::None);
        let task = Task::new("t", TaskType::General);

        let mut handle = recorder.begin_task(&task, 1).await.unwrap();
        recorder
            .record_step(&mut handle, &Step::answer(1, "4"))
            .await
            .unwrap();
        recorder
            .finalize(handle, TrajectoryStatus::Success, None, Some("4".into()))
            .await
            .unwrap();

        let crashed = scan_and_mark_crashed(dir.path()).await.unwrap();
        assert!(crashed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-created-yet");
        let crashed = scan_and_mark_crashed(&missing).await.unwrap();
        assert!(crashed.is_empty());
    }

    #[test]
    fn test_parse_file_names() {
        let id = Uuid::now_v7();
        let (parsed, attempt) =
            parse_file_name(Path::new(&format!("/x/{id}.ndjson"))).unwrap();
        assert_eq!((parsed, attempt), (id, 1));

        let (parsed, attempt) =
            parse_file_name(Path::new(&format!("/x/{id}.a3.ndjson"))).unwrap();
        assert_eq!((parsed, attempt), (id, 3));

        assert!(parse_file_name(Path::new("/x/notes.ndjson")).is_none());
    }
}
