//! Write-only JSON archive of terminal runs.
//!
//! One file per run under the runs directory, for human inspection. The
//! engine never reads these back; the database stays the source of truth.

use serde::Serialize;
use setfarm_core::types::{Run, Step, Story};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Serialize)]
struct RunArchive {
    run: Run,
    steps: Vec<Step>,
    stories: Vec<Story>,
}

/// Write `<runs_dir>/<run_id>.json` with the run, its steps and its stories.
pub async fn archive_run(
    store: &Store,
    runs_dir: &Path,
    run_id: &setfarm_core::types::Id,
) -> Result<PathBuf> {
    let archive = RunArchive {
        run: store.get_run(run_id).await?,
        steps: store.list_steps(run_id).await?,
        stories: store.list_stories_for_run(run_id).await?,
    };

    std::fs::create_dir_all(runs_dir)?;
    let path = runs_dir.join(format!("{run_id}.json"));
    let json = serde_json::to_string_pretty(&archive)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use setfarm_core::types::{Id, RunStatus, StepStatus, StepType};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn archive_writes_run_json() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();

        let now = Utc::now();
        let run = Run {
            id: Id::new(),
            workflow_id: "wf".to_string(),
            task: "archive me".to_string(),
            status: RunStatus::Done,
            meta: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        let step = Step {
            id: Id::new(),
            run_id: run.id.clone(),
            step_index: 0,
            step_id: "plan".to_string(),
            agent_id: "workflow/planner".to_string(),
            step_type: StepType::Single,
            status: StepStatus::Done,
            retry_count: 0,
            abandoned_count: 0,
            input_template: String::new(),
            required_outputs: Vec::new(),
            input: None,
            output: Some("SUMMARY: ok".to_string()),
            loop_config: None,
            current_story_id: None,
            updated_at: now,
        };
        store.seed_run(&run, std::slice::from_ref(&step)).await.unwrap();

        let runs_dir = dir.path().join("runs");
        let path = archive_run(&store, &runs_dir, &run.id).await.unwrap();
        assert!(path.exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["run"]["workflow_id"], "wf");
        assert_eq!(parsed["steps"][0]["step_id"], "plan");
        assert_eq!(parsed["stories"].as_array().unwrap().len(), 0);
    }
}
