//! SQLite store for the workflow engine.
//!
//! Exclusive owner of persistent state: runs, steps, stories, events, medic
//! checks. Every mutating compound operation is one transaction; claims are
//! made atomic across processes by conditional `UPDATE .. WHERE status = ..`
//! guards checked through `rows_affected`.

use chrono::{DateTime, Utc};
use setfarm_core::types::{
    Event, Id, LoopConfig, MedicCheck, Run, RunStatus, Step, StepStatus, StepType, Story,
    StoryStatus, META_LAST_RESUME_AT, META_RESUME_COUNT,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("step not found: {0}")]
    StepNotFound(String),
    #[error("story not found: {0}")]
    StoryNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Explicit column lists keep row mapping stable across ALTER TABLE
/// migrations, which append columns at the end.
const STEP_COLUMNS: &str = "id, run_id, step_index, step_id, agent_id, step_type, status, \
    retry_count, abandoned_count, input_template, required_outputs_json, input, output, \
    loop_source_step, loop_workers, loop_verify_each, loop_verify_agent, current_story_id, \
    updated_at";

const STORY_COLUMNS: &str = "id, run_id, step_db_id, story_id, story_index, title, input, \
    status, needs_verify, output, retry_count, abandoned_count, updated_at";

/// Outcome of finishing a step and advancing the cursor.
#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    /// The next step by index is now `pending`.
    NextPending(Step),
    /// There was no next step; the run is `done`.
    RunDone,
    /// The step was not in a finishable state; nothing changed.
    NotFinishable,
}

/// Outcome of a `fail` on a step.
#[derive(Debug, Clone)]
pub enum StepFailOutcome {
    /// Retry budget not yet spent; the step is `pending` again.
    Retried { retry_count: u32 },
    /// Budget exhausted; the step is `failed` and the run `failed`.
    Exhausted { retry_count: u32 },
    /// The step was not claimable or already terminal; nothing changed.
    Ignored,
}

/// Outcome of a `complete` on a story.
#[derive(Debug, Clone)]
pub enum StoryCompleteOutcome {
    /// `verify_each` cycle: the story is back in `pending` awaiting a verifier.
    AwaitingVerify,
    Verified,
    /// The story was not running; nothing changed.
    Ignored,
}

/// Outcome of a `fail` on a story.
#[derive(Debug, Clone)]
pub enum StoryFailOutcome {
    /// The story is `pending` again for the worker role.
    Retried { retry_count: u32 },
    /// Story retry budget exhausted; the story is `failed`.
    Exhausted { retry_count: u32 },
    Ignored,
}

/// Store backend. One per process; hand out `&Store` to everything.
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if needed) the database at the given path.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Single-writer WAL with a bounded wait for cross-process claims.
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations in order. Idempotent.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/0001_init.sql"),
            include_str!("../../../migrations/0002_add_medic_state.sql"),
        ];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match sqlx::query(trimmed).execute(&self.pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Run operations ---

    /// Insert a run together with its seeded steps: the first step `pending`,
    /// the rest `waiting`. One transaction.
    pub async fn seed_run(&self, run: &Run, steps: &[Step]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO runs (id, workflow_id, task, status, meta_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(run.id.as_ref())
        .bind(&run.workflow_id)
        .bind(&run.task)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.meta)?)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for step in steps {
            insert_step_tx(&mut tx, step).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    /// List runs, newest first, optionally filtered by status.
    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        let rows = match status {
            Some(s) => {
                sqlx::query_as::<_, RunRow>(
                    "SELECT * FROM runs WHERE status = ?1 ORDER BY created_at DESC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RunRow>("SELECT * FROM runs ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(|r| r.into_run()).collect()
    }

    pub async fn list_runs_for_workflow(&self, workflow_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE workflow_id = ?1 ORDER BY created_at DESC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| r.into_run()).collect()
    }

    pub async fn count_running_runs_for_workflow(&self, workflow_id: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs WHERE workflow_id = ?1 AND status = 'running'",
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    pub async fn mark_run_failed(&self, id: &Id, now: DateTime<Utc>) -> Result<()> {
        self.update_run_status(id, RunStatus::Failed, now).await
    }

    pub async fn mark_run_done(&self, id: &Id, now: DateTime<Utc>) -> Result<()> {
        self.update_run_status(id, RunStatus::Done, now).await
    }

    async fn update_run_status(&self, id: &Id, status: RunStatus, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now.timestamp_millis())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Resume a failed run: run back to `running`, every `failed` step back to
    /// `pending` with `retry_count` cleared, resume accounting bumped in meta.
    /// Returns the new resume count. One transaction.
    pub async fn resume_run(&self, id: &Id, now: DateTime<Utc>) -> Result<u32> {
        let run = self.get_run(id).await?;
        let resume_count = run.resume_count() + 1;
        let mut meta = run.meta.clone();
        meta.insert(META_RESUME_COUNT.to_string(), resume_count.to_string());
        meta.insert(
            META_LAST_RESUME_AT.to_string(),
            now.timestamp_millis().to_string(),
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE runs SET status = 'running', meta_json = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'failed'",
        )
        .bind(serde_json::to_string(&meta)?)
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE steps SET status = 'pending', retry_count = 0, input = NULL, updated_at = ?1 \
             WHERE run_id = ?2 AND status = 'failed'",
        )
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        // Failed stories get the same treatment as failed steps so a resumed
        // loop can settle.
        sqlx::query(
            "UPDATE stories SET status = 'pending', needs_verify = 0, retry_count = 0, \
             updated_at = ?1 WHERE run_id = ?2 AND status = 'failed'",
        )
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(resume_count)
    }

    // --- Step operations ---

    pub async fn get_step(&self, id: &Id) -> Result<Step> {
        let query = format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1");
        let row = sqlx::query_as::<_, StepRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::StepNotFound(id.to_string()))?;
        row.into_step()
    }

    /// Look up a step without erroring when absent (used by `complete` to
    /// decide whether a unit id names a step or a story).
    pub async fn find_step(&self, id: &Id) -> Result<Option<Step>> {
        match self.get_step(id).await {
            Ok(step) => Ok(Some(step)),
            Err(StoreError::StepNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_steps(&self, run_id: &Id) -> Result<Vec<Step>> {
        let query =
            format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_index ASC");
        let rows = sqlx::query_as::<_, StepRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_step()).collect()
    }

    /// Find the step of a run by its spec-declared name.
    pub async fn find_step_by_name(&self, run_id: &Id, step_id: &str) -> Result<Option<Step>> {
        let query =
            format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND step_id = ?2");
        let row = sqlx::query_as::<_, StepRow>(&query)
            .bind(run_id.as_ref())
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.into_step()).transpose()
    }

    /// Eligible single steps for a role, FIFO over runs then by step index.
    pub async fn claimable_steps(&self, role: &str) -> Result<Vec<ClaimableStep>> {
        let query = format!(
            "SELECT s.*, r.created_at AS ord_run_created \
             FROM (SELECT {STEP_COLUMNS} FROM steps) s \
             JOIN runs r ON r.id = s.run_id \
             WHERE r.status = 'running' AND s.status = 'pending' \
               AND s.step_type = 'single' AND s.agent_id = ?1 \
             ORDER BY r.created_at ASC, s.step_index ASC"
        );
        let rows = sqlx::query_as::<_, ClaimableStepRow>(&query)
            .bind(role)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_claimable()).collect()
    }

    /// Atomically move a `pending` step to `running`, stamping its resolved
    /// input. Returns false when another claim won the race.
    pub async fn try_claim_step(
        &self,
        step_id: &Id,
        input: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE steps SET status = 'running', input = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'pending'",
        )
        .bind(input)
        .bind(now.timestamp_millis())
        .bind(step_id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Finish a step (store output, mark `done`) and advance the cursor: the
    /// next step by index becomes `pending`, or the run becomes `done`. One
    /// transaction. `allowed_from` guards the transition; a step in any other
    /// state leaves everything untouched (idempotent completion).
    pub async fn finish_step_and_advance(
        &self,
        step: &Step,
        output: Option<&str>,
        allowed_from: &[StepStatus],
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        let ts = now.timestamp_millis();
        let allowed: Vec<&str> = allowed_from.iter().map(|s| s.as_str()).collect();

        let mut tx = self.pool.begin().await?;

        // Guarded terminal transition; losers of the race change nothing.
        let guard = format!(
            "UPDATE steps SET status = 'done', output = COALESCE(?1, output), \
             current_story_id = NULL, updated_at = ?2 \
             WHERE id = ?3 AND status IN ({})",
            placeholders(4, allowed.len())
        );
        let mut update = sqlx::query(&guard).bind(output).bind(ts).bind(step.id.as_ref());
        for status in &allowed {
            update = update.bind(*status);
        }
        let result = update.execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(AdvanceOutcome::NotFinishable);
        }

        // Cursor advancement: never skips a step.
        let next_query = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND step_index = ?2"
        );
        let next = sqlx::query_as::<_, StepRow>(&next_query)
            .bind(step.run_id.as_ref())
            .bind(step.step_index as i64 + 1)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match next {
            Some(next_row) => {
                sqlx::query(
                    "UPDATE steps SET status = 'pending', updated_at = ?1 \
                     WHERE id = ?2 AND status = 'waiting'",
                )
                .bind(ts)
                .bind(next_row.id.as_str())
                .execute(&mut *tx)
                .await?;
                let mut next_step = next_row.into_step()?;
                next_step.status = StepStatus::Pending;
                AdvanceOutcome::NextPending(next_step)
            }
            None => {
                sqlx::query(
                    "UPDATE runs SET status = 'done', updated_at = ?1 \
                     WHERE id = ?2 AND status = 'running'",
                )
                .bind(ts)
                .bind(step.run_id.as_ref())
                .execute(&mut *tx)
                .await?;
                AdvanceOutcome::RunDone
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Agent-reported failure of a step. Below budget the step returns to
    /// `pending`; at budget it is `failed` and the run `failed`. One
    /// transaction.
    pub async fn fail_step(
        &self,
        step_id: &Id,
        budget: u32,
        now: DateTime<Utc>,
    ) -> Result<StepFailOutcome> {
        let ts = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1 AND status IN ('running', 'pending')"
        );
        let Some(row) = sqlx::query_as::<_, StepRow>(&query)
            .bind(step_id.as_ref())
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(StepFailOutcome::Ignored);
        };
        let step = row.into_step()?;

        let retry_count = step.retry_count + 1;
        if retry_count < budget {
            sqlx::query(
                "UPDATE steps SET status = 'pending', retry_count = ?1, input = NULL, \
                 current_story_id = NULL, updated_at = ?2 WHERE id = ?3",
            )
            .bind(retry_count as i64)
            .bind(ts)
            .bind(step_id.as_ref())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(StepFailOutcome::Retried { retry_count })
        } else {
            sqlx::query(
                "UPDATE steps SET status = 'failed', retry_count = ?1, updated_at = ?2 \
                 WHERE id = ?3",
            )
            .bind(retry_count as i64)
            .bind(ts)
            .bind(step_id.as_ref())
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE runs SET status = 'failed', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'running'",
            )
            .bind(ts)
            .bind(step.run_id.as_ref())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(StepFailOutcome::Exhausted { retry_count })
        }
    }

    /// Medic reset of a stuck step: back to `pending`, `abandoned_count + 1`.
    /// Returns the new abandon count, or None when the step was not running.
    pub async fn reset_step(&self, step_id: &Id, now: DateTime<Utc>) -> Result<Option<u32>> {
        let result = sqlx::query(
            "UPDATE steps SET status = 'pending', abandoned_count = abandoned_count + 1, \
             input = NULL, current_story_id = NULL, updated_at = ?1 \
             WHERE id = ?2 AND status = 'running'",
        )
        .bind(now.timestamp_millis())
        .bind(step_id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.get_step(step_id).await?.abandoned_count))
    }

    /// Terminal failure path used by medic bounds: step `failed`, run `failed`.
    pub async fn fail_step_terminal(&self, step_id: &Id, now: DateTime<Utc>) -> Result<()> {
        let step = self.get_step(step_id).await?;
        let ts = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE steps SET status = 'failed', updated_at = ?1 WHERE id = ?2")
            .bind(ts)
            .bind(step_id.as_ref())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE runs SET status = 'failed', updated_at = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(ts)
        .bind(step.run_id.as_ref())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- Story operations ---

    /// Materialise the stories of a loop step, in declared order. One
    /// transaction.
    pub async fn insert_stories(&self, stories: &[Story]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for story in stories {
            sqlx::query(
                "INSERT INTO stories (id, run_id, step_db_id, story_id, story_index, title, \
                 input, status, needs_verify, output, retry_count, abandoned_count, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(story.id.as_ref())
            .bind(story.run_id.as_ref())
            .bind(story.step_db_id.as_ref())
            .bind(&story.story_id)
            .bind(story.story_index as i64)
            .bind(&story.title)
            .bind(&story.input)
            .bind(story.status.as_str())
            .bind(story.needs_verify as i64)
            .bind(story.output.as_deref())
            .bind(story.retry_count as i64)
            .bind(story.abandoned_count as i64)
            .bind(story.updated_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_story(&self, id: &Id) -> Result<Story> {
        let query = format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?1");
        let row = sqlx::query_as::<_, StoryRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::StoryNotFound(id.to_string()))?;
        row.into_story()
    }

    pub async fn find_story(&self, id: &Id) -> Result<Option<Story>> {
        match self.get_story(id).await {
            Ok(story) => Ok(Some(story)),
            Err(StoreError::StoryNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_stories_for_step(&self, step_db_id: &Id) -> Result<Vec<Story>> {
        let query = format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE step_db_id = ?1 ORDER BY story_index ASC"
        );
        let rows = sqlx::query_as::<_, StoryRow>(&query)
            .bind(step_db_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_story()).collect()
    }

    pub async fn list_stories_for_run(&self, run_id: &Id) -> Result<Vec<Story>> {
        let query = format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE run_id = ?1 ORDER BY story_index ASC"
        );
        let rows = sqlx::query_as::<_, StoryRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_story()).collect()
    }

    /// Eligible stories for a role: work phase against the loop agent, verify
    /// phase against the verify agent, worker slots bounded by `loop_workers`.
    /// Returns the story along with the ordering context of its loop step.
    pub async fn claimable_stories(&self, role: &str) -> Result<Vec<ClaimableStory>> {
        let query = format!(
            "SELECT t.*, s.step_index AS ord_step_index, r.created_at AS ord_run_created \
             FROM (SELECT {STORY_COLUMNS} FROM stories) t \
             JOIN steps s ON s.id = t.step_db_id \
             JOIN runs r ON r.id = t.run_id \
             WHERE r.status = 'running' AND s.status = 'pending' AND s.step_type = 'loop' \
               AND t.status = 'pending' \
               AND ((t.needs_verify = 0 AND s.agent_id = ?1) \
                 OR (t.needs_verify = 1 AND s.loop_verify_each = 1 AND s.loop_verify_agent = ?1)) \
               AND (SELECT COUNT(*) FROM stories x \
                    WHERE x.step_db_id = s.id AND x.status = 'running') < s.loop_workers \
             ORDER BY r.created_at ASC, s.step_index ASC, t.story_index ASC"
        );
        let rows = sqlx::query_as::<_, ClaimableStoryRow>(&query)
            .bind(role)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_claimable()).collect()
    }

    /// Atomically move a `pending` story to `running` and point the owning
    /// loop step's `current_story_id` at it. Returns false when another claim
    /// won the race. One transaction.
    pub async fn try_claim_story(&self, story: &Story, now: DateTime<Utc>) -> Result<bool> {
        let ts = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE stories SET status = 'running', updated_at = ?1 \
             WHERE id = ?2 AND status = 'pending'",
        )
        .bind(ts)
        .bind(story.id.as_ref())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE steps SET current_story_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(story.id.as_ref())
            .bind(ts)
            .bind(story.step_db_id.as_ref())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Complete a running story. With `verify_each` the story returns to
    /// `pending` flagged for verification (unless this completion IS the
    /// verification); otherwise it is `verified`. One transaction.
    pub async fn complete_story(
        &self,
        story: &Story,
        output: &str,
        verify_each: bool,
        now: DateTime<Utc>,
    ) -> Result<StoryCompleteOutcome> {
        let ts = now.timestamp_millis();
        // Work phase of a verify_each loop hands the story to the verifier.
        let to_verify = verify_each && !story.needs_verify;

        let mut tx = self.pool.begin().await?;
        let result = if to_verify {
            sqlx::query(
                "UPDATE stories SET status = 'pending', needs_verify = 1, output = ?1, \
                 updated_at = ?2 WHERE id = ?3 AND status = 'running'",
            )
            .bind(output)
            .bind(ts)
            .bind(story.id.as_ref())
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                "UPDATE stories SET status = 'verified', needs_verify = 0, \
                 output = COALESCE(NULLIF(?1, ''), output), updated_at = ?2 \
                 WHERE id = ?3 AND status = 'running'",
            )
            .bind(output)
            .bind(ts)
            .bind(story.id.as_ref())
            .execute(&mut *tx)
            .await?
        };
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(StoryCompleteOutcome::Ignored);
        }

        clear_current_story_tx(&mut tx, &story.step_db_id, ts).await?;
        tx.commit().await?;

        Ok(if to_verify {
            StoryCompleteOutcome::AwaitingVerify
        } else {
            StoryCompleteOutcome::Verified
        })
    }

    /// Fail a running story: below budget it returns to `pending` for the
    /// worker role (verification flag cleared, the work is redone); at budget
    /// it is `failed`. One transaction.
    pub async fn fail_story(
        &self,
        story: &Story,
        budget: u32,
        now: DateTime<Utc>,
    ) -> Result<StoryFailOutcome> {
        let ts = now.timestamp_millis();
        let retry_count = story.retry_count + 1;

        let mut tx = self.pool.begin().await?;
        let result = if retry_count < budget {
            sqlx::query(
                "UPDATE stories SET status = 'pending', needs_verify = 0, retry_count = ?1, \
                 updated_at = ?2 WHERE id = ?3 AND status = 'running'",
            )
            .bind(retry_count as i64)
            .bind(ts)
            .bind(story.id.as_ref())
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                "UPDATE stories SET status = 'failed', retry_count = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'running'",
            )
            .bind(retry_count as i64)
            .bind(ts)
            .bind(story.id.as_ref())
            .execute(&mut *tx)
            .await?
        };
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(StoryFailOutcome::Ignored);
        }

        clear_current_story_tx(&mut tx, &story.step_db_id, ts).await?;
        tx.commit().await?;

        Ok(if retry_count < budget {
            StoryFailOutcome::Retried { retry_count }
        } else {
            StoryFailOutcome::Exhausted { retry_count }
        })
    }

    /// Medic reset of an orphaned story: back to `pending` (verification flag
    /// preserved, the interrupted phase is redone), `abandoned_count + 1`.
    pub async fn reset_story(&self, story_id: &Id, now: DateTime<Utc>) -> Result<Option<u32>> {
        let ts = now.timestamp_millis();
        let story = self.get_story(story_id).await?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE stories SET status = 'pending', abandoned_count = abandoned_count + 1, \
             updated_at = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(ts)
        .bind(story_id.as_ref())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        clear_current_story_tx(&mut tx, &story.step_db_id, ts).await?;
        tx.commit().await?;

        Ok(Some(self.get_story(story_id).await?.abandoned_count))
    }

    /// Medic removal of a story from the work set.
    pub async fn skip_story(&self, story_id: &Id, now: DateTime<Utc>) -> Result<()> {
        let ts = now.timestamp_millis();
        let story = self.get_story(story_id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE stories SET status = 'skipped', updated_at = ?1 WHERE id = ?2")
            .bind(ts)
            .bind(story_id.as_ref())
            .execute(&mut *tx)
            .await?;
        clear_current_story_tx(&mut tx, &story.step_db_id, ts).await?;
        tx.commit().await?;
        Ok(())
    }

    // --- Event operations ---

    /// Append an event to the transition log.
    pub async fn append_event(
        &self,
        kind: &str,
        run_id: &Id,
        step_id: Option<&Id>,
        detail: &str,
    ) -> Result<Event> {
        let id = Id::new();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO events (id, ts, kind, run_id, step_id, detail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.as_ref())
        .bind(now.timestamp_millis())
        .bind(kind)
        .bind(run_id.as_ref())
        .bind(step_id.map(|s| s.as_ref()))
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id,
            ts: now,
            kind: kind.to_string(),
            run_id: run_id.clone(),
            step_id: step_id.cloned(),
            detail: detail.to_string(),
        })
    }

    pub async fn list_events(&self, run_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE run_id = ?1 ORDER BY ts ASC, id ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.into_event()).collect())
    }

    /// Timestamp of the last claim event for a run, if any. Used by medic to
    /// detect stalled crons.
    pub async fn latest_claim_ts(&self, run_id: &Id) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT ts FROM events WHERE run_id = ?1 AND kind IN ('step.claim', 'story.claim') \
             ORDER BY ts DESC LIMIT 1",
        )
        .bind(run_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(ts,)| DateTime::from_timestamp_millis(ts)))
    }

    // --- Medic checks and state ---

    /// Record a medic pass and prune history past the retention bound. One
    /// transaction.
    pub async fn record_medic_check(&self, check: &MedicCheck, retain: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO medic_checks (id, checked_at, issues_found, actions_taken, summary, \
             findings_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(check.id.as_ref())
        .bind(check.checked_at.timestamp_millis())
        .bind(check.issues_found as i64)
        .bind(check.actions_taken as i64)
        .bind(&check.summary)
        .bind(&check.findings_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM medic_checks WHERE id NOT IN \
             (SELECT id FROM medic_checks ORDER BY checked_at DESC, id DESC LIMIT ?1)",
        )
        .bind(retain as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_medic_checks(&self, limit: u32) -> Result<Vec<MedicCheck>> {
        let rows = sqlx::query_as::<_, MedicCheckRow>(
            "SELECT * FROM medic_checks ORDER BY checked_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.into_check()).collect())
    }

    pub async fn get_medic_state(&self, key: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT value, updated_at FROM medic_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value, ts)| {
            (
                value,
                DateTime::from_timestamp_millis(ts).unwrap_or_default(),
            )
        }))
    }

    pub async fn set_medic_state(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO medic_state (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// `?N, ?N+1, ...` placeholder list for IN clauses.
fn placeholders(start: usize, count: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", start + i))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn insert_step_tx(tx: &mut Transaction<'_, Sqlite>, step: &Step) -> Result<()> {
    let (loop_source, loop_workers, loop_verify_each, loop_verify_agent) = match &step.loop_config {
        Some(lc) => (
            Some(lc.source_step.as_str()),
            Some(lc.workers as i64),
            lc.verify_each as i64,
            lc.verify_agent.as_deref(),
        ),
        None => (None, None, 0, None),
    };

    sqlx::query(
        "INSERT INTO steps (id, run_id, step_index, step_id, agent_id, step_type, status, \
         retry_count, abandoned_count, input_template, required_outputs_json, input, output, \
         loop_source_step, loop_workers, loop_verify_each, loop_verify_agent, current_story_id, \
         updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19)",
    )
    .bind(step.id.as_ref())
    .bind(step.run_id.as_ref())
    .bind(step.step_index as i64)
    .bind(&step.step_id)
    .bind(&step.agent_id)
    .bind(step.step_type.as_str())
    .bind(step.status.as_str())
    .bind(step.retry_count as i64)
    .bind(step.abandoned_count as i64)
    .bind(&step.input_template)
    .bind(serde_json::to_string(&step.required_outputs)?)
    .bind(step.input.as_deref())
    .bind(step.output.as_deref())
    .bind(loop_source)
    .bind(loop_workers)
    .bind(loop_verify_each)
    .bind(loop_verify_agent)
    .bind(step.current_story_id.as_ref().map(|s| s.as_ref()))
    .bind(step.updated_at.timestamp_millis())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Drop the loop step's `current_story_id` when it points at a story that is
/// no longer running and no other story of the step runs either.
async fn clear_current_story_tx(
    tx: &mut Transaction<'_, Sqlite>,
    step_db_id: &Id,
    ts: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps SET current_story_id = NULL, updated_at = ?1 \
         WHERE id = ?2 AND NOT EXISTS \
         (SELECT 1 FROM stories WHERE step_db_id = ?2 AND status = 'running')",
    )
    .bind(ts)
    .bind(step_db_id.as_ref())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// A claimable single step joined with its run's ordering context.
#[derive(Debug, Clone)]
pub struct ClaimableStep {
    pub step: Step,
    pub run_created_at: DateTime<Utc>,
}

/// A claimable story joined with its loop step's ordering context.
#[derive(Debug, Clone)]
pub struct ClaimableStory {
    pub story: Story,
    pub run_created_at: DateTime<Utc>,
    pub step_index: u32,
    /// True when this claim is the verification phase.
    pub verify: bool,
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    workflow_id: String,
    task: String,
    status: String,
    meta_json: String,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let meta: BTreeMap<String, String> = serde_json::from_str(&self.meta_json)?;
        Ok(Run {
            id: Id::from_string(self.id),
            workflow_id: self.workflow_id,
            task: self.task,
            status: RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed),
            meta,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    step_index: i64,
    step_id: String,
    agent_id: String,
    step_type: String,
    status: String,
    retry_count: i64,
    abandoned_count: i64,
    input_template: String,
    required_outputs_json: String,
    input: Option<String>,
    output: Option<String>,
    loop_source_step: Option<String>,
    loop_workers: Option<i64>,
    loop_verify_each: i64,
    loop_verify_agent: Option<String>,
    current_story_id: Option<String>,
    updated_at: i64,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        let required_outputs: Vec<String> = serde_json::from_str(&self.required_outputs_json)?;
        let loop_config = self.loop_source_step.map(|source_step| LoopConfig {
            source_step,
            workers: self.loop_workers.unwrap_or(LoopConfig::DEFAULT_WORKERS as i64) as u32,
            verify_each: self.loop_verify_each != 0,
            verify_agent: self.loop_verify_agent,
        });

        Ok(Step {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            step_index: self.step_index as u32,
            step_id: self.step_id,
            agent_id: self.agent_id,
            step_type: StepType::parse(&self.step_type).unwrap_or(StepType::Single),
            status: StepStatus::parse(&self.status).unwrap_or(StepStatus::Failed),
            retry_count: self.retry_count as u32,
            abandoned_count: self.abandoned_count as u32,
            input_template: self.input_template,
            required_outputs,
            input: self.input,
            output: self.output,
            loop_config,
            current_story_id: self.current_story_id.map(Id::from_string),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StoryRow {
    id: String,
    run_id: String,
    step_db_id: String,
    story_id: String,
    story_index: i64,
    title: String,
    input: String,
    status: String,
    needs_verify: i64,
    output: Option<String>,
    retry_count: i64,
    abandoned_count: i64,
    updated_at: i64,
}

impl StoryRow {
    fn into_story(self) -> Result<Story> {
        Ok(Story {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            step_db_id: Id::from_string(self.step_db_id),
            story_id: self.story_id,
            story_index: self.story_index as u32,
            title: self.title,
            input: self.input,
            status: StoryStatus::parse(&self.status).unwrap_or(StoryStatus::Failed),
            needs_verify: self.needs_verify != 0,
            output: self.output,
            retry_count: self.retry_count as u32,
            abandoned_count: self.abandoned_count as u32,
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimableStepRow {
    #[sqlx(flatten)]
    step: StepRow,
    ord_run_created: i64,
}

impl ClaimableStepRow {
    fn into_claimable(self) -> Result<ClaimableStep> {
        Ok(ClaimableStep {
            run_created_at: DateTime::from_timestamp_millis(self.ord_run_created)
                .unwrap_or_default(),
            step: self.step.into_step()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimableStoryRow {
    #[sqlx(flatten)]
    story: StoryRow,
    ord_run_created: i64,
    ord_step_index: i64,
}

impl ClaimableStoryRow {
    fn into_claimable(self) -> Result<ClaimableStory> {
        let run_created_at =
            DateTime::from_timestamp_millis(self.ord_run_created).unwrap_or_default();
        let step_index = self.ord_step_index as u32;
        let story = self.story.into_story()?;
        // The eligibility query only serves needs_verify rows to the verify
        // role, so the flag alone identifies the phase of this claim.
        let verify = story.needs_verify;
        Ok(ClaimableStory {
            verify,
            story,
            run_created_at,
            step_index,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    ts: i64,
    kind: String,
    run_id: String,
    step_id: Option<String>,
    detail: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            ts: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            kind: self.kind,
            run_id: Id::from_string(self.run_id),
            step_id: self.step_id.map(Id::from_string),
            detail: self.detail,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MedicCheckRow {
    id: String,
    checked_at: i64,
    issues_found: i64,
    actions_taken: i64,
    summary: String,
    findings_json: String,
}

impl MedicCheckRow {
    fn into_check(self) -> MedicCheck {
        MedicCheck {
            id: Id::from_string(self.id),
            checked_at: DateTime::from_timestamp_millis(self.checked_at).unwrap_or_default(),
            issues_found: self.issues_found as u32,
            actions_taken: self.actions_taken as u32,
            summary: self.summary,
            findings_json: self.findings_json,
        }
    }
}
