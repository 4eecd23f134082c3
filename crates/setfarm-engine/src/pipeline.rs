//! Step and loop engines: run seeding, cursor advancement, story fan-out,
//! and run termination side effects.
//!
//! The pipeline owns every transition that is not an agent-facing protocol
//! call: it seeds steps from a workflow spec, advances the cursor when a step
//! finishes, materialises stories when a loop step becomes pending, and tears
//! down cron jobs when a workflow has no running runs left.

use chrono::{DateTime, Utc};
use setfarm_core::config::Config;
use setfarm_core::events::{
    EventDetail, EventKind, RunCreatedDetail, RunFailedDetail, RunResumedDetail, StepDetail,
    StepFailDetail, StoriesSeededDetail,
};
use setfarm_core::outputs::ParsedOutputs;
use setfarm_core::spec::WorkflowSpec;
use setfarm_core::types::{
    Id, LoopConfig, Run, RunStatus, Step, StepStatus, StepType, Story, StoryStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::archive;
use crate::cron::{self, CronGateway};
use crate::store::{AdvanceOutcome, StepFailOutcome, Store, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("spec error: {0}")]
    Spec(#[from] setfarm_core::spec::SpecError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Orchestrates step and loop transitions over the store.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<Store>,
    cron: Arc<dyn CronGateway>,
    config: Config,
}

impl Pipeline {
    pub fn new(store: Arc<Store>, cron: Arc<dyn CronGateway>, config: Config) -> Self {
        Self {
            store,
            cron,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a run from a workflow spec: seed every step (`waiting`, the
    /// first one `pending`) and idempotently ensure the workflow's cron jobs.
    pub async fn start_run(&self, spec: &WorkflowSpec, task: &str) -> Result<Run> {
        let now = Utc::now();
        let run = Run {
            id: Id::new(),
            workflow_id: spec.id.clone(),
            task: task.to_string(),
            status: RunStatus::Running,
            meta: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };

        let steps: Vec<Step> = spec
            .steps
            .iter()
            .enumerate()
            .map(|(index, step_spec)| Step {
                id: Id::new(),
                run_id: run.id.clone(),
                step_index: index as u32,
                step_id: step_spec.id.clone(),
                agent_id: step_spec.agent.clone(),
                step_type: step_spec.step_type,
                status: if index == 0 {
                    StepStatus::Pending
                } else {
                    StepStatus::Waiting
                },
                retry_count: 0,
                abandoned_count: 0,
                input_template: step_spec.input.clone(),
                required_outputs: step_spec.outputs.clone(),
                input: None,
                output: None,
                loop_config: step_spec.loop_config(),
                current_story_id: None,
                updated_at: now,
            })
            .collect();

        self.store.seed_run(&run, &steps).await?;
        self.emit(
            EventKind::RunCreated,
            &run.id,
            None,
            &EventDetail::RunCreated(RunCreatedDetail {
                workflow_id: run.workflow_id.clone(),
                task: run.task.clone(),
            }),
        )
        .await?;
        self.emit(
            EventKind::StepPending,
            &run.id,
            Some(&steps[0].id),
            &EventDetail::Step(StepDetail {
                step_id: steps[0].step_id.clone(),
                agent_id: Some(steps[0].agent_id.clone()),
            }),
        )
        .await?;

        // A pending first loop step fans out immediately (its source must be
        // an earlier step, so validation forbids this; kept for safety).
        if steps[0].step_type == StepType::Loop {
            let first = self.store.get_step(&steps[0].id).await?;
            self.on_step_pending(&first).await?;
        }

        // Gateway failures never block run creation: the DB is the source of
        // truth and medic re-ensures jobs on its next pass.
        if let Err(e) = cron::ensure_workflow_jobs(self.cron.as_ref(), spec, &self.config).await {
            warn!(workflow_id = %spec.id, error = %e, "failed to ensure cron jobs");
        }

        info!(run_id = %run.id, workflow_id = %run.workflow_id, "run created");
        Ok(run)
    }

    /// Substitution map for a step of a run: `TASK` plus every output key
    /// declared by earlier `done` steps, later steps winning on collision.
    pub async fn template_vars(&self, run: &Run, step_index: u32) -> Result<BTreeMap<String, String>> {
        let mut vars = BTreeMap::new();
        vars.insert("TASK".to_string(), run.task.clone());
        let steps = self.store.list_steps(&run.id).await?;
        for step in steps
            .iter()
            .filter(|s| s.step_index < step_index && s.status == StepStatus::Done)
        {
            if let Some(output) = &step.output {
                for (key, value) in ParsedOutputs::parse(output).iter() {
                    vars.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(vars)
    }

    /// Drive the consequences of a finished step until the pipeline rests:
    /// emits events, materialises loop fan-out, and handles run completion.
    pub async fn after_step_done(&self, run_id: &Id, first: AdvanceOutcome) -> Result<()> {
        let mut outcome = first;
        loop {
            match outcome {
                AdvanceOutcome::NextPending(step) => {
                    self.emit(
                        EventKind::StepPending,
                        run_id,
                        Some(&step.id),
                        &EventDetail::Step(StepDetail {
                            step_id: step.step_id.clone(),
                            agent_id: Some(step.agent_id.clone()),
                        }),
                    )
                    .await?;
                    match self.on_step_pending(&step).await? {
                        Some(next) => outcome = next,
                        None => return Ok(()),
                    }
                }
                AdvanceOutcome::RunDone => {
                    self.emit(EventKind::RunDone, run_id, None, &EventDetail::Empty)
                        .await?;
                    info!(run_id = %run_id, "run done");
                    self.on_run_terminal(run_id).await;
                    return Ok(());
                }
                AdvanceOutcome::NotFinishable => return Ok(()),
            }
        }
    }

    /// Loop-engine entry: when a loop step becomes pending, materialise its
    /// stories from the source step's `STORIES_JSON`. Returns a follow-up
    /// advance outcome when the step settled immediately (empty story list).
    async fn on_step_pending(&self, step: &Step) -> Result<Option<AdvanceOutcome>> {
        let Some(loop_config) = &step.loop_config else {
            return Ok(None);
        };

        // A broken loop-source contract cannot heal by re-claiming (the bad
        // output is already stored), so failures drain the retry budget here
        // and the run fails deterministically.
        let seeds = loop {
            match self.extract_story_seeds(step, loop_config).await? {
                Ok(seeds) => break seeds,
                Err(reason) => {
                    warn!(step_id = %step.step_id, %reason, "loop fan-out failed");
                    match self.fail_step(step, &reason).await? {
                        StepFailOutcome::Retried { .. } => continue,
                        _ => return Ok(None),
                    }
                }
            }
        };

        if seeds.is_empty() {
            // An empty stories list completes the loop immediately.
            let outcome = self
                .store
                .finish_step_and_advance(step, None, &[StepStatus::Pending], Utc::now())
                .await?;
            self.emit(
                EventKind::StepComplete,
                &step.run_id,
                Some(&step.id),
                &EventDetail::Step(StepDetail {
                    step_id: step.step_id.clone(),
                    agent_id: None,
                }),
            )
            .await?;
            return Ok(Some(outcome));
        }

        let run = self.store.get_run(&step.run_id).await?;
        let vars = self.template_vars(&run, step.step_index).await?;
        let now = Utc::now();
        let stories: Vec<Story> = seeds
            .iter()
            .enumerate()
            .map(|(index, seed)| {
                let input = if step.input_template.trim().is_empty() {
                    seed.input.clone()
                } else {
                    let mut story_vars = vars.clone();
                    story_vars.insert("STORY_ID".to_string(), seed.story_id.clone());
                    story_vars.insert("STORY_TITLE".to_string(), seed.title.clone());
                    story_vars.insert("STORY_INPUT".to_string(), seed.input.clone());
                    setfarm_core::outputs::resolve_template(&step.input_template, &story_vars)
                };
                Story {
                    id: Id::new(),
                    run_id: step.run_id.clone(),
                    step_db_id: step.id.clone(),
                    story_id: seed.story_id.clone(),
                    story_index: index as u32,
                    title: seed.title.clone(),
                    input,
                    status: StoryStatus::Pending,
                    needs_verify: false,
                    output: None,
                    retry_count: 0,
                    abandoned_count: 0,
                    updated_at: now,
                }
            })
            .collect();

        self.store.insert_stories(&stories).await?;
        self.emit(
            EventKind::StoriesSeeded,
            &step.run_id,
            Some(&step.id),
            &EventDetail::StoriesSeeded(StoriesSeededDetail {
                step_id: step.step_id.clone(),
                count: stories.len(),
            }),
        )
        .await?;
        info!(step_id = %step.step_id, count = stories.len(), "stories seeded");
        Ok(None)
    }

    /// Fetch and parse the source step's story list. The inner `Err` carries
    /// the step-failure reason for contract violations.
    async fn extract_story_seeds(
        &self,
        step: &Step,
        loop_config: &LoopConfig,
    ) -> Result<std::result::Result<Vec<setfarm_core::outputs::StorySeed>, String>> {
        let source = self
            .store
            .find_step_by_name(&step.run_id, &loop_config.source_step)
            .await?;
        let Some(source) = source else {
            return Ok(Err(format!(
                "source step `{}` not found",
                loop_config.source_step
            )));
        };
        let Some(output) = &source.output else {
            return Ok(Err(format!(
                "source step `{}` has no output",
                loop_config.source_step
            )));
        };
        match ParsedOutputs::parse(output).stories() {
            Ok(Some(seeds)) => Ok(Ok(seeds)),
            Ok(None) => Ok(Err(format!(
                "source step `{}` declared no STORIES_JSON",
                loop_config.source_step
            ))),
            Err(e) => Ok(Err(e.to_string())),
        }
    }

    /// When every story of a loop step is settled (`verified` or `skipped`),
    /// finish the step and advance the cursor.
    pub async fn complete_loop_if_settled(&self, step_db_id: &Id) -> Result<()> {
        let step = self.store.get_step(step_db_id).await?;
        if step.status.is_terminal() {
            return Ok(());
        }
        let stories = self.store.list_stories_for_step(step_db_id).await?;
        if stories.is_empty() || !stories.iter().all(|s| s.status.counts_as_settled()) {
            return Ok(());
        }

        // Transient bookkeeping pass through `running` into `done`.
        let outcome = self
            .store
            .finish_step_and_advance(
                &step,
                None,
                &[StepStatus::Pending, StepStatus::Running],
                Utc::now(),
            )
            .await?;
        self.emit(
            EventKind::StepComplete,
            &step.run_id,
            Some(&step.id),
            &EventDetail::Step(StepDetail {
                step_id: step.step_id.clone(),
                agent_id: None,
            }),
        )
        .await?;
        info!(step_id = %step.step_id, "loop complete");
        self.after_step_done(&step.run_id, outcome).await
    }

    /// Fail a step through the retry budget, emitting events and handling the
    /// terminal run transition.
    pub async fn fail_step(&self, step: &Step, reason: &str) -> Result<StepFailOutcome> {
        let outcome = self
            .store
            .fail_step(&step.id, self.config.retry_budget, Utc::now())
            .await?;

        match &outcome {
            StepFailOutcome::Retried { retry_count } => {
                self.emit(
                    EventKind::StepFail,
                    &step.run_id,
                    Some(&step.id),
                    &EventDetail::StepFail(StepFailDetail {
                        step_id: step.step_id.clone(),
                        reason: reason.to_string(),
                        retry_count: *retry_count,
                    }),
                )
                .await?;
            }
            StepFailOutcome::Exhausted { retry_count } => {
                self.emit(
                    EventKind::StepFail,
                    &step.run_id,
                    Some(&step.id),
                    &EventDetail::StepFail(StepFailDetail {
                        step_id: step.step_id.clone(),
                        reason: reason.to_string(),
                        retry_count: *retry_count,
                    }),
                )
                .await?;
                self.emit_run_failed(&step.run_id, "step retry budget exhausted")
                    .await?;
                self.on_run_terminal(&step.run_id).await;
            }
            StepFailOutcome::Ignored => {
                warn!(step_id = %step.step_id, "fail on unclaimable step ignored");
            }
        }
        Ok(outcome)
    }

    /// Terminal failure used by medic bounds: no retry accounting, the step
    /// and its run are failed outright.
    pub async fn fail_step_terminal(&self, step: &Step, reason: &str) -> Result<()> {
        self.store.fail_step_terminal(&step.id, Utc::now()).await?;
        self.emit(
            EventKind::StepFail,
            &step.run_id,
            Some(&step.id),
            &EventDetail::StepFail(StepFailDetail {
                step_id: step.step_id.clone(),
                reason: reason.to_string(),
                retry_count: step.retry_count,
            }),
        )
        .await?;
        self.emit_run_failed(&step.run_id, reason).await?;
        self.on_run_terminal(&step.run_id).await;
        Ok(())
    }

    /// Resume a failed run: failed steps and stories return to `pending` with
    /// `retry_count` cleared, resume accounting is bumped, and the workflow's
    /// cron jobs are re-ensured (they were torn down when the run failed).
    /// The caller supplies the clock so medic cooldown sequences stay
    /// deterministic under an injected `now`.
    pub async fn resume(&self, run_id: &Id, source: &str, now: DateTime<Utc>) -> Result<u32> {
        let resume_count = self.store.resume_run(run_id, now).await?;
        self.emit(
            EventKind::RunResumed,
            run_id,
            None,
            &EventDetail::RunResumed(RunResumedDetail {
                resume_count,
                source: source.to_string(),
            }),
        )
        .await?;

        let run = self.store.get_run(run_id).await?;
        self.ensure_jobs(&run.workflow_id).await;
        info!(run_id = %run_id, resume_count, source, "run resumed");
        Ok(resume_count)
    }

    /// Observed scheduler state, for medic reconciliation.
    pub async fn cron_list(&self) -> crate::cron::Result<Vec<crate::cron::CronJob>> {
        self.cron.list_jobs().await
    }

    /// Delete every cron job of a workflow.
    pub async fn cron_teardown(&self, workflow_id: &str) -> crate::cron::Result<usize> {
        cron::teardown_workflow_jobs(self.cron.as_ref(), workflow_id).await
    }

    /// Load the workflow spec and idempotently ensure its cron jobs. Gateway
    /// and spec failures are logged, not propagated.
    pub async fn ensure_jobs(&self, workflow_id: &str) {
        let spec = match WorkflowSpec::load(&self.config.workflows_dir(), workflow_id) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(workflow_id, error = %e, "cannot load workflow spec to ensure jobs");
                return;
            }
        };
        if let Err(e) = cron::ensure_workflow_jobs(self.cron.as_ref(), &spec, &self.config).await {
            warn!(workflow_id, error = %e, "failed to ensure cron jobs");
        }
    }

    /// Archive the run and tear down cron jobs when its workflow has no
    /// running runs left. Best effort on both counts.
    pub async fn on_run_terminal(&self, run_id: &Id) {
        match archive::archive_run(&self.store, &self.config.runs_dir(), run_id).await {
            Ok(path) => info!(run_id = %run_id, path = %path.display(), "run archived"),
            Err(e) => warn!(run_id = %run_id, error = %e, "failed to archive run"),
        }

        let workflow_id = match self.store.get_run(run_id).await {
            Ok(run) => run.workflow_id,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to load run for cron teardown");
                return;
            }
        };
        match self
            .store
            .count_running_runs_for_workflow(&workflow_id)
            .await
        {
            Ok(0) => {
                if let Err(e) = cron::teardown_workflow_jobs(self.cron.as_ref(), &workflow_id).await
                {
                    warn!(workflow_id = %workflow_id, error = %e, "cron teardown failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(workflow_id = %workflow_id, error = %e, "cron teardown skipped"),
        }
    }

    pub async fn emit_run_failed(&self, run_id: &Id, reason: &str) -> Result<()> {
        self.emit(
            EventKind::RunFailed,
            run_id,
            None,
            &EventDetail::RunFailed(RunFailedDetail {
                reason: reason.to_string(),
            }),
        )
        .await
    }

    pub async fn emit(
        &self,
        kind: EventKind,
        run_id: &Id,
        step_id: Option<&Id>,
        detail: &EventDetail,
    ) -> Result<()> {
        self.store
            .append_event(kind.as_str(), run_id, step_id, &detail.to_json()?)
            .await?;
        Ok(())
    }
}
