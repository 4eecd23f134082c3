//! The claim protocol: peek / claim / complete / fail.
//!
//! This is the whole contract between the engine and agent processes. Each
//! operation takes the role identifier the agent was woken for; `claim` is an
//! atomic select-and-mark, so two simultaneous claims for one role return
//! distinct units or `NO_WORK`. `Conflict` and `ParseError` conditions are
//! absorbed into the state machine rather than surfaced to the agent.

use chrono::Utc;
use serde::Serialize;
use setfarm_core::events::{
    EventDetail, EventKind, StepDetail, StoryClaimDetail, StoryCompleteDetail, StoryFailDetail,
};
use setfarm_core::outputs::{resolve_template, ParsedOutputs};
use setfarm_core::types::{Id, RunStatus, StepType, StoryStatus};
use thiserror::Error;
use tracing::{info, warn};

use crate::pipeline::{Pipeline, PipelineError};
use crate::store::{
    ClaimableStep, ClaimableStory, StepFailOutcome, StoreError, StoryCompleteOutcome,
    StoryFailOutcome,
};

/// Wire tokens for the peek/claim answers.
pub const HAS_WORK: &str = "HAS_WORK";
pub const NO_WORK: &str = "NO_WORK";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown unit: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A claimed single step, as returned to the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedStep {
    pub step_id: Id,
    pub run_id: Id,
    pub input: String,
}

/// A claimed story, as returned to the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedStory {
    pub story_id: Id,
    pub run_id: Id,
    pub input: String,
}

#[derive(Debug, Clone)]
pub enum ClaimedUnit {
    Step(ClaimedStep),
    Story(ClaimedStory),
}

impl ClaimedUnit {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Step(c) => serde_json::to_string(c),
            Self::Story(c) => serde_json::to_string(c),
        }
    }
}

/// Outcome of a `complete` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The unit is terminal and the pipeline advanced.
    Completed,
    /// The unit was already terminal; accepted as a no-op.
    AlreadyTerminal,
    /// The run is no longer running; accepted as a no-op.
    RunNotRunning,
    /// The unit was not in a completable state (lost a race or never claimed).
    NotClaimed,
    /// Required outputs were missing; the call behaved as `fail`.
    TreatedAsFailed { reason: String },
}

/// Outcome of a `fail` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Budget not spent; the unit is `pending` again.
    Retried { retry_count: u32 },
    /// Budget spent; the unit (and its run) is failed.
    Exhausted,
    /// Nothing to do (unit terminal or not claimed).
    Ignored,
}

/// Claim-protocol front end over the pipeline.
#[derive(Clone)]
pub struct Protocol {
    pipeline: Pipeline,
}

/// Ordering key for merged step/story candidates: FIFO over runs, then by
/// pipeline position, then by story order.
fn candidate_key(run_created_ms: i64, step_index: u32, story_index: u32) -> (i64, u32, u32) {
    (run_created_ms, step_index, story_index)
}

enum Candidate {
    Step(ClaimableStep),
    Story(ClaimableStory),
}

impl Candidate {
    fn key(&self) -> (i64, u32, u32) {
        match self {
            Self::Step(c) => {
                candidate_key(c.run_created_at.timestamp_millis(), c.step.step_index, 0)
            }
            Self::Story(c) => candidate_key(
                c.run_created_at.timestamp_millis(),
                c.step_index,
                c.story.story_index,
            ),
        }
    }
}

impl Protocol {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Pure read: does any unclaimed unit exist for this role?
    pub async fn peek(&self, role: &str) -> Result<bool> {
        let store = self.pipeline.store();
        if !store.claimable_steps(role).await?.is_empty() {
            return Ok(true);
        }
        Ok(!store.claimable_stories(role).await?.is_empty())
    }

    /// Atomic select-and-mark of the highest-priority eligible unit. Losing a
    /// race for one candidate moves on to the next; `None` means `NO_WORK`.
    pub async fn claim(&self, role: &str) -> Result<Option<ClaimedUnit>> {
        let store = self.pipeline.store();
        let now = Utc::now();

        let mut candidates: Vec<Candidate> = store
            .claimable_steps(role)
            .await?
            .into_iter()
            .map(Candidate::Step)
            .chain(
                store
                    .claimable_stories(role)
                    .await?
                    .into_iter()
                    .map(Candidate::Story),
            )
            .collect();
        candidates.sort_by_key(Candidate::key);

        for candidate in candidates {
            match candidate {
                Candidate::Step(claimable) => {
                    let step = claimable.step;
                    let run = store.get_run(&step.run_id).await?;
                    let vars = self.pipeline.template_vars(&run, step.step_index).await?;
                    let input = resolve_template(&step.input_template, &vars);
                    if !store.try_claim_step(&step.id, &input, now).await? {
                        continue;
                    }
                    self.pipeline
                        .emit(
                            EventKind::StepClaim,
                            &step.run_id,
                            Some(&step.id),
                            &EventDetail::Step(StepDetail {
                                step_id: step.step_id.clone(),
                                agent_id: Some(role.to_string()),
                            }),
                        )
                        .await?;
                    info!(step_id = %step.step_id, role, "step claimed");
                    return Ok(Some(ClaimedUnit::Step(ClaimedStep {
                        step_id: step.id,
                        run_id: step.run_id,
                        input,
                    })));
                }
                Candidate::Story(claimable) => {
                    let story = claimable.story;
                    if !store.try_claim_story(&story, now).await? {
                        continue;
                    }
                    self.pipeline
                        .emit(
                            EventKind::StoryClaim,
                            &story.run_id,
                            Some(&story.step_db_id),
                            &EventDetail::StoryClaim(StoryClaimDetail {
                                story_id: story.story_id.clone(),
                                agent_id: role.to_string(),
                                verify: claimable.verify,
                            }),
                        )
                        .await?;
                    info!(story_id = %story.story_id, role, verify = claimable.verify, "story claimed");
                    return Ok(Some(ClaimedUnit::Story(ClaimedStory {
                        story_id: story.id,
                        run_id: story.run_id,
                        input: story.input,
                    })));
                }
            }
        }
        Ok(None)
    }

    /// Accept an agent's raw output for a claimed unit. Parses the `KEY:
    /// value` grammar, validates the declared contract, stores the output and
    /// advances the pipeline. Completion of an already-terminal unit is a
    /// no-op returning success.
    pub async fn complete(&self, unit_id: &Id, raw_output: &str) -> Result<CompleteOutcome> {
        let store = self.pipeline.store();

        if let Some(step) = store.find_step(unit_id).await? {
            if step.status.is_terminal() {
                return Ok(CompleteOutcome::AlreadyTerminal);
            }
            let run = store.get_run(&step.run_id).await?;
            if run.status != RunStatus::Running {
                warn!(step_id = %step.step_id, "complete on non-running run ignored");
                return Ok(CompleteOutcome::RunNotRunning);
            }
            if step.step_type == StepType::Loop {
                // Loop steps settle through their stories, never directly.
                warn!(step_id = %step.step_id, "direct complete on loop step ignored");
                return Ok(CompleteOutcome::NotClaimed);
            }

            let parsed = ParsedOutputs::parse(raw_output);
            if let Err(e) = parsed.require(&step.required_outputs) {
                let reason = e.to_string();
                warn!(step_id = %step.step_id, %reason, "complete treated as fail");
                self.pipeline.fail_step(&step, &reason).await?;
                return Ok(CompleteOutcome::TreatedAsFailed { reason });
            }

            let outcome = store
                .finish_step_and_advance(
                    &step,
                    Some(raw_output),
                    &[setfarm_core::types::StepStatus::Running],
                    Utc::now(),
                )
                .await?;
            if matches!(outcome, crate::store::AdvanceOutcome::NotFinishable) {
                return Ok(CompleteOutcome::NotClaimed);
            }
            self.pipeline
                .emit(
                    EventKind::StepComplete,
                    &step.run_id,
                    Some(&step.id),
                    &EventDetail::Step(StepDetail {
                        step_id: step.step_id.clone(),
                        agent_id: None,
                    }),
                )
                .await?;
            self.pipeline.after_step_done(&step.run_id, outcome).await?;
            return Ok(CompleteOutcome::Completed);
        }

        if let Some(story) = store.find_story(unit_id).await? {
            if story.status.is_terminal() {
                return Ok(CompleteOutcome::AlreadyTerminal);
            }
            let run = store.get_run(&story.run_id).await?;
            if run.status != RunStatus::Running {
                // Accepted but a no-op: a sibling step may have failed the run
                // while this worker was busy.
                warn!(story_id = %story.story_id, "complete on non-running run ignored");
                return Ok(CompleteOutcome::RunNotRunning);
            }
            if story.status != StoryStatus::Running {
                return Ok(CompleteOutcome::NotClaimed);
            }

            let step = store.get_step(&story.step_db_id).await?;
            let verify_each = step
                .loop_config
                .as_ref()
                .map(|l| l.verify_each)
                .unwrap_or(false);

            // The work phase carries the step's output contract; the verify
            // phase only acknowledges.
            if !story.needs_verify {
                let parsed = ParsedOutputs::parse(raw_output);
                if let Err(e) = parsed.require(&step.required_outputs) {
                    let reason = e.to_string();
                    warn!(story_id = %story.story_id, %reason, "story complete treated as fail");
                    return self
                        .fail_story(&story, &reason)
                        .await
                        .map(|_| CompleteOutcome::TreatedAsFailed { reason });
                }
            }

            let outcome = store
                .complete_story(&story, raw_output, verify_each, Utc::now())
                .await?;
            match outcome {
                StoryCompleteOutcome::AwaitingVerify => {
                    self.pipeline
                        .emit(
                            EventKind::StoryComplete,
                            &story.run_id,
                            Some(&story.step_db_id),
                            &EventDetail::StoryComplete(StoryCompleteDetail {
                                story_id: story.story_id.clone(),
                                verified: false,
                            }),
                        )
                        .await?;
                    Ok(CompleteOutcome::Completed)
                }
                StoryCompleteOutcome::Verified => {
                    self.pipeline
                        .emit(
                            EventKind::StoryComplete,
                            &story.run_id,
                            Some(&story.step_db_id),
                            &EventDetail::StoryComplete(StoryCompleteDetail {
                                story_id: story.story_id.clone(),
                                verified: true,
                            }),
                        )
                        .await?;
                    self.pipeline
                        .complete_loop_if_settled(&story.step_db_id)
                        .await?;
                    Ok(CompleteOutcome::Completed)
                }
                StoryCompleteOutcome::Ignored => Ok(CompleteOutcome::NotClaimed),
            }
        } else {
            Err(ProtocolError::NotFound(unit_id.to_string()))
        }
    }

    /// Record an agent-reported failure for a claimed unit.
    pub async fn fail(&self, unit_id: &Id, reason: &str) -> Result<FailOutcome> {
        let store = self.pipeline.store();

        if let Some(step) = store.find_step(unit_id).await? {
            if step.status.is_terminal() {
                return Ok(FailOutcome::Ignored);
            }
            return Ok(match self.pipeline.fail_step(&step, reason).await? {
                StepFailOutcome::Retried { retry_count } => FailOutcome::Retried { retry_count },
                StepFailOutcome::Exhausted { .. } => FailOutcome::Exhausted,
                StepFailOutcome::Ignored => FailOutcome::Ignored,
            });
        }

        if let Some(story) = store.find_story(unit_id).await? {
            if story.status.is_terminal() {
                return Ok(FailOutcome::Ignored);
            }
            return self.fail_story(&story, reason).await;
        }

        Err(ProtocolError::NotFound(unit_id.to_string()))
    }

    /// Story failure: below budget the story returns to the worker role; at
    /// budget the story fails and takes the loop step (and run) with it. The
    /// unit of retry is the story, not partial work inside it.
    async fn fail_story(
        &self,
        story: &setfarm_core::types::Story,
        reason: &str,
    ) -> Result<FailOutcome> {
        let store = self.pipeline.store();
        let budget = self.pipeline.config().retry_budget;
        let outcome = store.fail_story(story, budget, Utc::now()).await?;

        match outcome {
            StoryFailOutcome::Retried { retry_count } => {
                self.pipeline
                    .emit(
                        EventKind::StoryFail,
                        &story.run_id,
                        Some(&story.step_db_id),
                        &EventDetail::StoryFail(StoryFailDetail {
                            story_id: story.story_id.clone(),
                            reason: reason.to_string(),
                            retry_count,
                        }),
                    )
                    .await?;
                Ok(FailOutcome::Retried { retry_count })
            }
            StoryFailOutcome::Exhausted { retry_count } => {
                self.pipeline
                    .emit(
                        EventKind::StoryFail,
                        &story.run_id,
                        Some(&story.step_db_id),
                        &EventDetail::StoryFail(StoryFailDetail {
                            story_id: story.story_id.clone(),
                            reason: reason.to_string(),
                            retry_count,
                        }),
                    )
                    .await?;
                let step = store.get_step(&story.step_db_id).await?;
                self.pipeline
                    .fail_step_terminal(
                        &step,
                        &format!("story `{}` retry budget exhausted", story.story_id),
                    )
                    .await?;
                Ok(FailOutcome::Exhausted)
            }
            StoryFailOutcome::Ignored => Ok(FailOutcome::Ignored),
        }
    }
}
