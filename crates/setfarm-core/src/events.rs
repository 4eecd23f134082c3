//! Event kinds and payloads for the append-only transition log.
//!
//! Events are written by every component and never read back by the engine;
//! they exist for audit and dashboards.

use crate::types::Id;
use serde::{Deserialize, Serialize};

/// Event kind names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    RunCreated,
    RunDone,
    RunFailed,
    RunResumed,
    StepPending,
    StepClaim,
    StepComplete,
    StepFail,
    StepReset,
    StoriesSeeded,
    StoryClaim,
    StoryComplete,
    StoryFail,
    StoryReset,
    StorySkipped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run.created",
            Self::RunDone => "run.done",
            Self::RunFailed => "run.failed",
            Self::RunResumed => "run.resumed",
            Self::StepPending => "step.pending",
            Self::StepClaim => "step.claim",
            Self::StepComplete => "step.complete",
            Self::StepFail => "step.fail",
            Self::StepReset => "step.reset",
            Self::StoriesSeeded => "stories.seeded",
            Self::StoryClaim => "story.claim",
            Self::StoryComplete => "story.complete",
            Self::StoryFail => "story.fail",
            Self::StoryReset => "story.reset",
            Self::StorySkipped => "story.skipped",
        }
    }
}

/// Payload for `run.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreatedDetail {
    pub workflow_id: String,
    pub task: String,
}

/// Payload for `run.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedDetail {
    pub reason: String,
}

/// Payload for `run.resumed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResumedDetail {
    pub resume_count: u32,
    /// `medic` or `manual`.
    pub source: String,
}

/// Payload for `step.claim` / `step.complete` / `step.pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDetail {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Payload for `step.fail`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailDetail {
    pub step_id: String,
    pub reason: String,
    pub retry_count: u32,
}

/// Payload for `step.reset` / `story.reset` (medic remediation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetDetail {
    pub unit_id: Id,
    pub abandoned_count: u32,
    /// Medic check that triggered the reset.
    pub check: String,
}

/// Payload for `stories.seeded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoriesSeededDetail {
    pub step_id: String,
    pub count: usize,
}

/// Payload for `story.claim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryClaimDetail {
    pub story_id: String,
    pub agent_id: String,
    /// True when this is the verification phase of a `verify_each` cycle.
    pub verify: bool,
}

/// Payload for `story.complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryCompleteDetail {
    pub story_id: String,
    /// False when the story moved to the pending-verify sub-state instead.
    pub verified: bool,
}

/// Payload for `story.fail`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryFailDetail {
    pub story_id: String,
    pub reason: String,
    pub retry_count: u32,
}

/// Payload for `story.skipped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorySkippedDetail {
    pub story_id: String,
    pub abandoned_count: u32,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventDetail {
    RunCreated(RunCreatedDetail),
    RunFailed(RunFailedDetail),
    RunResumed(RunResumedDetail),
    Step(StepDetail),
    StepFail(StepFailDetail),
    Reset(ResetDetail),
    StoriesSeeded(StoriesSeededDetail),
    StoryClaim(StoryClaimDetail),
    StoryComplete(StoryCompleteDetail),
    StoryFail(StoryFailDetail),
    StorySkipped(StorySkippedDetail),
    /// Kinds with no structured payload (`run.done`).
    Empty,
}

impl EventDetail {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Empty => Ok("{}".to_string()),
            other => serde_json::to_string(other),
        }
    }
}
