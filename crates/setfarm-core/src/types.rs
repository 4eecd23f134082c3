//! Core types for the workflow engine.
//!
//! Runs, steps, stories, events and medic checks, plus their status enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for runs, steps, stories, events, and medic checks.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Step structure: a plain pipeline stage or a story fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Single,
    Loop,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Loop => "loop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "loop" => Some(Self::Loop),
            _ => None,
        }
    }
}

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Pending,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// A terminal step never transitions again except through an explicit resume.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Story lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Running,
    Verified,
    Failed,
    Skipped,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "verified" => Some(Self::Verified),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::Skipped)
    }

    /// Terminal states that count toward loop completion.
    pub fn counts_as_settled(&self) -> bool {
        matches!(self, Self::Verified | Self::Skipped)
    }
}

// --- Core entities ---

/// Fan-out configuration for a `loop` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Step id whose output carries the `STORIES_JSON` array.
    pub source_step: String,
    /// Parallel worker shard count.
    pub workers: u32,
    /// Require a verifier pass per story.
    pub verify_each: bool,
    /// Role that claims the verification phase (required when `verify_each`).
    pub verify_agent: Option<String>,
}

impl LoopConfig {
    pub const DEFAULT_WORKERS: u32 = 3;
}

/// An execution of one workflow against a task description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub workflow_id: String,
    /// Free-form user input this run executes against.
    pub task: String,
    pub status: RunStatus,
    /// Opaque key-value bookkeeping (medic resume accounting lives here).
    pub meta: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const META_RESUME_COUNT: &str = "resume_count";
pub const META_LAST_RESUME_AT: &str = "last_resume_at";

impl Run {
    /// Number of medic-initiated resumes applied to this run.
    pub fn resume_count(&self) -> u32 {
        self.meta
            .get(META_RESUME_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Epoch-millisecond timestamp of the last resume, if any.
    pub fn last_resume_at(&self) -> Option<i64> {
        self.meta.get(META_LAST_RESUME_AT).and_then(|v| v.parse().ok())
    }
}

/// One pipeline stage of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Id,
    pub run_id: Id,
    /// 0-based position in the pipeline.
    pub step_index: u32,
    /// Spec-declared step name (unique within the workflow).
    pub step_id: String,
    /// Role that claims this step (e.g. `workflow/developer`).
    pub agent_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    /// Completed agent-reported failure cycles; resets only on explicit resume.
    pub retry_count: u32,
    /// Medic-initiated resets; never resets.
    pub abandoned_count: u32,
    /// Raw input template with `{{KEY}}` placeholders.
    pub input_template: String,
    /// Output keys the agent must report for `complete` to be accepted.
    pub required_outputs: Vec<String>,
    /// Resolved instructions, fixed at claim time.
    pub input: Option<String>,
    /// Raw text block returned by the agent.
    pub output: Option<String>,
    pub loop_config: Option<LoopConfig>,
    /// Most recently claimed story of a loop step; cleared when none run.
    pub current_story_id: Option<Id>,
    pub updated_at: DateTime<Utc>,
}

/// One unit of work inside a loop step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Id,
    pub run_id: Id,
    /// Owning loop step (database id, not the spec-declared name).
    pub step_db_id: Id,
    /// Stable human identifier declared by the upstream planner.
    pub story_id: String,
    pub story_index: u32,
    pub title: String,
    /// Resolved instructions, fixed at materialisation time.
    pub input: String,
    pub status: StoryStatus,
    /// Pending-verify sub-state: the worker finished, a verifier claims next.
    pub needs_verify: bool,
    pub output: Option<String>,
    pub retry_count: u32,
    pub abandoned_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// An append-only state-transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub ts: DateTime<Utc>,
    /// Event kind name (e.g. `step.fail`, `run.failed`).
    pub kind: String,
    pub run_id: Id,
    pub step_id: Option<Id>,
    /// JSON payload with kind-specific data.
    pub detail: String,
}

/// Audit row for one medic pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicCheck {
    pub id: Id,
    pub checked_at: DateTime<Utc>,
    pub issues_found: u32,
    pub actions_taken: u32,
    pub summary: String,
    pub findings_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn statuses_round_trip_through_as_str() {
        for status in [RunStatus::Running, RunStatus::Done, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            StepStatus::Waiting,
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Done,
            StepStatus::Failed,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            StoryStatus::Pending,
            StoryStatus::Running,
            StoryStatus::Verified,
            StoryStatus::Failed,
            StoryStatus::Skipped,
        ] {
            assert_eq!(StoryStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn story_settlement_excludes_failed() {
        assert!(StoryStatus::Verified.counts_as_settled());
        assert!(StoryStatus::Skipped.counts_as_settled());
        assert!(!StoryStatus::Failed.counts_as_settled());
        assert!(StoryStatus::Failed.is_terminal());
    }

    #[test]
    fn run_meta_resume_accounting() {
        let mut run = Run {
            id: Id::new(),
            workflow_id: "wf".to_string(),
            task: "do the thing".to_string(),
            status: RunStatus::Running,
            meta: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(run.resume_count(), 0);
        assert_eq!(run.last_resume_at(), None);

        run.meta
            .insert(META_RESUME_COUNT.to_string(), "2".to_string());
        run.meta
            .insert(META_LAST_RESUME_AT.to_string(), "1712345".to_string());
        assert_eq!(run.resume_count(), 2);
        assert_eq!(run.last_resume_at(), Some(1712345));
    }

    #[test]
    fn step_type_default_is_single() {
        assert_eq!(StepType::default(), StepType::Single);
    }
}
