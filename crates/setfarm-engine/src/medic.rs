//! Medic: periodic reconciliation with policy-bounded auto-remediation.
//!
//! Each pass runs a fixed battery of checks over declared state (the
//! database) and observed state (the cron gateway), remediates where policy
//! permits, and records an audit row. The pass takes `now` as an argument so
//! every staleness threshold is testable without a clock.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use setfarm_core::events::{EventDetail, EventKind, ResetDetail, StorySkippedDetail};
use setfarm_core::types::{Id, MedicCheck, Run, RunStatus, Step, StepStatus, Story, StoryStatus};
use thiserror::Error;
use tracing::{info, warn};

use crate::cron::{self, CronJob};
use crate::pipeline::{Pipeline, PipelineError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MedicError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MedicError>;

/// The fixed check battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    StuckStep,
    ClaimedButStuck,
    OrphanedStory,
    DeadRun,
    StalledRun,
    OrphanedCrons,
    StalledCrons,
    FailedRunResumable,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StuckStep => "stuck_step",
            Self::ClaimedButStuck => "claimed_but_stuck",
            Self::OrphanedStory => "orphaned_story",
            Self::DeadRun => "dead_run",
            Self::StalledRun => "stalled_run",
            Self::OrphanedCrons => "orphaned_crons",
            Self::StalledCrons => "stalled_crons",
            Self::FailedRunResumable => "failed_run_resumable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// What the medic did (or declined to do) about a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ResetStep,
    FailStep,
    ResetStory,
    SkipStory,
    FailRun,
    ResumeRun,
    DeleteCrons,
    RecreateCrons,
    None,
}

/// One issue discovered by a pass.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub check: CheckKind,
    pub severity: Severity,
    pub action: ActionKind,
    pub remediated: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Id>,
}

/// Result of one medic pass.
#[derive(Debug, Clone)]
pub struct MedicReport {
    pub checked_at: DateTime<Utc>,
    pub findings: Vec<Finding>,
}

impl MedicReport {
    pub fn issues_found(&self) -> u32 {
        self.findings.len() as u32
    }

    pub fn actions_taken(&self) -> u32 {
        self.findings.iter().filter(|f| f.remediated).count() as u32
    }

    pub fn summary(&self) -> String {
        if self.findings.is_empty() {
            "no issues".to_string()
        } else {
            format!(
                "{} issue(s), {} remediated",
                self.issues_found(),
                self.actions_taken()
            )
        }
    }
}

/// The watchdog. Owns nothing; acts only through store transactions and cron
/// gateway calls.
pub struct Medic {
    pipeline: Pipeline,
}

impl Medic {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Crash-recovery step at engine startup: re-ensure cron jobs for every
    /// workflow that still has a running run.
    pub async fn restore_crons(&self) -> Result<()> {
        let runs = self
            .pipeline
            .store()
            .list_runs(Some(RunStatus::Running))
            .await?;
        let mut workflows: Vec<String> = runs.into_iter().map(|r| r.workflow_id).collect();
        workflows.sort();
        workflows.dedup();
        for workflow_id in workflows {
            self.pipeline.ensure_jobs(&workflow_id).await;
        }
        Ok(())
    }

    /// One reconciliation pass. Records a `MedicCheck` audit row and returns
    /// the findings.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<MedicReport> {
        let mut findings = Vec::new();

        // One gateway listing per pass; when the scheduler is unreachable the
        // cron-dependent checks are skipped and the DB-only checks proceed.
        let jobs = match self.pipeline.cron_list().await {
            Ok(jobs) => Some(jobs),
            Err(e) => {
                warn!(error = %e, "cron gateway unreachable, skipping cron checks");
                None
            }
        };

        let runs = self.pipeline.store().list_runs(None).await?;
        for run in runs.iter().filter(|r| r.status == RunStatus::Running) {
            self.check_running_run(run, jobs.as_deref(), now, &mut findings)
                .await?;
        }

        if let Some(jobs) = &jobs {
            self.check_orphaned_crons(&runs, jobs, &mut findings).await?;
            self.check_stalled_crons(&runs, now, &mut findings).await?;
        }
        self.check_resumable_runs(&runs, now, &mut findings).await?;

        let report = MedicReport {
            checked_at: now,
            findings,
        };
        let check = MedicCheck {
            id: Id::new(),
            checked_at: now,
            issues_found: report.issues_found(),
            actions_taken: report.actions_taken(),
            summary: report.summary(),
            findings_json: serde_json::to_string(&report.findings)?,
        };
        self.pipeline
            .store()
            .record_medic_check(&check, self.pipeline.config().medic_retention)
            .await?;
        info!(summary = %check.summary, "medic pass recorded");
        Ok(report)
    }

    async fn check_running_run(
        &self,
        run: &Run,
        jobs: Option<&[CronJob]>,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let config = self.pipeline.config().clone();
        let store = self.pipeline.store();
        let steps = store.list_steps(&run.id).await?;
        let stories = store.list_stories_for_run(&run.id).await?;

        let max_timeout = config.max_role_timeout();
        let mut run_failed_this_pass = false;

        // stuck_step / claimed_but_stuck
        for step in steps.iter().filter(|s| s.status == StepStatus::Running) {
            let age = age_sec(now, step.updated_at);
            if age > max_timeout + config.stuck_grace_sec {
                run_failed_this_pass |= self
                    .remediate_stuck_step(run, step, CheckKind::StuckStep, now, findings)
                    .await?;
            } else if let Some(jobs) = jobs {
                // Faster path: the role's jobs are gone, so no agent
                // population can ever come back for this claim.
                let jobs_missing = !role_has_jobs(jobs, &run.workflow_id, &step.agent_id);
                if jobs_missing && age > config.claimed_stuck_after_sec && age < max_timeout {
                    run_failed_this_pass |= self
                        .remediate_stuck_step(run, step, CheckKind::ClaimedButStuck, now, findings)
                        .await?;
                }
            }
        }
        if run_failed_this_pass {
            return Ok(());
        }

        // orphaned_story
        for story in stories.iter().filter(|s| s.status == StoryStatus::Running) {
            if age_sec(now, story.updated_at) > self.pipeline.config().orphan_story_after_sec {
                self.remediate_orphaned_story(run, story, now, findings).await?;
            }
        }

        // Story remediation may have settled the loop and finished the run;
        // the remaining checks only apply to a run that is still running.
        if store.get_run(&run.id).await?.status != RunStatus::Running {
            return Ok(());
        }

        // dead_run: nothing left that could ever progress.
        let steps = store.list_steps(&run.id).await?;
        let alive = steps.iter().any(|s| {
            matches!(
                s.status,
                StepStatus::Waiting | StepStatus::Pending | StepStatus::Running
            )
        });
        if !steps.is_empty() && !alive {
            store.mark_run_failed(&run.id, now).await?;
            self.pipeline
                .emit_run_failed(&run.id, "dead run: no live steps")
                .await?;
            self.pipeline.on_run_terminal(&run.id).await;
            findings.push(Finding {
                check: CheckKind::DeadRun,
                severity: Severity::Critical,
                action: ActionKind::FailRun,
                remediated: true,
                detail: "run had no step in waiting/pending/running".to_string(),
                run_id: Some(run.id.clone()),
            });
            return Ok(());
        }

        // stalled_run: alert only, never auto-act.
        let last_transition = steps
            .iter()
            .map(|s| s.updated_at)
            .chain(stories.iter().map(|s| s.updated_at))
            .max()
            .unwrap_or(run.updated_at);
        if age_sec(now, last_transition) > 2 * max_timeout {
            findings.push(Finding {
                check: CheckKind::StalledRun,
                severity: Severity::Warning,
                action: ActionKind::None,
                remediated: false,
                detail: format!(
                    "no step transition since {}",
                    last_transition.format("%Y-%m-%dT%H:%M:%SZ")
                ),
                run_id: Some(run.id.clone()),
            });
        }

        Ok(())
    }

    /// Reset a stuck step, or fail it (and the run) once the abandon bound is
    /// hit. Writes are stamped with the pass's clock so thresholds stay
    /// testable. Returns true when the run was failed.
    async fn remediate_stuck_step(
        &self,
        run: &Run,
        step: &Step,
        check: CheckKind,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<bool> {
        let config = self.pipeline.config().clone();

        let Some(abandoned_count) = self.pipeline.store().reset_step(&step.id, now).await? else {
            return Ok(false);
        };
        self.pipeline
            .emit(
                EventKind::StepReset,
                &run.id,
                Some(&step.id),
                &EventDetail::Reset(ResetDetail {
                    unit_id: step.id.clone(),
                    abandoned_count,
                    check: check.as_str().to_string(),
                }),
            )
            .await?;

        if abandoned_count >= config.max_abandons {
            self.pipeline
                .fail_step_terminal(step, &format!("abandoned {abandoned_count} times"))
                .await?;
            findings.push(Finding {
                check,
                severity: Severity::Critical,
                action: ActionKind::FailStep,
                remediated: true,
                detail: format!(
                    "step `{}` abandoned {abandoned_count} times, failing run",
                    step.step_id
                ),
                run_id: Some(run.id.clone()),
            });
            Ok(true)
        } else {
            findings.push(Finding {
                check,
                severity: Severity::Warning,
                action: ActionKind::ResetStep,
                remediated: true,
                detail: format!(
                    "step `{}` reset to pending (abandon {abandoned_count})",
                    step.step_id
                ),
                run_id: Some(run.id.clone()),
            });
            Ok(false)
        }
    }

    /// Reset an orphaned story, or skip it once the abandon bound is hit so
    /// the loop can progress without it.
    async fn remediate_orphaned_story(
        &self,
        run: &Run,
        story: &Story,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let config = self.pipeline.config().clone();

        let Some(abandoned_count) = self.pipeline.store().reset_story(&story.id, now).await?
        else {
            return Ok(());
        };
        self.pipeline
            .emit(
                EventKind::StoryReset,
                &run.id,
                Some(&story.step_db_id),
                &EventDetail::Reset(ResetDetail {
                    unit_id: story.id.clone(),
                    abandoned_count,
                    check: CheckKind::OrphanedStory.as_str().to_string(),
                }),
            )
            .await?;

        if abandoned_count >= config.max_abandons {
            self.pipeline.store().skip_story(&story.id, now).await?;
            self.pipeline
                .emit(
                    EventKind::StorySkipped,
                    &run.id,
                    Some(&story.step_db_id),
                    &EventDetail::StorySkipped(StorySkippedDetail {
                        story_id: story.story_id.clone(),
                        abandoned_count,
                    }),
                )
                .await?;
            // Skipping the last live story may settle the loop.
            self.pipeline
                .complete_loop_if_settled(&story.step_db_id)
                .await?;
            findings.push(Finding {
                check: CheckKind::OrphanedStory,
                severity: Severity::Critical,
                action: ActionKind::SkipStory,
                remediated: true,
                detail: format!(
                    "story `{}` abandoned {abandoned_count} times, skipped",
                    story.story_id
                ),
                run_id: Some(run.id.clone()),
            });
        } else {
            findings.push(Finding {
                check: CheckKind::OrphanedStory,
                severity: Severity::Warning,
                action: ActionKind::ResetStory,
                remediated: true,
                detail: format!(
                    "story `{}` reset to pending (abandon {abandoned_count})",
                    story.story_id
                ),
                run_id: Some(run.id.clone()),
            });
        }
        Ok(())
    }

    /// Jobs exist for workflows with zero running runs: tear them down.
    async fn check_orphaned_crons(
        &self,
        runs: &[Run],
        jobs: &[CronJob],
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let mut workflows: Vec<&str> = jobs
            .iter()
            .filter_map(|j| cron::workflow_of_job(&j.name))
            .collect();
        workflows.sort_unstable();
        workflows.dedup();

        for workflow_id in workflows {
            let has_running = runs
                .iter()
                .any(|r| r.workflow_id == workflow_id && r.status == RunStatus::Running);
            if has_running {
                continue;
            }
            let remediated = match self.pipeline.cron_teardown(workflow_id).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(workflow_id, error = %e, "orphaned cron teardown failed");
                    false
                }
            };
            findings.push(Finding {
                check: CheckKind::OrphanedCrons,
                severity: Severity::Info,
                action: ActionKind::DeleteCrons,
                remediated,
                detail: format!("workflow `{workflow_id}` has jobs but no running runs"),
                run_id: None,
            });
        }
        Ok(())
    }

    /// Pending stories with no claim activity: the agent population is likely
    /// gone. Delete and recreate the workflow's jobs, with a cooldown.
    async fn check_stalled_crons(
        &self,
        runs: &[Run],
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let config = self.pipeline.config().clone();
        let store = self.pipeline.store();

        let mut workflows: Vec<&str> = runs
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.workflow_id.as_str())
            .collect();
        workflows.sort_unstable();
        workflows.dedup();

        for workflow_id in workflows {
            let running: Vec<&Run> = runs
                .iter()
                .filter(|r| r.workflow_id == workflow_id && r.status == RunStatus::Running)
                .collect();

            // The silence baseline: last claim anywhere in the workflow's
            // runs, else the oldest pending story still waiting.
            let mut last_claim: Option<DateTime<Utc>> = None;
            let mut oldest_pending: Option<DateTime<Utc>> = None;
            let mut pending_stories = false;
            for run in &running {
                if let Some(ts) = store.latest_claim_ts(&run.id).await? {
                    last_claim = Some(last_claim.map_or(ts, |cur| cur.max(ts)));
                }
                for story in store.list_stories_for_run(&run.id).await? {
                    if story.status == StoryStatus::Pending {
                        pending_stories = true;
                        oldest_pending =
                            Some(oldest_pending.map_or(story.updated_at, |cur: DateTime<Utc>| {
                                cur.min(story.updated_at)
                            }));
                    }
                }
            }
            if !pending_stories {
                continue;
            }
            let Some(baseline) = last_claim.or(oldest_pending) else {
                continue;
            };
            if age_sec(now, baseline) <= config.stalled_claim_after_sec {
                continue;
            }

            let state_key = format!("cron_recreate:{workflow_id}");
            if let Some((_, last)) = store.get_medic_state(&state_key).await? {
                if age_sec(now, last) < config.cron_recreate_cooldown_sec {
                    findings.push(Finding {
                        check: CheckKind::StalledCrons,
                        severity: Severity::Warning,
                        action: ActionKind::RecreateCrons,
                        remediated: false,
                        detail: format!("workflow `{workflow_id}` stalled, in cooldown"),
                        run_id: None,
                    });
                    continue;
                }
            }

            let remediated = match self.pipeline.cron_teardown(workflow_id).await {
                Ok(_) => {
                    self.pipeline.ensure_jobs(workflow_id).await;
                    store.set_medic_state(&state_key, "recreated", now).await?;
                    true
                }
                Err(e) => {
                    warn!(workflow_id, error = %e, "stalled cron recreate failed");
                    false
                }
            };
            findings.push(Finding {
                check: CheckKind::StalledCrons,
                severity: Severity::Warning,
                action: ActionKind::RecreateCrons,
                remediated,
                detail: format!(
                    "workflow `{workflow_id}`: pending stories but no claims, jobs recreated"
                ),
                run_id: None,
            });
        }
        Ok(())
    }

    /// Failed runs that still have pending stories can be resumed, within the
    /// resume bound and cooldown.
    async fn check_resumable_runs(
        &self,
        runs: &[Run],
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let config = self.pipeline.config().clone();
        let store = self.pipeline.store();

        for run in runs.iter().filter(|r| r.status == RunStatus::Failed) {
            let stories = store.list_stories_for_run(&run.id).await?;
            let has_pending = stories.iter().any(|s| s.status == StoryStatus::Pending);
            if !has_pending {
                continue;
            }

            let resume_count = run.resume_count();
            if resume_count >= config.max_resumes {
                findings.push(Finding {
                    check: CheckKind::FailedRunResumable,
                    severity: Severity::Info,
                    action: ActionKind::None,
                    remediated: false,
                    detail: format!("resume bound reached ({resume_count})"),
                    run_id: Some(run.id.clone()),
                });
                continue;
            }
            if let Some(last_ms) = run.last_resume_at() {
                if let Some(last) = DateTime::from_timestamp_millis(last_ms) {
                    if age_sec(now, last) < config.resume_cooldown_sec {
                        continue;
                    }
                }
            }

            let resume_count = self.pipeline.resume(&run.id, "medic", now).await?;
            findings.push(Finding {
                check: CheckKind::FailedRunResumable,
                severity: Severity::Warning,
                action: ActionKind::ResumeRun,
                remediated: true,
                detail: format!("run resumed with pending stories (resume {resume_count})"),
                run_id: Some(run.id.clone()),
            });
        }
        Ok(())
    }
}

fn age_sec(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    let delta = now.signed_duration_since(then);
    if delta < Duration::zero() {
        0
    } else {
        delta.num_seconds() as u64
    }
}

/// Whether any shard job exists for a role of a workflow.
fn role_has_jobs(jobs: &[CronJob], workflow_id: &str, role: &str) -> bool {
    let base = cron::job_name(workflow_id, role, 1);
    jobs.iter()
        .any(|j| j.name == base || j.name.starts_with(&format!("{base}-")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_never_goes_negative() {
        let now = Utc::now();
        assert_eq!(age_sec(now, now + Duration::seconds(30)), 0);
        assert_eq!(age_sec(now, now - Duration::seconds(30)), 30);
    }

    #[test]
    fn role_job_matching_covers_shards() {
        let jobs = vec![
            CronJob {
                id: "1".to_string(),
                name: "setfarm/ship/workflow/developer".to_string(),
            },
            CronJob {
                id: "2".to_string(),
                name: "setfarm/ship/workflow/developer-2".to_string(),
            },
        ];
        assert!(role_has_jobs(&jobs, "ship", "workflow/developer"));
        assert!(!role_has_jobs(&jobs, "ship", "workflow/verifier"));
        assert!(!role_has_jobs(&jobs, "other", "workflow/developer"));
    }

    #[test]
    fn report_summary_counts_remediations() {
        let report = MedicReport {
            checked_at: Utc::now(),
            findings: vec![
                Finding {
                    check: CheckKind::StuckStep,
                    severity: Severity::Warning,
                    action: ActionKind::ResetStep,
                    remediated: true,
                    detail: "reset".to_string(),
                    run_id: None,
                },
                Finding {
                    check: CheckKind::StalledRun,
                    severity: Severity::Warning,
                    action: ActionKind::None,
                    remediated: false,
                    detail: "stalled".to_string(),
                    run_id: None,
                },
            ],
        };
        assert_eq!(report.issues_found(), 2);
        assert_eq!(report.actions_taken(), 1);
        assert_eq!(report.summary(), "2 issue(s), 1 remediated");
    }

    #[test]
    fn check_kind_names_match_policy_table() {
        assert_eq!(CheckKind::StuckStep.as_str(), "stuck_step");
        assert_eq!(CheckKind::ClaimedButStuck.as_str(), "claimed_but_stuck");
        assert_eq!(CheckKind::FailedRunResumable.as_str(), "failed_run_resumable");
    }
}
