//! End-to-end scenarios for the claim protocol, pipeline, and medic.
//!
//! Runs against a real store in a temp dir and the in-memory cron gateway.

use chrono::{Duration, Utc};
use setfarm_core::config::Config;
use setfarm_core::types::{Id, RunStatus, StepStatus, StoryStatus};
use setfarm_engine::cron::{CronGateway, MemoryCronGateway};
use setfarm_engine::medic::{ActionKind, CheckKind};
use setfarm_engine::protocol::{ClaimedUnit, CompleteOutcome, FailOutcome};
use setfarm_engine::Engine;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    engine: Engine,
    gateway: Arc<MemoryCronGateway>,
    config: Config,
    _dir: TempDir, // Keep alive to prevent cleanup
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.state_dir = dir.path().to_path_buf();
    std::fs::create_dir_all(config.workflows_dir()).unwrap();

    let gateway = Arc::new(MemoryCronGateway::new());
    let engine = Engine::open(config.clone(), gateway.clone() as Arc<dyn setfarm_engine::cron::CronGateway>)
        .await
        .unwrap();
    Harness {
        engine,
        gateway,
        config,
        _dir: dir,
    }
}

impl Harness {
    fn write_workflow(&self, workflow_id: &str, yaml: &str) {
        std::fs::write(
            self.config.workflows_dir().join(format!("{workflow_id}.yaml")),
            yaml,
        )
        .unwrap();
    }
}

const SINGLE_STEP_YAML: &str = r#"
id: x
steps:
  - id: plan
    agent: p
    input: "Plan the task: {{TASK}}"
    outputs: [SUMMARY]
"#;

const LOOP_YAML: &str = r#"
id: fan
steps:
  - id: plan
    agent: p
    input: "Plan: {{TASK}}"
    outputs: [STORIES_JSON]
  - id: build
    agent: dev
    type: loop
    loop:
      source_step: plan
      workers: 2
    outputs: [RESULT]
"#;

const VERIFY_LOOP_YAML: &str = r#"
id: careful
steps:
  - id: plan
    agent: p
    outputs: [STORIES_JSON]
  - id: build
    agent: dev
    type: loop
    loop:
      source_step: plan
      workers: 2
      verify_each: true
      verify_agent: verifier
    outputs: [RESULT]
"#;

const TWO_STORIES: &str = r#"STORIES_JSON: [{"story_id":"a","title":"A","input":"do A"},{"story_id":"b","title":"B","input":"do B"}]"#;

fn claimed_step(unit: Option<ClaimedUnit>) -> setfarm_engine::protocol::ClaimedStep {
    match unit {
        Some(ClaimedUnit::Step(c)) => c,
        other => panic!("expected a step claim, got {other:?}"),
    }
}

fn claimed_story(unit: Option<ClaimedUnit>) -> setfarm_engine::protocol::ClaimedStory {
    match unit {
        Some(ClaimedUnit::Story(c)) => c,
        other => panic!("expected a story claim, got {other:?}"),
    }
}

// --- S1: happy path, single step ---

#[tokio::test]
async fn single_step_run_completes() {
    let h = harness().await;
    h.write_workflow("x", SINGLE_STEP_YAML);
    let run = h.engine.start_run("x", "ship it").await.unwrap();

    // Cron jobs were created for the planner role.
    assert!(h
        .gateway
        .job_specs()
        .iter()
        .any(|j| j.name == "setfarm/x/p"));

    assert!(h.engine.protocol().peek("p").await.unwrap());
    let claim = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    assert_eq!(claim.run_id, run.id);
    assert_eq!(claim.input, "Plan the task: ship it");

    let outcome = h
        .engine
        .protocol()
        .complete(&claim.step_id, "SUMMARY: ok\n")
        .await
        .unwrap();
    assert_eq!(outcome, CompleteOutcome::Completed);

    let run = h.engine.store().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Done);
    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Done);
    assert!(steps[0].output.as_deref().unwrap().contains("SUMMARY: ok"));

    // No running runs left: jobs were torn down.
    assert!(h.gateway.job_specs().is_empty());
    assert!(!h.engine.protocol().peek("p").await.unwrap());
}

// --- S2: fail then retry ---

#[tokio::test]
async fn step_retries_then_succeeds() {
    let h = harness().await;
    h.write_workflow("x", SINGLE_STEP_YAML);
    let run = h.engine.start_run("x", "task").await.unwrap();

    for _ in 0..2 {
        let claim = claimed_step(h.engine.protocol().claim("p").await.unwrap());
        let outcome = h
            .engine
            .protocol()
            .fail(&claim.step_id, "agent crashed")
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retried { .. }));
    }

    let claim = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&claim.step_id, "SUMMARY: finally")
        .await
        .unwrap();

    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].retry_count, 2);
    assert_eq!(steps[0].status, StepStatus::Done);
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Done
    );
}

// --- S3: budget exhausted ---

#[tokio::test]
async fn budget_exhaustion_fails_run_with_exact_events() {
    let h = harness().await;
    h.write_workflow("x", SINGLE_STEP_YAML);
    let run = h.engine.start_run("x", "task").await.unwrap();

    for attempt in 0..3 {
        let claim = claimed_step(h.engine.protocol().claim("p").await.unwrap());
        let outcome = h
            .engine
            .protocol()
            .fail(&claim.step_id, "bad day")
            .await
            .unwrap();
        if attempt < 2 {
            assert!(matches!(outcome, FailOutcome::Retried { .. }));
        } else {
            assert_eq!(outcome, FailOutcome::Exhausted);
        }
    }

    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Failed
    );

    let events = h.engine.store().list_events(&run.id).await.unwrap();
    let step_fails = events.iter().filter(|e| e.kind == "step.fail").count();
    let run_fails = events.iter().filter(|e| e.kind == "run.failed").count();
    assert_eq!(step_fails, 3);
    assert_eq!(run_fails, 1);
}

// --- S4: loop fan-out ---

#[tokio::test]
async fn loop_fans_out_disjoint_stories_and_completes() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    let run = h.engine.start_run("fan", "build both").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, TWO_STORIES)
        .await
        .unwrap();

    // Round trip: exactly as many story rows as the array declared, in order.
    let stories = h.engine.store().list_stories_for_run(&run.id).await.unwrap();
    assert_eq!(stories.len(), 2);
    assert_eq!(stories[0].story_id, "a");
    assert_eq!(stories[1].story_id, "b");

    // Two parallel developer claims return disjoint stories.
    let first = claimed_story(h.engine.protocol().claim("dev").await.unwrap());
    let second = claimed_story(h.engine.protocol().claim("dev").await.unwrap());
    assert_ne!(first.story_id, second.story_id);
    assert_eq!(first.input, "do A");
    // Worker slots are saturated now.
    assert!(h.engine.protocol().claim("dev").await.unwrap().is_none());

    h.engine
        .protocol()
        .complete(&first.story_id, "RESULT: done A")
        .await
        .unwrap();
    h.engine
        .protocol()
        .complete(&second.story_id, "RESULT: done B")
        .await
        .unwrap();

    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[1].status, StepStatus::Done);
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Done
    );
}

#[tokio::test]
async fn concurrent_claims_return_disjoint_units() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    h.engine.start_run("fan", "parallel").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, TWO_STORIES)
        .await
        .unwrap();

    let p1 = h.engine.protocol().clone();
    let p2 = h.engine.protocol().clone();
    let (a, b) = tokio::join!(p1.claim("dev"), p2.claim("dev"));
    let (a, b) = (a.unwrap(), b.unwrap());

    match (a, b) {
        (Some(ClaimedUnit::Story(x)), Some(ClaimedUnit::Story(y))) => {
            assert_ne!(x.story_id, y.story_id);
        }
        // One racer losing entirely is also a valid linearisation.
        (Some(_), None) | (None, Some(_)) => {}
        other => panic!("unexpected claim results: {other:?}"),
    }
}

// --- verify_each two-phase cycle ---

#[tokio::test]
async fn verify_each_requires_verifier_pass() {
    let h = harness().await;
    h.write_workflow("careful", VERIFY_LOOP_YAML);
    let run = h.engine.start_run("careful", "carefully").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(
            &plan.step_id,
            r#"STORIES_JSON: [{"story_id":"a","title":"A","input":"do A"}]"#,
        )
        .await
        .unwrap();

    // Worker phase.
    let work = claimed_story(h.engine.protocol().claim("dev").await.unwrap());
    h.engine
        .protocol()
        .complete(&work.story_id, "RESULT: built")
        .await
        .unwrap();

    // Story is now pending-verify: invisible to dev, visible to verifier.
    assert!(h.engine.protocol().claim("dev").await.unwrap().is_none());
    let verify = claimed_story(h.engine.protocol().claim("verifier").await.unwrap());
    assert_eq!(verify.story_id, work.story_id);

    // Verifier failure sends the story back to the worker role.
    h.engine
        .protocol()
        .fail(&verify.story_id, "does not build")
        .await
        .unwrap();
    let redo = claimed_story(h.engine.protocol().claim("dev").await.unwrap());
    assert_eq!(redo.story_id, work.story_id);
    h.engine
        .protocol()
        .complete(&redo.story_id, "RESULT: built again")
        .await
        .unwrap();

    // Verifier pass settles the story and the loop.
    let verify = claimed_story(h.engine.protocol().claim("verifier").await.unwrap());
    h.engine
        .protocol()
        .complete(&verify.story_id, "VERDICT: pass")
        .await
        .unwrap();

    let stories = h.engine.store().list_stories_for_run(&run.id).await.unwrap();
    assert_eq!(stories[0].status, StoryStatus::Verified);
    assert_eq!(stories[0].retry_count, 1);
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Done
    );
}

// --- loop edge cases ---

#[tokio::test]
async fn empty_story_list_completes_loop_immediately() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    let run = h.engine.start_run("fan", "nothing to do").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, "STORIES_JSON: []")
        .await
        .unwrap();

    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Done
    );
}

#[tokio::test]
async fn invalid_stories_json_fails_the_loop_step() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    let run = h.engine.start_run("fan", "broken planner").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, "STORIES_JSON: not json at all")
        .await
        .unwrap();

    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(steps[1].retry_count, 3);
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn missing_required_outputs_behave_as_fail() {
    let h = harness().await;
    h.write_workflow("x", SINGLE_STEP_YAML);
    let run = h.engine.start_run("x", "task").await.unwrap();

    let claim = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    let outcome = h
        .engine
        .protocol()
        .complete(&claim.step_id, "NOTES: no summary here")
        .await
        .unwrap();
    assert!(matches!(outcome, CompleteOutcome::TreatedAsFailed { .. }));

    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Pending);
    assert_eq!(steps[0].retry_count, 1);
}

// --- P6: idempotent completion ---

#[tokio::test]
async fn completing_a_terminal_unit_is_a_noop() {
    let h = harness().await;
    h.write_workflow("x", SINGLE_STEP_YAML);
    let run = h.engine.start_run("x", "task").await.unwrap();

    let claim = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&claim.step_id, "SUMMARY: ok")
        .await
        .unwrap();

    let outcome = h
        .engine
        .protocol()
        .complete(&claim.step_id, "SUMMARY: different")
        .await
        .unwrap();
    assert_eq!(outcome, CompleteOutcome::AlreadyTerminal);

    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert!(steps[0].output.as_deref().unwrap().contains("SUMMARY: ok"));
}

#[tokio::test]
async fn completing_an_unknown_unit_is_not_found() {
    let h = harness().await;
    let err = h
        .engine
        .protocol()
        .complete(&Id::new(), "SUMMARY: ok")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown unit"));
}

// --- input resolution ---

#[tokio::test]
async fn later_step_input_resolves_from_earlier_outputs() {
    let h = harness().await;
    h.write_workflow(
        "chain",
        r#"
id: chain
steps:
  - id: plan
    agent: p
    outputs: [SUMMARY]
  - id: apply
    agent: q
    input: "Apply: {{SUMMARY}} / missing {{NOPE}}"
    outputs: [DONE]
"#,
    );
    h.engine.start_run("chain", "task").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, "SUMMARY: the plan")
        .await
        .unwrap();

    let apply = claimed_step(h.engine.protocol().claim("q").await.unwrap());
    assert_eq!(apply.input, "Apply: the plan / missing [missing: NOPE]");
}

// --- S5: medic resets a stuck step ---

#[tokio::test]
async fn medic_resets_stuck_step() {
    let h = harness().await;
    h.write_workflow("x", SINGLE_STEP_YAML);
    let run = h.engine.start_run("x", "task").await.unwrap();

    claimed_step(h.engine.protocol().claim("p").await.unwrap());

    // Past max_role_timeout + grace: the claim is stuck.
    let later = Utc::now()
        + Duration::seconds((h.config.max_role_timeout() + h.config.stuck_grace_sec + 60) as i64);
    let report = h.engine.medic().run_pass(later).await.unwrap();

    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::StuckStep && f.action == ActionKind::ResetStep));

    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Pending);
    assert_eq!(steps[0].abandoned_count, 1);
    assert_eq!(steps[0].retry_count, 0);
}

#[tokio::test]
async fn medic_fast_path_when_role_jobs_are_gone() {
    let h = harness().await;
    h.write_workflow("x", SINGLE_STEP_YAML);
    let run = h.engine.start_run("x", "task").await.unwrap();
    claimed_step(h.engine.protocol().claim("p").await.unwrap());

    // Remove the role's jobs: the agent population cannot come back.
    h.engine.pipeline().cron_teardown("x").await.unwrap();

    // Between 10 minutes and the role timeout.
    let later = Utc::now() + Duration::seconds((h.config.claimed_stuck_after_sec + 120) as i64);
    let report = h.engine.medic().run_pass(later).await.unwrap();

    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::ClaimedButStuck && f.remediated));
    let steps = h.engine.store().list_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Pending);
    assert_eq!(steps[0].abandoned_count, 1);
}

// --- S6: orphaned story skipped after repeated abandons ---

#[tokio::test]
async fn medic_skips_orphaned_story_after_abandon_bound() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    let run = h.engine.start_run("fan", "orphan").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(
            &plan.step_id,
            r#"STORIES_JSON: [{"story_id":"a","title":"A","input":"do A"}]"#,
        )
        .await
        .unwrap();

    let later = Utc::now() + Duration::seconds((h.config.orphan_story_after_sec + 60) as i64);
    for cycle in 1..=5u32 {
        claimed_story(h.engine.protocol().claim("dev").await.unwrap());
        let report = h.engine.medic().run_pass(later).await.unwrap();

        let stories = h.engine.store().list_stories_for_run(&run.id).await.unwrap();
        if cycle < 5 {
            assert_eq!(stories[0].status, StoryStatus::Pending, "cycle {cycle}");
            assert_eq!(stories[0].abandoned_count, cycle);
        } else {
            // Fifth cycle: skipped, and the loop progresses without it.
            assert!(report
                .findings
                .iter()
                .any(|f| f.check == CheckKind::OrphanedStory && f.action == ActionKind::SkipStory));
            assert_eq!(stories[0].status, StoryStatus::Skipped);
        }
    }

    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Done
    );
}

// --- story failure exhausts through the loop step ---

#[tokio::test]
async fn story_budget_exhaustion_fails_loop_and_run() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    let run = h.engine.start_run("fan", "doomed").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, TWO_STORIES)
        .await
        .unwrap();

    for _ in 0..3 {
        let claim = claimed_story(h.engine.protocol().claim("dev").await.unwrap());
        assert_eq!(claim.input, "do A");
        h.engine
            .protocol()
            .fail(&claim.story_id, "cannot do A")
            .await
            .unwrap();
    }

    let run = h.engine.store().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let stories = h.engine.store().list_stories_for_run(&run.id).await.unwrap();
    assert_eq!(stories[0].status, StoryStatus::Failed);
    // Story b was never started.
    assert_eq!(stories[1].status, StoryStatus::Pending);
}

// --- P7: medic resume bound ---

#[tokio::test]
async fn medic_resumes_failed_run_at_most_three_times() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    let run = h.engine.start_run("fan", "flaky").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, TWO_STORIES)
        .await
        .unwrap();

    // Fail story `a` through its budget; story `b` stays pending.
    for _ in 0..3 {
        let claim = claimed_story(h.engine.protocol().claim("dev").await.unwrap());
        h.engine
            .protocol()
            .fail(&claim.story_id, "flaky")
            .await
            .unwrap();
    }
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Failed
    );

    // Each medic pass past the cooldown resumes once, up to the bound.
    for expected in 1..=3u32 {
        let later = Utc::now()
            + Duration::seconds(((expected as u64) * (h.config.resume_cooldown_sec + 60)) as i64);
        let report = h.engine.medic().run_pass(later).await.unwrap();
        assert!(
            report
                .findings
                .iter()
                .any(|f| f.check == CheckKind::FailedRunResumable && f.remediated),
            "resume {expected} did not happen"
        );
        let resumed = h.engine.store().get_run(&run.id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        assert_eq!(resumed.resume_count(), expected);
        // Fail the run again for the next cycle.
        h.engine
            .store()
            .mark_run_failed(&run.id, Utc::now())
            .await
            .unwrap();
    }

    // Bound reached: no further resume, ever.
    let later = Utc::now() + Duration::days(1);
    let report = h.engine.medic().run_pass(later).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::FailedRunResumable && !f.remediated));
    let run = h.engine.store().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.resume_count(), 3);
}

// --- medic cron reconciliation ---

#[tokio::test]
async fn medic_deletes_orphaned_crons() {
    let h = harness().await;
    h.gateway
        .create_job(&setfarm_engine::cron::CronJobSpec {
            name: "setfarm/ghost/p".to_string(),
            interval_ms: 1000,
            anchor_ms: 0,
            agent_id: "p".to_string(),
            payload: String::new(),
            enabled: true,
        })
        .await
        .unwrap();

    let report = h.engine.medic().run_pass(Utc::now()).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::OrphanedCrons && f.remediated));
    assert!(h.gateway.job_specs().is_empty());
}

#[tokio::test]
async fn medic_recreates_stalled_crons_with_cooldown() {
    let h = harness().await;
    h.write_workflow("fan", LOOP_YAML);
    h.engine.start_run("fan", "stall").await.unwrap();

    let plan = claimed_step(h.engine.protocol().claim("p").await.unwrap());
    h.engine
        .protocol()
        .complete(&plan.step_id, TWO_STORIES)
        .await
        .unwrap();

    // Pending stories, but no claim for over three cron intervals.
    let later = Utc::now() + Duration::seconds((h.config.stalled_claim_after_sec + 60) as i64);
    let report = h.engine.medic().run_pass(later).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::StalledCrons && f.remediated));
    // Jobs exist again after the recreate.
    assert!(!h.gateway.job_specs().is_empty());

    // A second pass inside the cooldown window does not act.
    let report = h.engine.medic().run_pass(later).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::StalledCrons && !f.remediated));
}

#[tokio::test]
async fn medic_fails_dead_run() {
    use setfarm_core::types::{Run, Step, StepType};
    use std::collections::BTreeMap;

    let h = harness().await;

    // Crash damage: the only step is terminal but the run still says running.
    let now = Utc::now();
    let run = Run {
        id: Id::new(),
        workflow_id: "x".to_string(),
        task: "dead".to_string(),
        status: RunStatus::Running,
        meta: BTreeMap::new(),
        created_at: now,
        updated_at: now,
    };
    let step = Step {
        id: Id::new(),
        run_id: run.id.clone(),
        step_index: 0,
        step_id: "plan".to_string(),
        agent_id: "p".to_string(),
        step_type: StepType::Single,
        status: StepStatus::Done,
        retry_count: 0,
        abandoned_count: 0,
        input_template: String::new(),
        required_outputs: Vec::new(),
        input: None,
        output: None,
        loop_config: None,
        current_story_id: None,
        updated_at: now,
    };
    h.engine
        .store()
        .seed_run(&run, std::slice::from_ref(&step))
        .await
        .unwrap();

    let report = h.engine.medic().run_pass(Utc::now()).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::DeadRun && f.remediated));
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Failed
    );
}

// --- monotone cursor (P2) ---

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let h = harness().await;
    h.write_workflow(
        "three",
        r#"
id: three
steps:
  - id: a
    agent: p
    outputs: [OUT]
  - id: b
    agent: p
    outputs: [OUT]
  - id: c
    agent: p
    outputs: [OUT]
"#,
    );
    let run = h.engine.start_run("three", "task").await.unwrap();

    let mut last_cursor = 0;
    for _ in 0..3 {
        let claim = claimed_step(h.engine.protocol().claim("p").await.unwrap());
        h.engine
            .protocol()
            .complete(&claim.step_id, "OUT: ok")
            .await
            .unwrap();

        let steps = h.engine.store().list_steps(&run.id).await.unwrap();
        let cursor = steps
            .iter()
            .find(|s| s.status != StepStatus::Done)
            .map(|s| s.step_index)
            .unwrap_or(steps.len() as u32);
        assert!(cursor >= last_cursor);
        last_cursor = cursor;
    }
    assert_eq!(
        h.engine.store().get_run(&run.id).await.unwrap().status,
        RunStatus::Done
    );
}
