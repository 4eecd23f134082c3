//! Cron gateway: adapter to the external periodic scheduler that wakes agent
//! populations.
//!
//! The engine never talks to agents directly; it schedules jobs named
//! `setfarm/<workflow_id>/<role>[-<n>]` and the scheduler invokes the agents
//! on its own cadence. The database stays the source of truth: gateway
//! failures are logged and surfaced to medic, never propagated into the state
//! machine. Every call carries a hard timeout and fails closed.

use async_trait::async_trait;
use serde::Deserialize;
use setfarm_core::config::Config;
use setfarm_core::spec::WorkflowSpec;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CronError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cron gateway timeout after {0}s")]
    Timeout(u64),
    #[error("cron gateway call failed: {0}")]
    Upstream(String),
    #[error("unparseable cron gateway response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, CronError>;

/// Job creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronJobSpec {
    pub name: String,
    pub interval_ms: u64,
    /// Phase offset; parallel shards are staggered to avoid thundering herds.
    pub anchor_ms: u64,
    pub agent_id: String,
    /// Prompt text the scheduler hands to the woken agent.
    pub payload: String,
    pub enabled: bool,
}

/// A scheduled job as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
}

/// The four operations the engine needs from the external scheduler.
#[async_trait]
pub trait CronGateway: Send + Sync {
    async fn create_job(&self, job: &CronJobSpec) -> Result<CronJob>;
    async fn list_jobs(&self) -> Result<Vec<CronJob>>;
    async fn delete_job(&self, id: &str) -> Result<()>;
    /// Delete every job whose name starts with `prefix`; returns the count.
    async fn delete_jobs_by_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Job name for a role shard: `setfarm/<workflow_id>/<role>` with a `-<n>`
/// suffix for shards beyond the first.
pub fn job_name(workflow_id: &str, role: &str, shard: u32) -> String {
    if shard >= 2 {
        format!("setfarm/{workflow_id}/{role}-{shard}")
    } else {
        format!("setfarm/{workflow_id}/{role}")
    }
}

/// Name prefix owning every job of one workflow.
pub fn workflow_prefix(workflow_id: &str) -> String {
    format!("setfarm/{workflow_id}/")
}

/// Extract the workflow id from a job name, if it is one of ours.
pub fn workflow_of_job(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("setfarm/")?;
    let end = rest.find('/')?;
    Some(&rest[..end])
}

/// The prompt a woken agent receives: peek first so idle invocations exit
/// without burning a turn.
pub fn claim_payload(role: &str) -> String {
    format!(
        "Run `setfarm step peek {role}`. If it prints NO_WORK, stop immediately. \
         Otherwise run `setfarm step claim {role}`, execute the returned input, and \
         report the declared outputs with `setfarm step complete <unit_id>` (raw \
         `KEY: value` lines on stdin) or `setfarm step fail <unit_id> <reason>`."
    )
}

/// Idempotently create the jobs a workflow's runs need. Existing names are
/// left untouched. Returns the number of jobs created.
pub async fn ensure_workflow_jobs(
    gateway: &dyn CronGateway,
    spec: &WorkflowSpec,
    config: &Config,
) -> Result<usize> {
    let existing = gateway.list_jobs().await?;
    let interval_ms = spec.interval_ms.unwrap_or(config.cron_interval_ms);
    let mut created = 0;

    for (role, shards) in spec.roles() {
        for shard in 1..=shards {
            let name = job_name(&spec.id, &role, shard);
            if existing.iter().any(|j| j.name == name) {
                continue;
            }
            let job = CronJobSpec {
                name: name.clone(),
                interval_ms,
                anchor_ms: u64::from(shard - 1) * config.cron_stagger_ms,
                agent_id: role.clone(),
                payload: claim_payload(&role),
                enabled: true,
            };
            gateway.create_job(&job).await?;
            info!(job = %name, interval_ms, "created cron job");
            created += 1;
        }
    }
    Ok(created)
}

/// Remove every job of a workflow. Called when its last run leaves `running`.
pub async fn teardown_workflow_jobs(gateway: &dyn CronGateway, workflow_id: &str) -> Result<usize> {
    let deleted = gateway
        .delete_jobs_by_prefix(&workflow_prefix(workflow_id))
        .await?;
    if deleted > 0 {
        info!(workflow_id, deleted, "tore down cron jobs");
    }
    Ok(deleted)
}

/// Gateway backed by the external scheduler's CLI.
pub struct CommandCronGateway {
    bin: PathBuf,
    timeout: Duration,
}

impl CommandCronGateway {
    pub fn new(bin: PathBuf, timeout_sec: u64) -> Self {
        Self {
            bin,
            timeout: Duration::from_secs(timeout_sec),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cron_bin.clone(), config.cron_timeout_sec)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(bin = %self.bin.display(), ?args, "cron gateway call");
        let child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CronError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CronError::Upstream(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CronGateway for CommandCronGateway {
    async fn create_job(&self, job: &CronJobSpec) -> Result<CronJob> {
        let interval = job.interval_ms.to_string();
        let anchor = job.anchor_ms.to_string();
        let mut args: Vec<&str> = vec![
            "add",
            "--name",
            job.name.as_str(),
            "--interval-ms",
            interval.as_str(),
            "--anchor-ms",
            anchor.as_str(),
            "--agent",
            job.agent_id.as_str(),
            "--payload",
            job.payload.as_str(),
        ];
        if !job.enabled {
            args.push("--disabled");
        }
        let stdout = self.run(&args).await?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(CronError::InvalidResponse(
                "scheduler returned no job id".to_string(),
            ));
        }
        Ok(CronJob {
            id: id.to_string(),
            name: job.name.clone(),
        })
    }

    async fn list_jobs(&self) -> Result<Vec<CronJob>> {
        let stdout = self.run(&["list", "--json"]).await?;
        serde_json::from_str(&stdout).map_err(|e| CronError::InvalidResponse(e.to_string()))
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.run(&["remove", id]).await?;
        Ok(())
    }

    async fn delete_jobs_by_prefix(&self, prefix: &str) -> Result<usize> {
        let jobs = self.list_jobs().await?;
        let mut deleted = 0;
        for job in jobs.iter().filter(|j| j.name.starts_with(prefix)) {
            match self.delete_job(&job.id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(job = %job.name, error = %e, "failed to delete cron job"),
            }
        }
        Ok(deleted)
    }
}

/// In-process fake. Records every call so tests can assert on gateway
/// interactions without an external scheduler.
#[derive(Default)]
pub struct MemoryCronGateway {
    jobs: Mutex<Vec<(CronJob, CronJobSpec)>>,
    calls: Mutex<Vec<String>>,
    next_id: Mutex<u64>,
}

impl MemoryCronGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn job_specs(&self) -> Vec<CronJobSpec> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl CronGateway for MemoryCronGateway {
    async fn create_job(&self, job: &CronJobSpec) -> Result<CronJob> {
        self.record(format!("create:{}", job.name));
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let created = CronJob {
            id: format!("job-{next_id}"),
            name: job.name.clone(),
        };
        self.jobs
            .lock()
            .unwrap()
            .push((created.clone(), job.clone()));
        Ok(created)
    }

    async fn list_jobs(&self) -> Result<Vec<CronJob>> {
        self.record("list");
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(job, _)| job.clone())
            .collect())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.record(format!("delete:{id}"));
        self.jobs.lock().unwrap().retain(|(job, _)| job.id != id);
        Ok(())
    }

    async fn delete_jobs_by_prefix(&self, prefix: &str) -> Result<usize> {
        self.record(format!("delete_prefix:{prefix}"));
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|(job, _)| !job.name.starts_with(prefix));
        Ok(before - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ship_spec() -> WorkflowSpec {
        WorkflowSpec::from_yaml_str(
            r#"
id: ship
steps:
  - id: plan
    agent: workflow/planner
    outputs: [STORIES_JSON]
  - id: build
    agent: workflow/developer
    type: loop
    loop:
      source_step: plan
      workers: 2
      verify_each: true
      verify_agent: workflow/verifier
"#,
        )
        .unwrap()
    }

    #[test]
    fn job_names_follow_the_shard_convention() {
        assert_eq!(job_name("ship", "workflow/planner", 1), "setfarm/ship/workflow/planner");
        assert_eq!(
            job_name("ship", "workflow/developer", 2),
            "setfarm/ship/workflow/developer-2"
        );
        assert_eq!(workflow_prefix("ship"), "setfarm/ship/");
        assert_eq!(workflow_of_job("setfarm/ship/workflow/planner"), Some("ship"));
        assert_eq!(workflow_of_job("other/ship/x"), None);
    }

    #[tokio::test]
    async fn ensure_creates_staggered_shards_once() {
        let gateway = MemoryCronGateway::new();
        let spec = ship_spec();
        let config = Config::default();

        let created = ensure_workflow_jobs(&gateway, &spec, &config).await.unwrap();
        // planner + 2 developer shards + 2 verifier shards
        assert_eq!(created, 5);

        let specs = gateway.job_specs();
        let dev2 = specs
            .iter()
            .find(|s| s.name == "setfarm/ship/workflow/developer-2")
            .unwrap();
        assert_eq!(dev2.anchor_ms, config.cron_stagger_ms);
        assert_eq!(dev2.interval_ms, config.cron_interval_ms);
        assert!(dev2.payload.contains("step peek workflow/developer"));

        // Second ensure is a no-op.
        let created = ensure_workflow_jobs(&gateway, &spec, &config).await.unwrap();
        assert_eq!(created, 0);
        assert_eq!(gateway.job_specs().len(), 5);
    }

    #[tokio::test]
    async fn interval_override_from_spec_wins() {
        let gateway = MemoryCronGateway::new();
        let mut spec = ship_spec();
        spec.interval_ms = Some(60_000);
        let config = Config::default();

        ensure_workflow_jobs(&gateway, &spec, &config).await.unwrap();
        assert!(gateway.job_specs().iter().all(|s| s.interval_ms == 60_000));
    }

    #[tokio::test]
    async fn teardown_deletes_by_prefix_only() {
        let gateway = MemoryCronGateway::new();
        let config = Config::default();
        ensure_workflow_jobs(&gateway, &ship_spec(), &config).await.unwrap();
        gateway
            .create_job(&CronJobSpec {
                name: "setfarm/other/workflow/planner".to_string(),
                interval_ms: 1000,
                anchor_ms: 0,
                agent_id: "workflow/planner".to_string(),
                payload: String::new(),
                enabled: true,
            })
            .await
            .unwrap();

        let deleted = teardown_workflow_jobs(&gateway, "ship").await.unwrap();
        assert_eq!(deleted, 5);
        let remaining = gateway.list_jobs().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "setfarm/other/workflow/planner");
    }

    #[tokio::test]
    async fn memory_gateway_records_calls() {
        let gateway = MemoryCronGateway::new();
        gateway.list_jobs().await.unwrap();
        gateway.delete_jobs_by_prefix("setfarm/x/").await.unwrap();
        assert_eq!(gateway.calls(), vec!["list", "delete_prefix:setfarm/x/"]);
    }
}
