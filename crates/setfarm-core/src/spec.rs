//! Workflow specification ingestion.
//!
//! Workflows are declared as YAML files, one per workflow, in the workflows
//! directory under the state dir. Parsing produces a validated
//! [`WorkflowSpec`]; everything downstream treats the spec as immutable.

use crate::outputs::is_output_key;
use crate::types::{LoopConfig, StepType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read workflow spec: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid workflow yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid workflow `{workflow}`: {reason}")]
    Invalid { workflow: String, reason: String },
    #[error("workflow not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, SpecError>;

/// Loop block of a step declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Earlier step whose output carries `STORIES_JSON`.
    pub source_step: String,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub verify_each: bool,
    #[serde(default)]
    pub verify_agent: Option<String>,
}

fn default_workers() -> u32 {
    LoopConfig::DEFAULT_WORKERS
}

/// One declared pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    /// Role identifier addressed by the cron gateway (e.g. `workflow/planner`).
    pub agent: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    /// Input template with `{{KEY}}` placeholders.
    #[serde(default)]
    pub input: String,
    /// Output keys the agent must report.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(rename = "loop", default)]
    pub loop_spec: Option<LoopSpec>,
}

impl StepSpec {
    pub fn loop_config(&self) -> Option<LoopConfig> {
        self.loop_spec.as_ref().map(|l| LoopConfig {
            source_step: l.source_step.clone(),
            workers: l.workers,
            verify_each: l.verify_each,
            verify_agent: l.verify_agent.clone(),
        })
    }
}

/// A declarative pipeline: ordered steps, each with a role and I/O contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    /// Cron wake cadence override in milliseconds.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    /// Parse and validate a workflow from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let spec: WorkflowSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load `<dir>/<workflow_id>.yaml` (or `.yml`).
    pub fn load(dir: &Path, workflow_id: &str) -> Result<Self> {
        for ext in ["yaml", "yml"] {
            let path = dir.join(format!("{workflow_id}.{ext}"));
            if path.exists() {
                let text = std::fs::read_to_string(&path)?;
                return Self::from_yaml_str(&text);
            }
        }
        Err(SpecError::NotFound(workflow_id.to_string()))
    }

    /// List every workflow declared in a directory.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        let mut specs = Vec::new();
        if !dir.exists() {
            return Ok(specs);
        }
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        entries.sort();
        for path in entries {
            let text = std::fs::read_to_string(&path)?;
            specs.push(Self::from_yaml_str(&text)?);
        }
        Ok(specs)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Every role a run of this workflow can address, in declaration order,
    /// with the shard count the cron gateway should provision for it.
    pub fn roles(&self) -> Vec<(String, u32)> {
        let mut roles: Vec<(String, u32)> = Vec::new();
        let mut bump = |agent: &str, shards: u32| {
            match roles.iter_mut().find(|(a, _)| a == agent) {
                Some((_, n)) => *n = (*n).max(shards),
                None => roles.push((agent.to_string(), shards)),
            }
        };
        for step in &self.steps {
            match (&step.step_type, &step.loop_spec) {
                (StepType::Loop, Some(l)) => {
                    bump(&step.agent, l.workers);
                    if l.verify_each {
                        if let Some(verify_agent) = &l.verify_agent {
                            bump(verify_agent, l.workers);
                        }
                    }
                }
                _ => bump(&step.agent, 1),
            }
        }
        roles
    }

    fn invalid(&self, reason: impl Into<String>) -> SpecError {
        SpecError::Invalid {
            workflow: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("empty workflow id"));
        }
        if self.steps.is_empty() {
            return Err(self.invalid("workflow declares no steps"));
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(self.invalid(format!("step {index} has an empty id")));
            }
            if self.steps.iter().filter(|s| s.id == step.id).count() > 1 {
                return Err(self.invalid(format!("duplicate step id `{}`", step.id)));
            }
            if step.agent.trim().is_empty() {
                return Err(self.invalid(format!("step `{}` has an empty agent", step.id)));
            }
            for key in &step.outputs {
                if !is_output_key(key) {
                    return Err(
                        self.invalid(format!("step `{}`: invalid output key `{key}`", step.id))
                    );
                }
            }
            match (&step.step_type, &step.loop_spec) {
                (StepType::Loop, None) => {
                    return Err(self.invalid(format!("loop step `{}` has no loop block", step.id)));
                }
                (StepType::Loop, Some(l)) => {
                    if l.workers == 0 {
                        return Err(
                            self.invalid(format!("loop step `{}`: workers must be >= 1", step.id))
                        );
                    }
                    let source_index = self.steps.iter().position(|s| s.id == l.source_step);
                    match source_index {
                        None => {
                            return Err(self.invalid(format!(
                                "loop step `{}`: unknown source_step `{}`",
                                step.id, l.source_step
                            )));
                        }
                        Some(si) if si >= index => {
                            return Err(self.invalid(format!(
                                "loop step `{}`: source_step `{}` must come earlier",
                                step.id, l.source_step
                            )));
                        }
                        Some(_) => {}
                    }
                    if l.verify_each && l.verify_agent.as_deref().unwrap_or("").trim().is_empty() {
                        return Err(self.invalid(format!(
                            "loop step `{}`: verify_each requires verify_agent",
                            step.id
                        )));
                    }
                }
                (StepType::Single, Some(_)) => {
                    return Err(self.invalid(format!(
                        "step `{}` declares a loop block but is not type loop",
                        step.id
                    )));
                }
                (StepType::Single, None) => {}
            }
        }
        Ok(())
    }
}
