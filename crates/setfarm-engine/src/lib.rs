//! setfarm-engine: the workflow execution engine.
//!
//! Persistent state lives in a single SQLite database; agents talk to the
//! engine through the claim protocol; the medic reconciles drift between
//! declared state (the database) and observed state (the external cron
//! scheduler).

pub mod archive;
pub mod cron;
pub mod medic;
pub mod pipeline;
pub mod protocol;
pub mod store;

use std::sync::Arc;

use setfarm_core::config::Config;
use setfarm_core::spec::{SpecError, WorkflowSpec};
use setfarm_core::types::{Id, Run};
use thiserror::Error;

use cron::CronGateway;
use medic::Medic;
use pipeline::{Pipeline, PipelineError};
use protocol::{Protocol, ProtocolError};
use store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("medic error: {0}")]
    Medic(#[from] medic::MedicError),
    #[error("spec error: {0}")]
    Spec(#[from] SpecError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine facade: one store, one cron gateway, shared by every component.
pub struct Engine {
    store: Arc<Store>,
    pipeline: Pipeline,
    protocol: Protocol,
    config: Config,
}

impl Engine {
    /// Open the store under the configured state dir, run migrations, and
    /// wire the components together.
    pub async fn open(config: Config, cron: Arc<dyn CronGateway>) -> Result<Self> {
        let store = Arc::new(Store::open(&config.db_path()).await?);
        store.migrate_embedded().await?;

        let pipeline = Pipeline::new(Arc::clone(&store), cron, config.clone());
        let protocol = Protocol::new(pipeline.clone());

        Ok(Self {
            store,
            pipeline,
            protocol,
            config,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn medic(&self) -> Medic {
        Medic::new(self.pipeline.clone())
    }

    /// Load a workflow spec from the workflows directory.
    pub fn load_spec(&self, workflow_id: &str) -> Result<WorkflowSpec> {
        Ok(WorkflowSpec::load(&self.config.workflows_dir(), workflow_id)?)
    }

    /// Create a run of a declared workflow against a task description.
    pub async fn start_run(&self, workflow_id: &str, task: &str) -> Result<Run> {
        let spec = self.load_spec(workflow_id)?;
        Ok(self.pipeline.start_run(&spec, task).await?)
    }

    /// Manual resume of a failed run (the medic path carries its own bounds).
    pub async fn resume_run(&self, run_id: &Id) -> Result<u32> {
        Ok(self.pipeline.resume(run_id, "manual", chrono::Utc::now()).await?)
    }
}
