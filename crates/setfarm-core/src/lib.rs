pub mod config;
pub mod events;
pub mod outputs;
pub mod spec;
pub mod types;

pub use config::Config;
pub use spec::{StepSpec, WorkflowSpec};
pub use types::*;
