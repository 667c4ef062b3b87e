//! Configuration types and loading for task-mux

mod loader;
mod sections;
mod worker;
mod workflow;

pub use loader::{EngineConfig, load_template, load_template_file};
pub use sections::{
    DeliveryConfig, PoolConfig, ProgressConfig, RetryPlacement, RunnerConfig, StageSpec,
    StoreConfig, WorkflowSettings,
};
pub use worker::WorkerConfig;
pub use workflow::{StepConfig, StepType, WorkflowTemplate};
