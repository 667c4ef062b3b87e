//! task-mux - task orchestration engine
//!
//! Tasks are queued by priority in a [`store::TaskStore`], executed by a
//! bounded [`pool::WorkerPool`] through the [`runner::JobRunner`] (one
//! external process per attempt), and tracked by weighted stages in the
//! [`progress::ProgressTracker`]. Workflows chain tasks into DAGs with
//! conditions and approval gates ([`workflow::WorkflowEngine`]).
//! [`engine::Engine`] wires everything together.

pub mod cli;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pool;
pub mod process;
pub mod progress;
pub mod runner;
pub mod shutdown;
pub mod store;
pub mod template;
pub mod workflow;

pub use engine::{Engine, EngineError, EngineEvent, StatusReport};
pub use error::{EngineFailure, ErrorKind};
