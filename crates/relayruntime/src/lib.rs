//! Execution runtime for resumable pipelines
//!
//! Keeps per-workflow execution state and checkpoints, walks a workflow's
//! execution order one node at a time, and exposes the stop / pause /
//! resume / restart control surface on top.

mod checkpoint;
mod config;
mod executor;
mod lease;
pub mod order;
pub mod persist;
mod reaper;
mod registry;
mod runtime;
mod state;
mod stop_poller;

pub use checkpoint::CheckpointStore;
pub use config::RuntimeConfig;
pub use executor::{ExecutionResult, RunOutcome, RunPlan, RunReport, WorkflowExecutor};
pub use lease::{RunLease, RunLocks};
pub use order::build_execution_order;
pub use reaper::{ReapReport, Reaper};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, RegistryExecutor};
pub use runtime::RelayRuntime;
pub use state::ExecutionStateStore;
pub use stop_poller::{StopFileSource, StopPoller, StopRequestSource};
