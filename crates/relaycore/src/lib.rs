//! Core abstractions for the relay pipeline engine
//!
//! Data model for resumable pipeline runs (workflow definitions, execution
//! state, checkpoints, pipeline data), the `Node` / `NodeExecutor` seams, and
//! the event bus. Nothing in here schedules or stores anything.

mod error;
pub mod events;
mod execution;
mod node;
mod pipeline;
mod workflow;

pub use error::{NodeError, RelayError, WorkflowError};
pub use events::*;
pub use execution::{Checkpoint, ExecutionStatus, NodeErrorRecord, WorkflowExecutionState};
pub use node::{Node, NodeContext, NodeExecutor, NodeMetadata, NodeOutput};
pub use pipeline::PipelineData;
pub use workflow::{Edge, NodeId, NodeSpec, Position, Workflow, WorkflowId, WorkflowSettings};

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
