use crate::{NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Executing,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Idle => "idle",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Executing or paused: a loop owns (or is about to own) this run.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Executing | ExecutionStatus::Paused)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node failure recorded against a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorRecord {
    pub node_id: NodeId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything known about one workflow's current or most recent run.
///
/// This is the serializable part of a state record. The resume signal and
/// cancellation token live beside it in the store and never appear in
/// snapshots or checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionState {
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,

    /// Input the run was started with, needed to rebuild pipeline data
    #[serde(default)]
    pub input: Value,

    pub current_node_id: Option<NodeId>,
    pub current_node_index: Option<usize>,

    pub node_outputs: HashMap<NodeId, Value>,

    /// Completion order
    pub completed_node_ids: Vec<NodeId>,

    pub errors: Vec<NodeErrorRecord>,

    pub start_time: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Node a checkpoint restore or continuation resumed after
    #[serde(default)]
    pub resume_point: Option<NodeId>,

    pub force_stopped: bool,

    /// Last mutation, used by the staleness reaper
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecutionState {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            status: ExecutionStatus::Idle,
            input: Value::Null,
            current_node_id: None,
            current_node_index: None,
            node_outputs: HashMap::new(),
            completed_node_ids: Vec::new(),
            errors: Vec::new(),
            start_time: None,
            paused_at: None,
            resumed_at: None,
            stopped_at: None,
            completed_at: None,
            resume_point: None,
            force_stopped: false,
            updated_at: Utc::now(),
        }
    }

    pub fn has_completed(&self, node_id: NodeId) -> bool {
        self.completed_node_ids.contains(&node_id)
    }

    /// Record a successful node. Re-recording a node (a retry) keeps its
    /// original position in the completion order.
    pub fn record_output(&mut self, node_id: NodeId, output: Value) {
        self.node_outputs.insert(node_id, output);
        if !self.has_completed(node_id) {
            self.completed_node_ids.push(node_id);
        }
    }

    pub fn record_error(&mut self, node_id: NodeId, message: impl Into<String>) {
        self.errors.push(NodeErrorRecord {
            node_id,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn clear_errors_for(&mut self, node_id: NodeId) {
        self.errors.retain(|e| e.node_id != node_id);
    }

    pub fn error_for(&self, node_id: NodeId) -> Option<&NodeErrorRecord> {
        self.errors.iter().rev().find(|e| e.node_id == node_id)
    }
}

/// Snapshot taken right after a node succeeded.
///
/// `state` already reflects `output`, so resuming from a checkpoint never
/// re-runs its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub state: WorkflowExecutionState,
    pub output: Value,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        workflow_id: WorkflowId,
        node_id: NodeId,
        state: WorkflowExecutionState,
        output: Value,
    ) -> Self {
        Self {
            workflow_id,
            node_id,
            state,
            output,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn record_output_keeps_completion_order_on_retry() {
        let mut state = WorkflowExecutionState::new(Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        state.record_output(a, json!("first"));
        state.record_output(b, json!("second"));
        state.record_output(a, json!("again"));

        assert_eq!(state.completed_node_ids, vec![a, b]);
        assert_eq!(state.node_outputs[&a], json!("again"));
    }

    #[test]
    fn clearing_errors_only_touches_one_node() {
        let mut state = WorkflowExecutionState::new(Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        state.record_error(a, "timeout");
        state.record_error(b, "rate limited");

        state.clear_errors_for(a);

        assert!(state.error_for(a).is_none());
        assert_eq!(state.error_for(b).map(|e| e.message.as_str()), Some("rate limited"));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&ExecutionStatus::Paused).unwrap(), "\"paused\"");
        assert!(ExecutionStatus::Paused.is_active());
        assert!(!ExecutionStatus::Stopped.is_active());
    }
}
